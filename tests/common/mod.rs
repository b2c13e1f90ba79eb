#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use trap_sync::client::{
    ArmadilhaApi, CreateArmadilha, CreateTalhao, CreateUsuario, DeleteResponse, LoginRequest,
    LoginResponse, PhotoUploadResponse, RemoteGateway, TalhaoApi, UpdateTalhao, UsuarioApi,
};
use trap_sync::config::SyncConfig;
use trap_sync::error::{ApiError, ApiResult};
use trap_sync::local_store::MemoryStore;
use trap_sync::repository::EntityRepository;

pub const VALID_TOKEN: &str = "valid-token";
pub const PASSWORD: &str = "secret";

#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub field_id: i64,
    pub trap_id: i64,
    pub data_url: String,
}

struct RemoteState {
    next_id: i64,
    fields: BTreeMap<i64, TalhaoApi>,
    calls: Vec<String>,
    uploads: Vec<Upload>,
    updates: Vec<(i64, UpdateTalhao)>,
}

/// In-process stand-in for the REST backend. It can be switched offline,
/// made to fail individual operations, or made to hold an operation until
/// the test releases it.
pub struct MockGateway {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    failing: Mutex<HashMap<&'static str, u16>>,
    gates: Mutex<HashMap<&'static str, Arc<Notify>>>,
}

impl MockGateway {
    pub fn online() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState {
                next_id: 1,
                fields: BTreeMap::new(),
                calls: Vec::new(),
                uploads: Vec::new(),
                updates: Vec::new(),
            }),
            online: AtomicBool::new(true),
            failing: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn offline() -> Arc<Self> {
        let mock = Self::online();
        mock.set_online(false);
        mock
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_next_id(&self, id: i64) {
        self.state.lock().unwrap().next_id = id;
    }

    /// Makes `op` answer with the given HTTP status until `recover` is called.
    pub fn fail(&self, op: &'static str, status: u16) {
        self.failing.lock().unwrap().insert(op, status);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    /// Holds every `op` call until the returned handle is notified.
    pub fn hold(&self, op: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(op, gate.clone());
        gate
    }

    pub fn release(&self, op: &'static str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(op) {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    /// Creates a field on the "server" with the given traps.
    pub fn seed_field(&self, nome: &str, traps: &[&str]) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.take_id();
        let armadilhas = traps
            .iter()
            .map(|nome| {
                let trap_id = state.take_id();
                remote_trap(trap_id, nome)
            })
            .collect::<Vec<_>>();
        state.fields.insert(
            id,
            TalhaoApi {
                id,
                nome: nome.to_string(),
                area: Some(10.0),
                status: Some("ativo".to_string()),
                ultima_coleta: None,
                total_pragas: None,
                armadilhas_ativas: Some(armadilhas.len() as i64),
                center: None,
                boundary: None,
                pragas: None,
                armadilhas: Some(armadilhas),
            },
        );
        id
    }

    pub fn rename_remote_field(&self, id: i64, nome: &str) {
        if let Some(field) = self.state.lock().unwrap().fields.get_mut(&id) {
            field.nome = nome.to_string();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call_prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(call_prefix))
            .count()
    }

    pub fn count_exact(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn updates(&self) -> Vec<(i64, UpdateTalhao)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn remote_field(&self, id: i64) -> Option<TalhaoApi> {
        self.state.lock().unwrap().fields.get(&id).cloned()
    }

    pub fn remote_field_count(&self) -> usize {
        self.state.lock().unwrap().fields.len()
    }

    /// Records the call and decides whether it goes through.
    fn begin(&self, op: &'static str, call: String) -> ApiResult<Option<Arc<Notify>>> {
        self.state.lock().unwrap().calls.push(call);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ApiError::unreachable("connection refused"));
        }
        if let Some(status) = self.failing.lock().unwrap().get(op) {
            return Err(ApiError::api(*status, format!("{} failed", op)));
        }
        Ok(self.gates.lock().unwrap().get(op).cloned())
    }

    async fn enter(&self, op: &'static str, call: String) -> ApiResult<()> {
        if let Some(gate) = self.begin(op, call)? {
            gate.notified().await;
        }
        Ok(())
    }
}

impl RemoteState {
    fn take_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn remote_trap(id: i64, nome: &str) -> ArmadilhaApi {
    ArmadilhaApi {
        id,
        nome: nome.to_string(),
        foto: None,
        data_foto: None,
        observacoes: None,
        latitude: None,
        longitude: None,
        criado_em: Some(Utc::now().to_rfc3339()),
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::api(404, format!("{} não encontrado", what))
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn register_user(&self, user: &CreateUsuario) -> ApiResult<UsuarioApi> {
        self.enter("register", "POST /usuarios".to_string()).await?;
        let id = self.state.lock().unwrap().take_id();
        Ok(UsuarioApi {
            id,
            nome: user.nome.clone(),
            email: user.email.clone(),
        })
    }

    async fn login(&self, credentials: &LoginRequest) -> ApiResult<LoginResponse> {
        self.enter("login", "POST /usuarios/login".to_string()).await?;
        if credentials.senha != PASSWORD {
            return Err(ApiError::api(401, "Credenciais inválidas"));
        }
        Ok(LoginResponse {
            token: VALID_TOKEN.to_string(),
        })
    }

    async fn verify_token(&self, token: &str) -> ApiResult<()> {
        self.enter("verify", "POST /usuarios/verificar".to_string()).await?;
        if token != VALID_TOKEN {
            return Err(ApiError::api(401, "Token inválido"));
        }
        Ok(())
    }

    async fn list_fields(&self) -> ApiResult<Vec<TalhaoApi>> {
        self.enter("list", "GET /talhoes".to_string()).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .fields
            .values()
            .map(|f| TalhaoApi {
                armadilhas: None,
                ..f.clone()
            })
            .collect())
    }

    async fn get_field(&self, field_id: i64) -> ApiResult<TalhaoApi> {
        let gate = self.begin("detail", format!("GET /talhoes/{}", field_id))?;
        // answered as of arrival, even when the response is held back
        let detail = self.remote_field(field_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        detail.ok_or_else(|| not_found("Talhão"))
    }

    async fn create_field(&self, field: &CreateTalhao) -> ApiResult<TalhaoApi> {
        self.enter("create_field", "POST /talhoes".to_string()).await?;
        let mut state = self.state.lock().unwrap();
        let id = state.take_id();
        let created = TalhaoApi {
            id,
            nome: field.nome.clone(),
            area: field.area,
            status: field.status.clone(),
            ultima_coleta: None,
            total_pragas: None,
            armadilhas_ativas: Some(0),
            center: None,
            boundary: None,
            pragas: None,
            armadilhas: Some(Vec::new()),
        };
        state.fields.insert(id, created.clone());
        Ok(created)
    }

    async fn update_field(&self, field_id: i64, patch: &UpdateTalhao) -> ApiResult<TalhaoApi> {
        self.enter("update_field", format!("PUT /talhoes/{}", field_id)).await?;
        let mut state = self.state.lock().unwrap();
        state.updates.push((field_id, patch.clone()));
        let field = state
            .fields
            .get_mut(&field_id)
            .ok_or_else(|| not_found("Talhão"))?;
        if let Some(nome) = &patch.nome {
            field.nome = nome.clone();
        }
        if let Some(area) = patch.area {
            field.area = Some(area);
        }
        if let Some(status) = &patch.status {
            field.status = Some(status.clone());
        }
        if let Some(count) = patch.armadilhas_ativas {
            field.armadilhas_ativas = Some(count);
        }
        Ok(field.clone())
    }

    async fn delete_field(&self, field_id: i64) -> ApiResult<DeleteResponse> {
        self.enter("delete_field", format!("DELETE /talhoes/{}", field_id)).await?;
        let mut state = self.state.lock().unwrap();
        state
            .fields
            .remove(&field_id)
            .ok_or_else(|| not_found("Talhão"))?;
        Ok(DeleteResponse {
            mensagem: Some("Talhão removido".to_string()),
        })
    }

    async fn create_trap(&self, field_id: i64, trap: &CreateArmadilha) -> ApiResult<ArmadilhaApi> {
        self.enter("create_trap", format!("POST /talhoes/{}/armadilhas", field_id))
            .await?;
        let mut state = self.state.lock().unwrap();
        if !state.fields.contains_key(&field_id) {
            return Err(not_found("Talhão"));
        }
        let id = state.take_id();
        let mut created = remote_trap(id, &trap.nome);
        created.observacoes = trap.observacao.clone();
        if let Some(field) = state.fields.get_mut(&field_id) {
            field
                .armadilhas
                .get_or_insert_with(Vec::new)
                .push(created.clone());
        }
        Ok(created)
    }

    async fn upload_trap_photo(
        &self,
        field_id: i64,
        trap_id: i64,
        data_url: &str,
    ) -> ApiResult<PhotoUploadResponse> {
        self.enter(
            "upload",
            format!("POST /talhoes/{}/armadilhas/{}/foto", field_id, trap_id),
        )
        .await?;
        let mut state = self.state.lock().unwrap();
        let foto = format!("https://cdn.example/talhoes/{}/armadilhas/{}.jpg", field_id, trap_id);
        let data_foto = Utc::now().to_rfc3339();
        let trap = state
            .fields
            .get_mut(&field_id)
            .and_then(|f| f.armadilhas.as_mut())
            .and_then(|traps| traps.iter_mut().find(|t| t.id == trap_id))
            .ok_or_else(|| not_found("Armadilha"))?;
        trap.foto = Some(foto.clone());
        trap.data_foto = Some(data_foto.clone());
        state.uploads.push(Upload {
            field_id,
            trap_id,
            data_url: data_url.to_string(),
        });
        Ok(PhotoUploadResponse {
            foto: Some(foto),
            data_foto: Some(data_foto),
            armadilha: None,
        })
    }
}

pub fn repository(mock: &Arc<MockGateway>) -> (EntityRepository, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let repo = EntityRepository::open(store.clone(), mock.clone(), SyncConfig::default()).unwrap();
    (repo, store)
}

/// Lets spawned tasks run until `call` has been issued.
pub async fn wait_for_call(mock: &MockGateway, call: &str) {
    for _ in 0..1000 {
        if mock.calls().iter().any(|c| c == call) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{} was never called; calls: {:?}", call, mock.calls());
}
