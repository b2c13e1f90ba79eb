use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SyncConfig;
use crate::credentials::TokenStore;
use crate::error::{ApiError, ApiResult};

const MAX_LOG_BODY_CHARS: usize = 512;

// ===== WIRE TYPES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsuarioApi {
    pub id: i64,
    pub nome: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUsuario {
    pub nome: String,
    pub email: String,
    pub senha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub senha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmadilhaApi {
    pub id: i64,
    pub nome: String,
    #[serde(default)]
    pub foto: Option<String>,
    #[serde(default)]
    pub data_foto: Option<String>,
    #[serde(default)]
    pub observacoes: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub criado_em: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalhaoApi {
    pub id: i64,
    pub nome: String,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ultima_coleta: Option<String>,
    #[serde(default)]
    pub total_pragas: Option<i64>,
    #[serde(default)]
    pub armadilhas_ativas: Option<i64>,
    #[serde(default)]
    pub center: Option<(f64, f64)>,
    #[serde(default)]
    pub boundary: Option<serde_json::Value>,
    #[serde(default)]
    pub pragas: Option<serde_json::Value>,
    /// Only guaranteed on the detail endpoint.
    #[serde(default)]
    pub armadilhas: Option<Vec<ArmadilhaApi>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTalhao {
    pub nome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pragas_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTalhao {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armadilhas_ativas: Option<i64>,
}

impl UpdateTalhao {
    pub fn is_empty(&self) -> bool {
        self.nome.is_none()
            && self.area.is_none()
            && self.status.is_none()
            && self.armadilhas_ativas.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateArmadilha {
    pub nome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observacao: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadRequest {
    pub data_url: String,
}

/// Upload confirmation. Some backend versions answer with the whole trap
/// instead of the flat pair, so both shapes are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadResponse {
    #[serde(default)]
    pub foto: Option<String>,
    #[serde(default)]
    pub data_foto: Option<String>,
    #[serde(default)]
    pub armadilha: Option<ArmadilhaApi>,
}

impl PhotoUploadResponse {
    pub fn confirmed_photo(&self) -> Option<&str> {
        self.foto
            .as_deref()
            .or_else(|| self.armadilha.as_ref().and_then(|a| a.foto.as_deref()))
    }

    pub fn confirmed_at(&self) -> Option<&str> {
        self.data_foto
            .as_deref()
            .or_else(|| self.armadilha.as_ref().and_then(|a| a.data_foto.as_deref()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    #[serde(default)]
    pub mensagem: Option<String>,
}

// ===== GATEWAY =====

/// Typed operations against the pest-monitoring REST backend.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn register_user(&self, user: &CreateUsuario) -> ApiResult<UsuarioApi>;
    async fn login(&self, credentials: &LoginRequest) -> ApiResult<LoginResponse>;
    async fn verify_token(&self, token: &str) -> ApiResult<()>;

    async fn list_fields(&self) -> ApiResult<Vec<TalhaoApi>>;
    async fn get_field(&self, field_id: i64) -> ApiResult<TalhaoApi>;
    async fn create_field(&self, field: &CreateTalhao) -> ApiResult<TalhaoApi>;
    async fn update_field(&self, field_id: i64, patch: &UpdateTalhao) -> ApiResult<TalhaoApi>;
    async fn delete_field(&self, field_id: i64) -> ApiResult<DeleteResponse>;

    async fn create_trap(&self, field_id: i64, trap: &CreateArmadilha) -> ApiResult<ArmadilhaApi>;
    async fn upload_trap_photo(
        &self,
        field_id: i64,
        trap_id: i64,
        data_url: &str,
    ) -> ApiResult<PhotoUploadResponse>;
}

/// `RemoteGateway` over HTTP with reqwest.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.tokens.provider_name())
            .finish()
    }
}

impl ApiClient {
    pub fn new(config: &SyncConfig, tokens: Arc<TokenStore>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.bearer() {
            Some(bearer) => builder.header(AUTHORIZATION, bearer),
            None => builder,
        }
    }

    async fn send_value(&self, builder: reqwest::RequestBuilder) -> ApiResult<serde_json::Value> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            debug!("API response error ({}): {}", status, preview(&body));
            return Err(ApiError::api(status.as_u16(), error_message(&body)));
        }
        debug!("API response status: {}", status);

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> ApiResult<T> {
        let value = self.send_value(builder).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl RemoteGateway for ApiClient {
    async fn register_user(&self, user: &CreateUsuario) -> ApiResult<UsuarioApi> {
        self.send(self.client.post(self.endpoint("usuarios")).json(user))
            .await
    }

    async fn login(&self, credentials: &LoginRequest) -> ApiResult<LoginResponse> {
        self.send(
            self.client
                .post(self.endpoint("usuarios/login"))
                .json(credentials),
        )
        .await
    }

    async fn verify_token(&self, token: &str) -> ApiResult<()> {
        if token.is_empty() {
            return Err(ApiError::auth("empty token"));
        }
        self.send_value(
            self.client
                .post(self.endpoint("usuarios/verificar"))
                .json(&serde_json::json!({ "token": token })),
        )
        .await
        .map(|_| ())
    }

    async fn list_fields(&self) -> ApiResult<Vec<TalhaoApi>> {
        self.send(self.authorized(self.client.get(self.endpoint("talhoes"))))
            .await
    }

    async fn get_field(&self, field_id: i64) -> ApiResult<TalhaoApi> {
        let url = self.endpoint(&format!("talhoes/{}", field_id));
        self.send(self.authorized(self.client.get(url))).await
    }

    async fn create_field(&self, field: &CreateTalhao) -> ApiResult<TalhaoApi> {
        if field.nome.trim().is_empty() {
            return Err(ApiError::invalid_request("field name is empty"));
        }
        self.send(self.authorized(self.client.post(self.endpoint("talhoes")).json(field)))
            .await
    }

    async fn update_field(&self, field_id: i64, patch: &UpdateTalhao) -> ApiResult<TalhaoApi> {
        let url = self.endpoint(&format!("talhoes/{}", field_id));
        self.send(self.authorized(self.client.put(url).json(patch)))
            .await
    }

    async fn delete_field(&self, field_id: i64) -> ApiResult<DeleteResponse> {
        let url = self.endpoint(&format!("talhoes/{}", field_id));
        let value = self.send_value(self.authorized(self.client.delete(url))).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn create_trap(&self, field_id: i64, trap: &CreateArmadilha) -> ApiResult<ArmadilhaApi> {
        let url = self.endpoint(&format!("talhoes/{}/armadilhas", field_id));
        self.send(self.authorized(self.client.post(url).json(trap)))
            .await
    }

    async fn upload_trap_photo(
        &self,
        field_id: i64,
        trap_id: i64,
        data_url: &str,
    ) -> ApiResult<PhotoUploadResponse> {
        let url = self.endpoint(&format!(
            "talhoes/{}/armadilhas/{}/foto",
            field_id, trap_id
        ));
        let body = PhotoUploadRequest {
            data_url: data_url.to_string(),
        };
        self.send(self.authorized(self.client.post(url).json(&body)))
            .await
    }
}

/// Picks the most useful message out of an error body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["mensagem", "message", "error"] {
            if let Some(message) = value.get(key).and_then(|m| m.as_str()) {
                return message.to_string();
            }
        }
    }
    preview(body)
}

fn preview(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}
