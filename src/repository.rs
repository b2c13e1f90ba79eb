//! The public facade over the local entity graph.
//!
//! Reads are served from memory. Writes commit locally first and then
//! propagate to the backend from detached tasks; remote failures are logged
//! and never reach the caller. Only a missing entity makes a write report
//! failure.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{RemoteGateway, UpdateTalhao};
use crate::config::SyncConfig;
use crate::graph::{lock, EntityGraph};
use crate::local_store::{KeyValueStore, SnapshotStore};
use crate::models::{Field, FieldPatch, PendingUpload, Trap, TrapPatch};
use crate::stats::{self, FieldShortfall, InspectionSummary, Totals};
use crate::sync::{push_field_tree, push_trap, ReconcileReport, Reconciler};
use crate::upload_queue::{DrainReport, UploadQueue};

struct Inner {
    graph: EntityGraph,
    queue: UploadQueue,
    reconciler: Reconciler,
    gateway: Arc<dyn RemoteGateway>,
    config: SyncConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the repository. Cheap to clone; all clones share one graph.
#[derive(Clone)]
pub struct EntityRepository {
    inner: Arc<Inner>,
}

impl EntityRepository {
    /// Loads the persisted graph and upload queue. No network traffic
    /// happens until `start` or `force_sync`. Fails when the local store
    /// cannot be read.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
    ) -> Result<Self> {
        let snapshots = SnapshotStore::new(store);
        let graph = EntityGraph::load(snapshots.clone())?;
        let queue = UploadQueue::load(snapshots, config.max_upload_retries)?;
        info!(
            "Repository opened with {} fields and {} pending uploads",
            graph.with_fields(|fields| fields.len()),
            queue.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                graph,
                queue,
                reconciler: Reconciler::new(),
                gateway,
                config,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Runs the startup reconciliation and then drains the upload queue on
    /// a fixed interval until the returned task is aborted. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = Duration::from_secs(inner.config.drain_interval_secs.max(1));
        tokio::spawn(async move {
            inner.reconciler.run(&inner.graph, inner.gateway.as_ref()).await;

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !inner.queue.is_empty() {
                    inner.queue.drain(&inner.graph, inner.gateway.as_ref()).await;
                }
            }
        })
    }

    // ===== READS =====

    pub fn list_fields(&self) -> Vec<Field> {
        self.inner.graph.fields()
    }

    pub fn get_field(&self, local_id: &str) -> Option<Field> {
        self.inner.graph.field(local_id)
    }

    pub fn pending_uploads(&self) -> Vec<PendingUpload> {
        self.inner.queue.items()
    }

    // ===== FIELDS =====

    /// Creates a field locally and registers it with the backend in the
    /// background. A failed registration is picked up by the next
    /// reconciliation pass.
    pub fn create_field(&self, name: impl Into<String>, location: Option<String>) -> Field {
        let field = Field::new(name.into(), location);
        self.inner.graph.insert_field(field.clone());
        debug!("Created field {} locally", field.local_id);

        let inner = self.inner.clone();
        let local_id = field.local_id.clone();
        self.spawn_background("field create", async move {
            if let Err(e) = push_field_tree(&inner.graph, inner.gateway.as_ref(), &local_id).await {
                warn!("Remote create for field {} failed, leaving it local: {}", local_id, e);
            }
        });
        field
    }

    pub fn update_field(&self, local_id: &str, patch: FieldPatch) -> bool {
        let Some(remote_id) = self.inner.graph.update_field(local_id, |field| {
            patch.apply(field);
            field.remote_id
        }) else {
            return false;
        };

        let body = patch.to_remote();
        if let (Some(remote_id), false) = (remote_id, body.is_empty()) {
            let inner = self.inner.clone();
            self.spawn_background("field update", async move {
                if let Err(e) = inner.gateway.update_field(remote_id, &body).await {
                    warn!("Remote update for field {} failed: {}", remote_id, e);
                }
            });
        }
        true
    }

    /// Deletes the field on the backend first when it has a remote id, then
    /// locally whatever the backend said.
    pub async fn delete_field(&self, local_id: &str) -> bool {
        let Some(field) = self.inner.graph.field(local_id) else {
            return false;
        };

        if let Some(remote_id) = field.remote_id {
            match self.inner.gateway.delete_field(remote_id).await {
                Ok(response) => debug!(
                    "Remote field {} deleted: {}",
                    remote_id,
                    response.mensagem.unwrap_or_default()
                ),
                Err(e) => warn!("Remote delete for field {} failed: {}", remote_id, e),
            }
        }

        let removed = self.inner.graph.remove_field(local_id).is_some();
        self.inner.queue.discard_field(local_id);
        removed
    }

    // ===== TRAPS =====

    pub fn create_trap(
        &self,
        field_local_id: &str,
        name: impl Into<String>,
        notes: Option<String>,
    ) -> Option<Trap> {
        let trap = Trap::new(name.into(), notes);
        let field_remote_id = self.inner.graph.add_trap(field_local_id, trap.clone())?;

        // without a remote parent the trap is pushed along with its field
        if field_remote_id.is_some() {
            let inner = self.inner.clone();
            let field_local_id = field_local_id.to_string();
            let trap_local_id = trap.local_id.clone();
            self.spawn_background("trap create", async move {
                if let Err(e) = push_trap(
                    &inner.graph,
                    inner.gateway.as_ref(),
                    &field_local_id,
                    &trap_local_id,
                )
                .await
                {
                    warn!("Remote create for trap {} failed, leaving it local: {}", trap_local_id, e);
                }
            });
        }
        Some(trap)
    }

    /// Local only; the backend has no trap update endpoint.
    pub fn update_trap(&self, field_local_id: &str, trap_local_id: &str, patch: TrapPatch) -> bool {
        self.inner
            .graph
            .update_trap(field_local_id, trap_local_id, |trap| patch.apply(trap))
            .is_some()
    }

    /// Removes the trap locally and reports the new active-trap count to the
    /// backend.
    pub fn delete_trap(&self, field_local_id: &str, trap_local_id: &str) -> bool {
        let Some((trap, field_remote_id, remaining)) =
            self.inner.graph.remove_trap(field_local_id, trap_local_id)
        else {
            return false;
        };
        self.inner.queue.discard_trap(&trap.local_id);

        if let (Some(field_remote_id), Some(_)) = (field_remote_id, trap.remote_id) {
            let body = UpdateTalhao {
                armadilhas_ativas: Some(remaining as i64),
                ..Default::default()
            };
            let inner = self.inner.clone();
            self.spawn_background("trap count update", async move {
                if let Err(e) = inner.gateway.update_field(field_remote_id, &body).await {
                    warn!("Failed to update trap count of field {}: {}", field_remote_id, e);
                }
            });
        }
        true
    }

    // ===== PHOTOS =====

    /// Stores the photo locally, then tries to upload it right away when
    /// both remote ids are known. Anything that cannot be delivered now is
    /// queued. Returns `false` only when the trap does not exist.
    pub async fn attach_photo(
        &self,
        field_local_id: &str,
        trap_local_id: &str,
        image_data: impl Into<String>,
    ) -> bool {
        let image_data = image_data.into();
        let Some(upload) = self.inner.graph.set_trap_photo(
            field_local_id,
            trap_local_id,
            &image_data,
            Utc::now(),
        ) else {
            return false;
        };
        self.inner.queue.discard_trap(trap_local_id);

        if let (Some(field_id), Some(trap_id)) = (upload.field_remote_id, upload.trap_remote_id) {
            match self
                .inner
                .gateway
                .upload_trap_photo(field_id, trap_id, &image_data)
                .await
            {
                Ok(response) => {
                    self.inner.graph.confirm_photo(
                        field_local_id,
                        trap_local_id,
                        &image_data,
                        &response,
                    );
                    return true;
                }
                Err(e) => warn!("Photo upload for trap {} failed, queueing: {}", trap_local_id, e),
            }
        }

        // a newer photo taken during the upload owns the queue slot
        let still_current = self
            .inner
            .graph
            .locate_trap(field_local_id, trap_local_id)
            .map(|location| location.photo.as_deref() == Some(image_data.as_str()))
            .unwrap_or(false);
        if still_current {
            self.inner.queue.enqueue(upload);
        }
        true
    }

    pub fn clear_photo(&self, field_local_id: &str, trap_local_id: &str) -> bool {
        let cleared = self
            .inner
            .graph
            .update_trap(field_local_id, trap_local_id, |trap| {
                trap.photo = None;
                trap.photo_taken_at = None;
            })
            .is_some();
        if cleared {
            self.inner.queue.discard_trap(trap_local_id);
        }
        cleared
    }

    // ===== SYNC =====

    /// Runs a full reconciliation pass. Returns `None` when a pass was
    /// already running.
    pub async fn force_sync(&self) -> Option<ReconcileReport> {
        self.inner
            .reconciler
            .run(&self.inner.graph, self.inner.gateway.as_ref())
            .await
    }

    pub async fn drain_uploads(&self) -> DrainReport {
        self.inner
            .queue
            .drain(&self.inner.graph, self.inner.gateway.as_ref())
            .await
    }

    /// Waits until every background task spawned so far, and any task
    /// those spawned, has finished.
    pub async fn wait_for_background(&self) {
        loop {
            let pending = std::mem::take(&mut *lock(&self.inner.tasks));
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
    }

    fn spawn_background<F>(&self, what: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                let mut tasks = lock(&self.inner.tasks);
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle.spawn(task));
            }
            Err(_) => warn!("No async runtime, {} deferred to the next sync", what),
        }
    }

    // ===== STATISTICS =====

    pub fn missing_photo_count(&self) -> usize {
        self.inner.graph.with_fields(stats::missing_photo_count)
    }

    pub fn completion_rate(&self) -> f64 {
        self.inner.graph.with_fields(stats::completion_rate)
    }

    pub fn missing_by_field(&self) -> Vec<FieldShortfall> {
        self.inner.graph.with_fields(stats::missing_by_field)
    }

    pub fn totals(&self) -> Totals {
        self.inner.graph.with_fields(stats::totals)
    }

    pub fn summary(&self) -> InspectionSummary {
        self.inner.graph.with_fields(stats::summarize)
    }
}
