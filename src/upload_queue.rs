//! Durable queue of photo uploads that could not complete synchronously.
//!
//! Each drain works on a snapshot of the queue taken at its start; items
//! enqueued meanwhile wait for the next cycle. Before and after every
//! upload the live queue is consulted again, so an item superseded by a
//! newer photo of the same trap is never uploaded or applied.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::RemoteGateway;
use crate::graph::{lock, EntityGraph};
use crate::local_store::SnapshotStore;
use crate::models::PendingUpload;
use crate::sync::{push_trap, InFlight};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    pub skipped: usize,
}

pub struct UploadQueue {
    items: Mutex<Vec<PendingUpload>>,
    snapshots: SnapshotStore,
    max_retries: u32,
    draining: AtomicBool,
}

enum Outcome {
    Delivered,
    Failed,
    Skipped,
}

impl UploadQueue {
    pub fn load(snapshots: SnapshotStore, max_retries: u32) -> Result<Self> {
        let items = snapshots.load_pending_uploads()?;
        if !items.is_empty() {
            info!("Restored {} pending photo uploads", items.len());
        }
        Ok(Self {
            items: Mutex::new(items),
            snapshots,
            max_retries,
            draining: AtomicBool::new(false),
        })
    }

    pub fn items(&self) -> Vec<PendingUpload> {
        lock(&self.items).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues an upload. An older upload for the same trap is replaced.
    pub fn enqueue(&self, upload: PendingUpload) {
        let mut items = lock(&self.items);
        items.retain(|item| item.trap_local_id != upload.trap_local_id);
        debug!("Queued photo upload for trap {}", upload.trap_local_id);
        items.push(upload);
        self.persist(&items);
    }

    /// Drops whatever is queued for a trap. Returns whether anything was.
    pub fn discard_trap(&self, trap_local_id: &str) -> bool {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|item| item.trap_local_id != trap_local_id);
        let changed = items.len() != before;
        if changed {
            self.persist(&items);
        }
        changed
    }

    pub fn discard_field(&self, field_local_id: &str) {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|item| item.field_local_id != field_local_id);
        if items.len() != before {
            self.persist(&items);
        }
    }

    /// Runs one drain cycle. A cycle requested while another is running is
    /// skipped.
    pub async fn drain(&self, graph: &EntityGraph, gateway: &dyn RemoteGateway) -> DrainReport {
        let mut report = DrainReport::default();
        let Some(_guard) = InFlight::acquire(&self.draining) else {
            debug!("Upload drain already running");
            return report;
        };

        let snapshot = self.items();
        for item in snapshot {
            match self.process(&item, graph, gateway).await {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => {
                    if self.record_failure(&item) {
                        report.dropped += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            info!(
                "Upload drain: {} delivered, {} failed, {} dropped, {} skipped",
                report.delivered, report.failed, report.dropped, report.skipped
            );
        }
        report
    }

    async fn process(
        &self,
        item: &PendingUpload,
        graph: &EntityGraph,
        gateway: &dyn RemoteGateway,
    ) -> Outcome {
        if !self.is_current(item) {
            return Outcome::Skipped;
        }
        let Some(location) = graph.locate_trap(&item.field_local_id, &item.trap_local_id) else {
            debug!("Trap {} no longer exists, dropping its upload", item.trap_local_id);
            self.remove_if_current(item);
            return Outcome::Skipped;
        };

        let field_remote_id = location.field_remote_id.or(item.field_remote_id);
        let mut trap_remote_id = location.trap_remote_id.or(item.trap_remote_id);

        if trap_remote_id.is_none() && field_remote_id.is_some() {
            match push_trap(graph, gateway, &item.field_local_id, &item.trap_local_id).await {
                Ok(Some(id)) => {
                    trap_remote_id = Some(id);
                    self.record_remote_ids(item, field_remote_id, Some(id));
                }
                Ok(None) => {}
                Err(e) => warn!("Lazy registration of trap {} failed: {}", item.trap_local_id, e),
            }
        }

        let (Some(field_id), Some(trap_id)) = (field_remote_id, trap_remote_id) else {
            debug!("Trap {} has no remote identity yet", item.trap_local_id);
            return Outcome::Failed;
        };

        // the user may have taken another photo while we were registering
        if !self.is_current(item) {
            return Outcome::Skipped;
        }

        match gateway.upload_trap_photo(field_id, trap_id, &item.image_data).await {
            Ok(response) => {
                graph.confirm_photo(
                    &item.field_local_id,
                    &item.trap_local_id,
                    &item.image_data,
                    &response,
                );
                self.remove_if_current(item);
                Outcome::Delivered
            }
            Err(e) => {
                warn!("Photo upload for trap {} failed: {}", item.trap_local_id, e);
                Outcome::Failed
            }
        }
    }

    fn is_current(&self, item: &PendingUpload) -> bool {
        lock(&self.items).iter().any(|queued| queued.is_same_upload(item))
    }

    fn remove_if_current(&self, item: &PendingUpload) {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|queued| !queued.is_same_upload(item));
        if items.len() != before {
            self.persist(&items);
        }
    }

    fn record_remote_ids(&self, item: &PendingUpload, field: Option<i64>, trap: Option<i64>) {
        let mut items = lock(&self.items);
        if let Some(queued) = items.iter_mut().find(|queued| queued.is_same_upload(item)) {
            queued.field_remote_id = field;
            queued.trap_remote_id = trap;
            self.persist(&items);
        }
    }

    /// Counts a failed attempt. Returns `true` when the item exceeded the
    /// retry ceiling and was dropped.
    fn record_failure(&self, item: &PendingUpload) -> bool {
        let mut items = lock(&self.items);
        let Some(index) = items.iter().position(|queued| queued.is_same_upload(item)) else {
            return false;
        };

        items[index].retry_count += 1;
        let dropped = items[index].retry_count > self.max_retries;
        if dropped {
            let gone = items.remove(index);
            warn!(
                "Giving up on photo upload for trap {} after {} attempts; photo stays local",
                gone.trap_local_id, gone.retry_count
            );
        }
        self.persist(&items);
        dropped
    }

    fn persist(&self, items: &[PendingUpload]) {
        if let Err(e) = self.snapshots.save_pending_uploads(items) {
            error!("Failed to persist upload queue: {}", e);
        }
    }
}
