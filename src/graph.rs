//! In-memory Field/Trap graph mirrored to the local store.
//!
//! Every mutation runs under the graph lock and rewrites the snapshot before
//! the lock is released, so snapshots are written in mutation order. The
//! lock is never held across an `.await`.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::client::PhotoUploadResponse;
use crate::local_store::SnapshotStore;
use crate::models::{parse_timestamp, Field, PendingUpload, Trap};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where a trap currently lives and which identities it has.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapLocation {
    pub field_local_id: String,
    pub field_remote_id: Option<i64>,
    pub trap_local_id: String,
    pub trap_remote_id: Option<i64>,
    pub photo: Option<String>,
}

pub struct EntityGraph {
    fields: Mutex<Vec<Field>>,
    snapshots: SnapshotStore,
    remote_creates: Mutex<HashSet<String>>,
    marks: Mutex<PassMarks>,
}

/// Local changes a reconciliation pass must not undo with data it fetched
/// earlier: remote fields deleted here, and traps that received their
/// remote id after the fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassMarks {
    pub deleted_fields: HashSet<i64>,
    pub adopted_traps: HashSet<String>,
}

/// Exclusive right to issue the remote create call for one local entity.
/// Released on drop.
pub struct CreateClaim<'a> {
    graph: &'a EntityGraph,
    local_id: String,
}

impl Drop for CreateClaim<'_> {
    fn drop(&mut self) {
        lock(&self.graph.remote_creates).remove(&self.local_id);
    }
}

impl EntityGraph {
    pub fn load(snapshots: SnapshotStore) -> Result<Self> {
        let fields = snapshots.load_fields()?;
        Ok(Self {
            fields: Mutex::new(fields),
            snapshots,
            remote_creates: Mutex::new(HashSet::new()),
            marks: Mutex::new(PassMarks::default()),
        })
    }

    pub fn fields(&self) -> Vec<Field> {
        lock(&self.fields).clone()
    }

    pub fn field(&self, local_id: &str) -> Option<Field> {
        lock(&self.fields)
            .iter()
            .find(|f| f.local_id == local_id)
            .cloned()
    }

    /// Read-only access without cloning the graph.
    pub fn with_fields<R>(&self, f: impl FnOnce(&[Field]) -> R) -> R {
        f(&lock(&self.fields))
    }

    /// Applies `f` to the whole graph and persists the result.
    pub fn mutate<R>(&self, apply: impl FnOnce(&mut Vec<Field>) -> R) -> R {
        let mut fields = lock(&self.fields);
        let result = apply(&mut fields);
        self.persist(&fields);
        result
    }

    pub fn insert_field(&self, field: Field) {
        self.mutate(|fields| fields.push(field));
    }

    /// Applies `f` to one field. Nothing is persisted when the field is missing.
    pub fn update_field<R>(&self, local_id: &str, apply: impl FnOnce(&mut Field) -> R) -> Option<R> {
        let mut fields = lock(&self.fields);
        let field = fields.iter_mut().find(|f| f.local_id == local_id)?;
        let result = apply(field);
        self.persist(&fields);
        Some(result)
    }

    /// Removes a field. A removed remote id is remembered so a pass that
    /// listed it before the delete does not adopt it again.
    pub fn remove_field(&self, local_id: &str) -> Option<Field> {
        let mut fields = lock(&self.fields);
        let index = fields.iter().position(|f| f.local_id == local_id)?;
        let removed = fields.remove(index);
        if let Some(remote_id) = removed.remote_id {
            self.mark_deleted_field(remote_id);
        }
        self.persist(&fields);
        Some(removed)
    }

    /// Appends a trap and returns the parent's remote id.
    pub fn add_trap(&self, field_local_id: &str, trap: Trap) -> Option<Option<i64>> {
        self.update_field(field_local_id, |field| {
            field.traps.push(trap);
            field.remote_id
        })
    }

    pub fn update_trap<R>(
        &self,
        field_local_id: &str,
        trap_local_id: &str,
        apply: impl FnOnce(&mut Trap) -> R,
    ) -> Option<R> {
        let mut fields = lock(&self.fields);
        let trap = fields
            .iter_mut()
            .find(|f| f.local_id == field_local_id)?
            .trap_mut(trap_local_id)?;
        let result = apply(trap);
        self.persist(&fields);
        Some(result)
    }

    /// Removes a trap. Returns it with the parent's remote id and the number
    /// of traps left in the field.
    pub fn remove_trap(
        &self,
        field_local_id: &str,
        trap_local_id: &str,
    ) -> Option<(Trap, Option<i64>, usize)> {
        let mut fields = lock(&self.fields);
        let field = fields.iter_mut().find(|f| f.local_id == field_local_id)?;
        let index = field.traps.iter().position(|t| t.local_id == trap_local_id)?;
        let removed = field.traps.remove(index);
        let outcome = (removed, field.remote_id, field.traps.len());
        self.persist(&fields);
        Some(outcome)
    }

    /// Stores a freshly captured photo and returns the upload it implies.
    pub fn set_trap_photo(
        &self,
        field_local_id: &str,
        trap_local_id: &str,
        image_data: &str,
        taken_at: DateTime<Utc>,
    ) -> Option<PendingUpload> {
        let mut fields = lock(&self.fields);
        let field = fields.iter_mut().find(|f| f.local_id == field_local_id)?;
        let field_remote_id = field.remote_id;
        let field_local = field.local_id.clone();
        let trap = field.trap_mut(trap_local_id)?;
        trap.photo = Some(image_data.to_string());
        trap.photo_taken_at = Some(taken_at);

        let upload = PendingUpload::new(&field_local, field_remote_id, trap, image_data.to_string());
        self.persist(&fields);
        Some(upload)
    }

    /// Replaces the local data-URI with the backend's confirmed photo, but
    /// only if the trap still shows the image that was uploaded.
    pub fn confirm_photo(
        &self,
        field_local_id: &str,
        trap_local_id: &str,
        uploaded: &str,
        response: &PhotoUploadResponse,
    ) -> bool {
        let Some(confirmed) = response.confirmed_photo() else {
            return false;
        };
        self.update_trap(field_local_id, trap_local_id, |trap| {
            if trap.photo.as_deref() != Some(uploaded) {
                return false;
            }
            trap.photo = Some(confirmed.to_string());
            if let Some(at) = response.confirmed_at().and_then(parse_timestamp) {
                trap.photo_taken_at = Some(at);
            }
            true
        })
        .unwrap_or(false)
    }

    pub fn locate_trap(&self, field_local_id: &str, trap_local_id: &str) -> Option<TrapLocation> {
        let fields = lock(&self.fields);
        let field = fields.iter().find(|f| f.local_id == field_local_id)?;
        let trap = field.trap(trap_local_id)?;
        Some(TrapLocation {
            field_local_id: field.local_id.clone(),
            field_remote_id: field.remote_id,
            trap_local_id: trap.local_id.clone(),
            trap_remote_id: trap.remote_id,
            photo: trap.photo.clone(),
        })
    }

    pub fn unsynced_field_ids(&self) -> Vec<String> {
        lock(&self.fields)
            .iter()
            .filter(|f| f.remote_id.is_none())
            .map(|f| f.local_id.clone())
            .collect()
    }

    /// `(field local id, trap local id)` for local-only traps whose parent
    /// is already known to the backend.
    pub fn unsynced_trap_ids(&self) -> Vec<(String, String)> {
        lock(&self.fields)
            .iter()
            .filter(|f| f.remote_id.is_some())
            .flat_map(|f| {
                f.traps
                    .iter()
                    .filter(|t| t.remote_id.is_none())
                    .map(move |t| (f.local_id.clone(), t.local_id.clone()))
            })
            .collect()
    }

    /// Returns `None` when a remote create for this entity is already in flight.
    pub fn claim_remote_create(&self, local_id: &str) -> Option<CreateClaim<'_>> {
        let mut in_flight = lock(&self.remote_creates);
        if !in_flight.insert(local_id.to_string()) {
            return None;
        }
        Some(CreateClaim {
            graph: self,
            local_id: local_id.to_string(),
        })
    }

    // ===== PASS MARKS =====

    pub fn mark_deleted_field(&self, remote_id: i64) {
        lock(&self.marks).deleted_fields.insert(remote_id);
    }

    pub fn is_deleted_field(&self, remote_id: i64) -> bool {
        lock(&self.marks).deleted_fields.contains(&remote_id)
    }

    pub fn mark_adopted_trap(&self, trap_local_id: &str) {
        lock(&self.marks)
            .adopted_traps
            .insert(trap_local_id.to_string());
    }

    pub fn adopted_traps(&self) -> HashSet<String> {
        lock(&self.marks).adopted_traps.clone()
    }

    pub fn pass_marks(&self) -> PassMarks {
        lock(&self.marks).clone()
    }

    /// Forgets the marks a finished pass already saw at its start; marks
    /// made while it ran stay for the next pass.
    pub fn clear_pass_marks(&self, seen: &PassMarks) {
        let mut marks = lock(&self.marks);
        marks.deleted_fields.retain(|id| !seen.deleted_fields.contains(id));
        marks.adopted_traps.retain(|id| !seen.adopted_traps.contains(id));
    }

    fn persist(&self, fields: &[Field]) {
        if let Err(e) = self.snapshots.save_fields(fields) {
            error!("Failed to persist field snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryStore;
    use std::sync::Arc;

    fn graph() -> (EntityGraph, SnapshotStore) {
        let snapshots = SnapshotStore::new(Arc::new(MemoryStore::new()));
        (EntityGraph::load(snapshots.clone()).unwrap(), snapshots)
    }

    #[test]
    fn test_mutations_are_mirrored_to_the_snapshot() {
        let (graph, snapshots) = graph();
        let field = Field::new("Talhão A".to_string(), None);
        let id = field.local_id.clone();
        graph.insert_field(field);
        graph.add_trap(&id, Trap::new("A1".to_string(), None));

        let stored = snapshots.load_fields().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].traps.len(), 1);

        assert!(graph.remove_field(&id).is_some());
        assert!(snapshots.load_fields().unwrap().is_empty());
    }

    #[test]
    fn test_pass_marks_outlive_the_pass_that_missed_them() {
        let (graph, _) = graph();
        let mut field = Field::new("Talhão A".to_string(), None);
        field.remote_id = Some(7);
        let id = field.local_id.clone();
        graph.insert_field(field);

        let seen = graph.pass_marks();
        graph.remove_field(&id);
        graph.mark_adopted_trap("t1");
        assert!(graph.is_deleted_field(7));

        // the running pass started before the delete, so the mark stays
        graph.clear_pass_marks(&seen);
        assert!(graph.is_deleted_field(7));
        assert!(graph.adopted_traps().contains("t1"));

        let seen = graph.pass_marks();
        graph.clear_pass_marks(&seen);
        assert!(!graph.is_deleted_field(7));
        assert!(graph.adopted_traps().is_empty());
    }

    #[test]
    fn test_claims_are_exclusive_until_dropped() {
        let (graph, _) = graph();
        let claim = graph.claim_remote_create("abc");
        assert!(claim.is_some());
        assert!(graph.claim_remote_create("abc").is_none());
        drop(claim);
        assert!(graph.claim_remote_create("abc").is_some());
    }

    #[test]
    fn test_confirm_photo_ignores_superseded_image() {
        let (graph, _) = graph();
        let mut field = Field::new("Talhão A".to_string(), None);
        let trap = Trap::new("A1".to_string(), None);
        let (field_id, trap_id) = (field.local_id.clone(), trap.local_id.clone());
        field.traps.push(trap);
        graph.insert_field(field);

        graph.set_trap_photo(&field_id, &trap_id, "data:image/png;base64,NEW", Utc::now());
        let response = PhotoUploadResponse {
            foto: Some("https://cdn/old.jpg".to_string()),
            ..Default::default()
        };
        assert!(!graph.confirm_photo(&field_id, &trap_id, "data:image/png;base64,OLD", &response));
        assert!(graph.confirm_photo(&field_id, &trap_id, "data:image/png;base64,NEW", &response));
        let location = graph.locate_trap(&field_id, &trap_id).unwrap();
        assert_eq!(location.photo.as_deref(), Some("https://cdn/old.jpg"));
    }
}
