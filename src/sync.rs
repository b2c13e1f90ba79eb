//! Reconciliation between the local graph and the backend.
//!
//! A pass first pushes local-only entities (fields, then traps whose parent
//! is known remotely), then pulls every remote field and merges it by
//! remote id. Local-only data is never deleted by a pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ArmadilhaApi, CreateArmadilha, CreateTalhao, RemoteGateway, TalhaoApi};
use crate::error::ApiResult;
use crate::graph::EntityGraph;
use crate::models::{new_local_id, Field, Syncable, Trap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub fields_pushed: usize,
    pub traps_pushed: usize,
    pub fields_adopted: usize,
    pub fields_updated: usize,
    /// The pass stopped early because the backend could not be reached.
    pub aborted: bool,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    in_flight: AtomicBool,
}

/// Clears the flag on drop, including when the owning future is cancelled.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one pass. Returns `None` without doing anything when another
    /// pass is already in flight.
    pub async fn run(
        &self,
        graph: &EntityGraph,
        gateway: &dyn RemoteGateway,
    ) -> Option<ReconcileReport> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Reconciliation already in flight, skipping");
            return None;
        };

        let seen = graph.pass_marks();
        let mut report = ReconcileReport::default();
        let outcome = Self::pass(graph, gateway, &mut report).await;
        graph.clear_pass_marks(&seen);
        match outcome {
            Ok(()) => info!(
                "Reconciliation finished: {} fields pushed, {} traps pushed, {} adopted, {} updated",
                report.fields_pushed,
                report.traps_pushed,
                report.fields_adopted,
                report.fields_updated
            ),
            Err(e) => {
                warn!("Reconciliation aborted, keeping local data as-is: {}", e);
                report.aborted = true;
            }
        }
        Some(report)
    }

    async fn pass(
        graph: &EntityGraph,
        gateway: &dyn RemoteGateway,
        report: &mut ReconcileReport,
    ) -> ApiResult<()> {
        for local_id in graph.unsynced_field_ids() {
            match push_field(graph, gateway, &local_id).await {
                Ok(Some(_)) => report.fields_pushed += 1,
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!("Backend refused field {}: {}", local_id, e),
            }
        }

        for (field_local_id, trap_local_id) in graph.unsynced_trap_ids() {
            match push_trap(graph, gateway, &field_local_id, &trap_local_id).await {
                Ok(Some(_)) => report.traps_pushed += 1,
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!("Backend refused trap {}: {}", trap_local_id, e),
            }
        }

        let listed = gateway.list_fields().await?;
        for item in listed {
            let remote = match gateway.get_field(item.id).await {
                Ok(detail) => detail,
                Err(e) => {
                    debug!("Detail fetch for field {} failed, using list data: {}", item.id, e);
                    item
                }
            };
            match merge_remote_field(graph, &remote) {
                Merge::Adopted => report.fields_adopted += 1,
                Merge::Updated => report.fields_updated += 1,
                Merge::Deleted => debug!("Field {} was deleted during the pass", remote.id),
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Adopted,
    Updated,
    /// Deleted locally after the pass fetched it; left alone.
    Deleted,
}

/// Merges one remote field into the graph.
pub fn merge_remote_field(graph: &EntityGraph, remote: &TalhaoApi) -> Merge {
    graph.mutate(|fields| {
        if graph.is_deleted_field(remote.id) {
            return Merge::Deleted;
        }
        match fields.iter_mut().find(|f| f.remote_id == Some(remote.id)) {
            Some(local) => {
                local.name = remote.nome.clone();
                local.area = remote.area;
                local.status = remote.status.clone();
                if let Some(remote_traps) = &remote.armadilhas {
                    local.traps = merge_traps(&local.traps, remote_traps, &graph.adopted_traps());
                }
                Merge::Updated
            }
            None => {
                info!("Adopting remote field {} ({})", remote.id, remote.nome);
                fields.push(Field::from_remote(remote));
                Merge::Adopted
            }
        }
    })
}

/// The remote list is authoritative for confirmed traps. Local ids survive
/// by remote id, a photo still waiting for upload is kept, and local-only
/// traps are appended. A confirmed trap missing from the list is kept when
/// it was confirmed after the fetch (`adopted`) or still holds a local photo.
fn merge_traps(local: &[Trap], remote: &[ArmadilhaApi], adopted: &HashSet<String>) -> Vec<Trap> {
    let mut merged: Vec<Trap> = remote
        .iter()
        .map(|r| match local.iter().find(|t| t.remote_id == Some(r.id)) {
            Some(existing) => {
                let mut trap = Trap::from_remote(r, existing.local_id.clone());
                if existing.has_local_photo() {
                    trap.photo = existing.photo.clone();
                    trap.photo_taken_at = existing.photo_taken_at;
                }
                trap
            }
            None => Trap::from_remote(r, new_local_id()),
        })
        .collect();

    let listed: HashSet<i64> = remote.iter().map(|r| r.id).collect();
    merged.extend(
        local
            .iter()
            .filter(|t| match t.remote_id {
                None => true,
                Some(id) => {
                    !listed.contains(&id) && (adopted.contains(&t.local_id) || t.has_local_photo())
                }
            })
            .cloned(),
    );
    merged
}

enum Adoption {
    Applied(i64),
    Gone,
    Conflict(i64),
}

/// Creates a local-only field on the backend and records its remote id.
/// Returns the remote id now known for the field, or `None` when there is
/// nothing to do (already synced, deleted, or another create in flight).
pub async fn push_field(
    graph: &EntityGraph,
    gateway: &dyn RemoteGateway,
    local_id: &str,
) -> ApiResult<Option<i64>> {
    let Some(_claim) = graph.claim_remote_create(local_id) else {
        debug!("Remote create for field {} already in flight", local_id);
        return Ok(None);
    };
    let Some(field) = graph.field(local_id) else {
        return Ok(None);
    };
    if field.remote_id.is_some() {
        return Ok(field.remote_id);
    }

    let created = gateway
        .create_field(&CreateTalhao {
            nome: field.name.clone(),
            area: field.area,
            status: field.status.clone(),
            ..Default::default()
        })
        .await?;

    let adoption = graph.mutate(|fields| {
        if !fields.iter().any(|f| f.local_id == local_id) {
            return Adoption::Gone;
        }
        // a concurrent pass may already have adopted the new remote field
        let mut adopted_traps = Vec::new();
        fields.retain_mut(|f| {
            if f.local_id != local_id && f.remote_id == Some(created.id) {
                adopted_traps.append(&mut f.traps);
                return false;
            }
            true
        });
        let Some(field) = fields.iter_mut().find(|f| f.local_id == local_id) else {
            return Adoption::Gone;
        };
        if field.adopt_remote_id(created.id) {
            field.traps.extend(adopted_traps);
            Adoption::Applied(created.id)
        } else {
            Adoption::Conflict(field.remote_id.unwrap_or_default())
        }
    });

    match adoption {
        Adoption::Applied(id) => {
            info!("Field {} synchronized as remote {}", local_id, id);
            Ok(Some(id))
        }
        Adoption::Conflict(existing) => {
            warn!(
                "Field {} already bound to remote {}, ignoring new remote {}",
                local_id, existing, created.id
            );
            Ok(Some(existing))
        }
        Adoption::Gone => {
            // deleted while the create was in flight; don't let the next
            // pass resurrect it
            info!("Field {} deleted during remote create, removing remote {}", local_id, created.id);
            graph.mark_deleted_field(created.id);
            if let Err(e) = gateway.delete_field(created.id).await {
                warn!("Failed to remove orphaned remote field {}: {}", created.id, e);
            }
            Ok(None)
        }
    }
}

/// Creates a local-only trap on the backend once its field has a remote id.
/// Returns the remote id now known for the trap.
pub async fn push_trap(
    graph: &EntityGraph,
    gateway: &dyn RemoteGateway,
    field_local_id: &str,
    trap_local_id: &str,
) -> ApiResult<Option<i64>> {
    let Some(_claim) = graph.claim_remote_create(trap_local_id) else {
        debug!("Remote create for trap {} already in flight", trap_local_id);
        return Ok(None);
    };
    let Some(field) = graph.field(field_local_id) else {
        return Ok(None);
    };
    let Some(field_remote_id) = field.remote_id else {
        return Ok(None);
    };
    let Some(trap) = field.trap(trap_local_id) else {
        return Ok(None);
    };
    if trap.remote_id.is_some() {
        return Ok(trap.remote_id);
    }

    let created = gateway
        .create_trap(
            field_remote_id,
            &CreateArmadilha {
                nome: trap.name.clone(),
                observacao: trap.notes.clone(),
                ..Default::default()
            },
        )
        .await?;

    let applied = graph
        .update_field(field_local_id, |field| {
            field
                .traps
                .retain(|t| t.local_id == trap_local_id || t.remote_id != Some(created.id));
            let adopted = field
                .trap_mut(trap_local_id)
                .map(|trap| trap.adopt_remote_id(created.id));
            if adopted == Some(true) {
                graph.mark_adopted_trap(trap_local_id);
            }
            adopted
        })
        .flatten();

    match applied {
        Some(true) => {
            info!("Trap {} synchronized as remote {}", trap_local_id, created.id);
            Ok(Some(created.id))
        }
        Some(false) => {
            warn!("Trap {} already bound to a different remote id", trap_local_id);
            Ok(graph
                .locate_trap(field_local_id, trap_local_id)
                .and_then(|t| t.trap_remote_id))
        }
        None => {
            debug!("Trap {} deleted during remote create", trap_local_id);
            Ok(None)
        }
    }
}

/// Pushes a field and then any of its traps that are still local-only.
pub async fn push_field_tree(
    graph: &EntityGraph,
    gateway: &dyn RemoteGateway,
    local_id: &str,
) -> ApiResult<Option<i64>> {
    let Some(remote_id) = push_field(graph, gateway, local_id).await? else {
        return Ok(None);
    };
    let pending: Vec<String> = graph
        .field(local_id)
        .map(|f| {
            f.traps
                .iter()
                .filter(|t| !t.is_synced())
                .map(|t| t.local_id.clone())
                .collect()
        })
        .unwrap_or_default();
    for trap_local_id in pending {
        push_trap(graph, gateway, local_id, &trap_local_id).await?;
    }
    Ok(Some(remote_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_trap(id: i64, nome: &str, foto: Option<&str>) -> ArmadilhaApi {
        ArmadilhaApi {
            id,
            nome: nome.to_string(),
            foto: foto.map(str::to_string),
            data_foto: None,
            observacoes: None,
            latitude: None,
            longitude: None,
            criado_em: None,
        }
    }

    #[test]
    fn test_merge_traps_keeps_local_ids_and_pending_photos() {
        let mut confirmed = Trap::new("A1".to_string(), None);
        confirmed.remote_id = Some(10);
        confirmed.photo = Some("data:image/png;base64,AAA".to_string());
        let local_only = Trap::new("A9".to_string(), None);
        let mut stale = Trap::new("old".to_string(), None);
        stale.remote_id = Some(99);

        let merged = merge_traps(
            &[confirmed.clone(), local_only.clone(), stale],
            &[remote_trap(10, "A1 renamed", None), remote_trap(11, "A2", Some("https://cdn/a2.jpg"))],
            &HashSet::new(),
        );

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].local_id, confirmed.local_id);
        assert_eq!(merged[0].name, "A1 renamed");
        assert_eq!(merged[0].photo, confirmed.photo);
        assert_eq!(merged[1].remote_id, Some(11));
        assert_eq!(merged[2].local_id, local_only.local_id);
        assert!(merged.iter().all(|t| t.remote_id != Some(99)));
    }

    #[test]
    fn test_merge_traps_keeps_traps_confirmed_after_the_fetch() {
        let mut late = Trap::new("A2".to_string(), None);
        late.remote_id = Some(12);
        let mut photographed = Trap::new("A3".to_string(), None);
        photographed.remote_id = Some(13);
        photographed.photo = Some("data:image/png;base64,AAA".to_string());
        let adopted: HashSet<String> = [late.local_id.clone()].into_iter().collect();

        let merged = merge_traps(
            &[late.clone(), photographed.clone()],
            &[remote_trap(10, "A1", None)],
            &adopted,
        );

        let ids: Vec<_> = merged.iter().map(|t| t.local_id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&late.local_id.as_str()));
        assert!(ids.contains(&photographed.local_id.as_str()));
    }
}
