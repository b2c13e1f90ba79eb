use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{ArmadilhaApi, TalhaoApi, UpdateTalhao};

// ===== TRAITS =====

/// An entity that lives locally first and may later be adopted by the backend.
pub trait Syncable {
    fn local_id(&self) -> &str;
    fn remote_id(&self) -> Option<i64>;
    fn remote_id_slot(&mut self) -> &mut Option<i64>;

    fn is_synced(&self) -> bool {
        self.remote_id().is_some()
    }

    /// Records the backend identity. A remote id is set at most once; a
    /// second, different id is refused and `false` is returned.
    fn adopt_remote_id(&mut self, id: i64) -> bool {
        let slot = self.remote_id_slot();
        match *slot {
            None => {
                *slot = Some(id);
                true
            }
            Some(existing) => existing == id,
        }
    }
}

/// Generates a client-side identifier. Stable for the life of the entity.
pub fn new_local_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ===== ENTITIES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trap {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Either a local base64 data-URI or the backend URL once confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_taken_at: Option<DateTime<Utc>>,
}

impl Trap {
    pub fn new(name: String, notes: Option<String>) -> Self {
        Self {
            local_id: new_local_id(),
            remote_id: None,
            name,
            notes,
            photo: None,
            photo_taken_at: None,
        }
    }

    /// Builds a local record for a trap known to the backend, keeping the
    /// given local id.
    pub fn from_remote(remote: &ArmadilhaApi, local_id: String) -> Self {
        Self {
            local_id,
            remote_id: Some(remote.id),
            name: remote.nome.clone(),
            notes: remote.observacoes.clone(),
            photo: remote.foto.clone(),
            photo_taken_at: remote.data_foto.as_deref().and_then(parse_timestamp),
        }
    }

    pub fn has_photo(&self) -> bool {
        self.photo.as_deref().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// True while the photo is still the locally captured data-URI.
    pub fn has_local_photo(&self) -> bool {
        self.photo
            .as_deref()
            .map(|p| p.starts_with("data:"))
            .unwrap_or(false)
    }
}

impl Syncable for Trap {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn remote_id(&self) -> Option<i64> {
        self.remote_id
    }

    fn remote_id_slot(&mut self) -> &mut Option<i64> {
        &mut self.remote_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub traps: Vec<Trap>,
}

impl Field {
    pub fn new(name: String, location: Option<String>) -> Self {
        Self {
            local_id: new_local_id(),
            remote_id: None,
            name,
            location,
            created_at: Utc::now(),
            area: None,
            status: None,
            traps: Vec::new(),
        }
    }

    /// Builds a local record for a field first seen on the backend.
    pub fn from_remote(remote: &TalhaoApi) -> Self {
        Self {
            local_id: new_local_id(),
            remote_id: Some(remote.id),
            name: remote.nome.clone(),
            location: None,
            created_at: Utc::now(),
            area: remote.area,
            status: remote.status.clone(),
            traps: remote
                .armadilhas
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|t| Trap::from_remote(t, new_local_id()))
                .collect(),
        }
    }

    pub fn trap(&self, trap_local_id: &str) -> Option<&Trap> {
        self.traps.iter().find(|t| t.local_id == trap_local_id)
    }

    pub fn trap_mut(&mut self, trap_local_id: &str) -> Option<&mut Trap> {
        self.traps.iter_mut().find(|t| t.local_id == trap_local_id)
    }
}

impl Syncable for Field {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn remote_id(&self) -> Option<i64> {
        self.remote_id
    }

    fn remote_id_slot(&mut self) -> &mut Option<i64> {
        &mut self.remote_id
    }
}

// ===== PATCHES =====

/// Partial update of a field. `None` members are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub location: Option<String>,
    pub area: Option<f64>,
    pub status: Option<String>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.location.is_none() && self.area.is_none() && self.status.is_none()
    }

    pub fn apply(&self, field: &mut Field) {
        if let Some(name) = &self.name {
            field.name = name.clone();
        }
        if let Some(location) = &self.location {
            field.location = Some(location.clone());
        }
        if let Some(area) = self.area {
            field.area = Some(area);
        }
        if let Some(status) = &self.status {
            field.status = Some(status.clone());
        }
    }

    /// The part of the patch the backend knows about. Location is local only.
    pub fn to_remote(&self) -> UpdateTalhao {
        UpdateTalhao {
            nome: self.name.clone(),
            area: self.area,
            status: self.status.clone(),
            armadilhas_ativas: None,
        }
    }
}

/// Partial update of a trap. `None` members are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrapPatch {
    pub name: Option<String>,
    pub notes: Option<String>,
}

impl TrapPatch {
    pub fn apply(&self, trap: &mut Trap) {
        if let Some(name) = &self.name {
            trap.name = name.clone();
        }
        if let Some(notes) = &self.notes {
            trap.notes = Some(notes.clone());
        }
    }
}

// ===== UPLOAD QUEUE =====

/// A photo that must reach the backend but could not be sent synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpload {
    pub field_local_id: String,
    #[serde(default)]
    pub field_remote_id: Option<i64>,
    pub trap_local_id: String,
    #[serde(default)]
    pub trap_remote_id: Option<i64>,
    pub image_data: String,
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingUpload {
    pub fn new(
        field_local_id: &str,
        field_remote_id: Option<i64>,
        trap: &Trap,
        image_data: String,
    ) -> Self {
        Self {
            field_local_id: field_local_id.to_string(),
            field_remote_id,
            trap_local_id: trap.local_id.clone(),
            trap_remote_id: trap.remote_id,
            image_data,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Same trap and same image: the queued item has not been superseded.
    pub fn is_same_upload(&self, other: &PendingUpload) -> bool {
        self.trap_local_id == other.trap_local_id && self.image_data == other.image_data
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_is_set_at_most_once() {
        let mut field = Field::new("Talhão A".to_string(), None);
        assert!(!field.is_synced());
        assert!(field.adopt_remote_id(42));
        assert!(field.adopt_remote_id(42));
        assert!(!field.adopt_remote_id(43));
        assert_eq!(field.remote_id, Some(42));
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = Field::new("A".to_string(), None);
        let b = Field::new("A".to_string(), None);
        assert_ne!(a.local_id, b.local_id);
    }

    #[test]
    fn test_field_patch_merges_only_given_members() {
        let mut field = Field::new("Talhão A".to_string(), Some("Norte".to_string()));
        FieldPatch {
            status: Some("ativo".to_string()),
            ..Default::default()
        }
        .apply(&mut field);

        assert_eq!(field.name, "Talhão A");
        assert_eq!(field.location.as_deref(), Some("Norte"));
        assert_eq!(field.status.as_deref(), Some("ativo"));
    }

    #[test]
    fn test_field_from_remote_maps_nested_traps() {
        let remote: TalhaoApi = serde_json::from_value(serde_json::json!({
            "id": 7,
            "nome": "Talhão B",
            "area": 12.5,
            "status": "ativo",
            "armadilhas": [
                { "id": 70, "nome": "A1", "foto": "https://cdn/a1.jpg", "dataFoto": "2024-05-01T10:00:00Z" },
                { "id": 71, "nome": "A2" }
            ]
        }))
        .unwrap();

        let field = Field::from_remote(&remote);
        assert_eq!(field.remote_id, Some(7));
        assert_eq!(field.traps.len(), 2);
        assert_eq!(field.traps[0].remote_id, Some(70));
        assert!(field.traps[0].photo_taken_at.is_some());
        assert!(!field.traps[0].has_local_photo());
        assert!(!field.traps[1].has_photo());
    }

    #[test]
    fn test_snapshot_json_round_trip_keeps_identity() {
        let mut field = Field::new("Talhão A".to_string(), None);
        field.traps.push(Trap::new("A1".to_string(), Some("perto do rio".to_string())));
        let json = serde_json::to_string(&vec![field.clone()]).unwrap();
        assert!(json.contains("localId"));
        let restored: Vec<Field> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored[0], field);
    }
}
