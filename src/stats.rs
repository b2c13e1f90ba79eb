//! Inspection progress figures computed from the local graph.

use serde::Serialize;

use crate::models::Field;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub fields: usize,
    pub traps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldShortfall {
    pub name: String,
    pub missing: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionSummary {
    pub totals: Totals,
    pub missing_photos: usize,
    pub completion_rate: f64,
    pub missing_by_field: Vec<FieldShortfall>,
}

pub fn missing_photo_count(fields: &[Field]) -> usize {
    fields
        .iter()
        .flat_map(|f| &f.traps)
        .filter(|t| !t.has_photo())
        .count()
}

/// Percentage of traps that have a photo. 0 when there are no traps.
pub fn completion_rate(fields: &[Field]) -> f64 {
    let Totals { traps, .. } = totals(fields);
    if traps == 0 {
        return 0.0;
    }
    let with_photo = traps - missing_photo_count(fields);
    with_photo as f64 / traps as f64 * 100.0
}

pub fn missing_by_field(fields: &[Field]) -> Vec<FieldShortfall> {
    fields
        .iter()
        .filter_map(|field| {
            let missing = field.traps.iter().filter(|t| !t.has_photo()).count();
            (missing > 0).then(|| FieldShortfall {
                name: field.name.clone(),
                missing,
            })
        })
        .collect()
}

pub fn totals(fields: &[Field]) -> Totals {
    Totals {
        fields: fields.len(),
        traps: fields.iter().map(|f| f.traps.len()).sum(),
    }
}

pub fn summarize(fields: &[Field]) -> InspectionSummary {
    InspectionSummary {
        totals: totals(fields),
        missing_photos: missing_photo_count(fields),
        completion_rate: completion_rate(fields),
        missing_by_field: missing_by_field(fields),
    }
}
