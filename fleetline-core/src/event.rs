//! Change event envelope delivered by the realtime feed.

use crate::{ChangeKind, EntityType, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A database row as delivered by the change feed.
pub type Row = Map<String, Value>;

/// One row-level change on a tenant's channel.
///
/// Inserts carry only `new`, deletes carry only `old`, updates carry both
/// (the old row may be partial depending on the table's replica identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityType,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Row>,
    #[serde(default)]
    pub old: Option<Row>,
    #[serde(default)]
    pub commit_timestamp: Option<Timestamp>,
}

impl ChangeEvent {
    pub fn insert(entity: EntityType, row: Row) -> Self {
        Self {
            entity,
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn update(entity: EntityType, new: Row, old: Option<Row>) -> Self {
        Self {
            entity,
            kind: ChangeKind::Update,
            new: Some(new),
            old,
            commit_timestamp: None,
        }
    }

    pub fn delete(entity: EntityType, old: Row) -> Self {
        Self {
            entity,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            commit_timestamp: None,
        }
    }

    /// Look up a string column, preferring the new row over the old one.
    pub fn field(&self, column: &str) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|row| string_column(row, column))
            .or_else(|| self.old.as_ref().and_then(|row| string_column(row, column)))
    }

    /// Primary key of the changed row.
    pub fn record_id(&self) -> Option<RecordId> {
        self.field("id").map(RecordId::from)
    }

    /// Equipment the changed row refers to, if any.
    pub fn equipment_id(&self) -> Option<RecordId> {
        self.field("equipment_id").map(RecordId::from)
    }
}

fn string_column<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    match row.get(column) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn test_field_prefers_new_row() {
        let event = ChangeEvent::update(
            EntityType::WorkOrder,
            row(json!({"id": "wo-1", "equipment_id": "eq-2"})),
            Some(row(json!({"id": "wo-1", "equipment_id": "eq-1"}))),
        );
        assert_eq!(event.equipment_id(), Some(RecordId::from("eq-2")));
    }

    #[test]
    fn test_field_falls_back_to_old_row() {
        let event = ChangeEvent::delete(
            EntityType::EquipmentNote,
            row(json!({"id": "n-1", "equipment_id": "eq-9"})),
        );
        assert_eq!(event.record_id(), Some(RecordId::from("n-1")));
        assert_eq!(event.equipment_id(), Some(RecordId::from("eq-9")));
    }

    #[test]
    fn test_null_and_empty_columns_are_absent() {
        let event = ChangeEvent::insert(
            EntityType::WorkOrder,
            row(json!({"id": "wo-1", "equipment_id": null, "team_id": ""})),
        );
        assert_eq!(event.equipment_id(), None);
        assert_eq!(event.field("team_id"), None);
    }

    #[test]
    fn test_deserializes_wire_shape() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "entity": "equipment",
            "eventType": "UPDATE",
            "new": {"id": "eq-1", "name": "X"}
        }))
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.record_id(), Some(RecordId::from("eq-1")));
        assert!(event.old.is_none());
    }
}
