//! Row <-> domain conversions for event and state segments

use crate::core::event::{ChangeEvent, EventOp, FieldMap};
use crate::core::state::{EntityState, RelationshipState};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::segment::format::{ColumnDef, ColumnValue, LogicalType, Schema};
use serde_json::Value;

/// Schema of event segments, in stored column order.
pub fn event_schema() -> Schema {
    vec![
        ColumnDef::new("id", LogicalType::Utf8),
        ColumnDef::new("ts", LogicalType::Int64),
        ColumnDef::new("seq", LogicalType::Int64),
        ColumnDef::new("op", LogicalType::Utf8),
        ColumnDef::new("target", LogicalType::Utf8),
        ColumnDef::new("before", LogicalType::Json),
        ColumnDef::new("after", LogicalType::Json),
        ColumnDef::new("actor", LogicalType::Json),
        ColumnDef::new("metadata", LogicalType::Json),
    ]
}

/// Columns every event scan must materialize regardless of projection.
pub const EVENT_CORE_COLUMNS: [&str; 5] = ["id", "ts", "seq", "op", "target"];

/// Schema of entity snapshot segments.
pub fn entity_schema() -> Schema {
    vec![
        ColumnDef::new("target", LogicalType::Utf8),
        ColumnDef::new("ns", LogicalType::Utf8),
        ColumnDef::new("id", LogicalType::Utf8),
        ColumnDef::new("state", LogicalType::Json),
        ColumnDef::new("exists", LogicalType::Bool),
        ColumnDef::new("last_event_ts", LogicalType::Int64),
        ColumnDef::new("last_event_seq", LogicalType::Int64),
    ]
}

/// Schema of relationship snapshot segments.
pub fn relationship_schema() -> Schema {
    vec![
        ColumnDef::new("target", LogicalType::Utf8),
        ColumnDef::new("from", LogicalType::Utf8),
        ColumnDef::new("predicate", LogicalType::Utf8),
        ColumnDef::new("to", LogicalType::Utf8),
        ColumnDef::new("data", LogicalType::Json),
        ColumnDef::new("exists", LogicalType::Bool),
        ColumnDef::new("last_event_ts", LogicalType::Int64),
        ColumnDef::new("last_event_seq", LogicalType::Int64),
    ]
}

fn map_cell(map: &Option<FieldMap>) -> ColumnValue {
    match map {
        Some(m) => ColumnValue::Json(Value::Object(m.clone())),
        None => ColumnValue::Null,
    }
}

fn cell_map(value: ColumnValue, column: &str) -> Result<Option<FieldMap>> {
    match value {
        ColumnValue::Null => Ok(None),
        ColumnValue::Json(Value::Object(map)) => Ok(Some(map)),
        other => Err(Error::Serialization(format!(
            "column {column}: expected object, got {other:?}"
        ))),
    }
}

fn required_str(value: &ColumnValue, column: &str) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Serialization(format!("column {column}: missing string value")))
}

fn required_int(value: &ColumnValue, column: &str) -> Result<i64> {
    value
        .as_int()
        .ok_or_else(|| Error::Serialization(format!("column {column}: missing int value")))
}

fn required_bool(value: &ColumnValue, column: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::Serialization(format!("column {column}: missing bool value")))
}

pub fn event_to_row(event: &ChangeEvent) -> Vec<ColumnValue> {
    vec![
        ColumnValue::Str(event.id.clone()),
        ColumnValue::Int(event.ts.as_millis()),
        ColumnValue::Int(event.seq as i64),
        ColumnValue::Str(event.op.as_str().to_string()),
        ColumnValue::Str(event.target.clone()),
        map_cell(&event.before),
        map_cell(&event.after),
        map_cell(&event.actor),
        map_cell(&event.metadata),
    ]
}

pub fn row_to_event_one(row: Vec<ColumnValue>) -> Result<ChangeEvent> {
    let [id, ts, seq, op, target, before, after, actor, metadata]: [ColumnValue; 9] =
        row.try_into().map_err(|row: Vec<ColumnValue>| {
            Error::Serialization(format!("event row has {} columns, expected 9", row.len()))
        })?;

    let op_str = required_str(&op, "op")?;
    let op = EventOp::parse(&op_str)
        .ok_or_else(|| Error::Serialization(format!("unknown op: {op_str}")))?;

    Ok(ChangeEvent {
        id: required_str(&id, "id")?,
        ts: Timestamp::from_millis(required_int(&ts, "ts")?),
        seq: required_int(&seq, "seq")? as u64,
        op,
        target: required_str(&target, "target")?,
        before: cell_map(before, "before")?,
        after: cell_map(after, "after")?,
        actor: cell_map(actor, "actor")?,
        metadata: cell_map(metadata, "metadata")?,
    })
}

pub fn entity_to_row(state: &EntityState) -> Vec<ColumnValue> {
    vec![
        ColumnValue::Str(state.target.clone()),
        ColumnValue::Str(state.ns.clone()),
        ColumnValue::Str(state.id.clone()),
        map_cell(&state.state),
        ColumnValue::Bool(state.exists),
        ColumnValue::Int(state.last_event_ts.as_millis()),
        ColumnValue::Int(state.last_event_seq as i64),
    ]
}

pub fn row_to_entity(row: Vec<ColumnValue>) -> Result<EntityState> {
    let [target, ns, id, state, exists, last_ts, last_seq]: [ColumnValue; 7] =
        row.try_into().map_err(|row: Vec<ColumnValue>| {
            Error::Serialization(format!("entity row has {} columns, expected 7", row.len()))
        })?;
    Ok(EntityState {
        target: required_str(&target, "target")?,
        ns: required_str(&ns, "ns")?,
        id: required_str(&id, "id")?,
        state: cell_map(state, "state")?,
        exists: required_bool(&exists, "exists")?,
        last_event_ts: Timestamp::from_millis(required_int(&last_ts, "last_event_ts")?),
        last_event_seq: required_int(&last_seq, "last_event_seq")? as u64,
    })
}

pub fn relationship_to_row(state: &RelationshipState) -> Vec<ColumnValue> {
    vec![
        ColumnValue::Str(state.target.clone()),
        ColumnValue::Str(state.from.clone()),
        ColumnValue::Str(state.predicate.clone()),
        ColumnValue::Str(state.to.clone()),
        map_cell(&state.data),
        ColumnValue::Bool(state.exists),
        ColumnValue::Int(state.last_event_ts.as_millis()),
        ColumnValue::Int(state.last_event_seq as i64),
    ]
}

pub fn row_to_relationship(row: Vec<ColumnValue>) -> Result<RelationshipState> {
    let [target, from, predicate, to, data, exists, last_ts, last_seq]: [ColumnValue; 8] =
        row.try_into().map_err(|row: Vec<ColumnValue>| {
            Error::Serialization(format!(
                "relationship row has {} columns, expected 8",
                row.len()
            ))
        })?;
    Ok(RelationshipState {
        target: required_str(&target, "target")?,
        from: required_str(&from, "from")?,
        predicate: required_str(&predicate, "predicate")?,
        to: required_str(&to, "to")?,
        data: cell_map(data, "data")?,
        exists: required_bool(&exists, "exists")?,
        last_event_ts: Timestamp::from_millis(required_int(&last_ts, "last_event_ts")?),
        last_event_seq: required_int(&last_seq, "last_event_seq")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> FieldMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_event_row_roundtrip() {
        let mut event = ChangeEvent::new(
            EventOp::Update,
            "user:1",
            Timestamp::from_millis(2000),
        )
        .with_before(map(json!({"name": "A"})))
        .with_after(map(json!({"name": "A2", "n": 2})));
        event.seq = 3;

        let row = event_to_row(&event);
        let back = row_to_event_one(row).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_entity_row_roundtrip() {
        let state = EntityState {
            target: "user:1".into(),
            ns: "user".into(),
            id: "1".into(),
            state: Some(map(json!({"name": "A"}))),
            exists: true,
            last_event_ts: Timestamp::from_millis(1000),
            last_event_seq: 1,
        };
        let back = row_to_entity(entity_to_row(&state)).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_relationship_row_roundtrip() {
        let state = RelationshipState {
            target: "user:1:follows:user:2".into(),
            from: "user:1".into(),
            predicate: "follows".into(),
            to: "user:2".into(),
            data: None,
            exists: false,
            last_event_ts: Timestamp::from_millis(3000),
            last_event_seq: 9,
        };
        let back = row_to_relationship(relationship_to_row(&state)).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_tombstone_event_has_no_after() {
        let mut event = ChangeEvent::new(EventOp::Delete, "user:1", Timestamp::from_millis(1))
            .with_before(map(json!({"name": "A"})));
        event.seq = 1;
        let row = event_to_row(&event);
        assert_eq!(row[6], ColumnValue::Null);
        let back = row_to_event_one(row).unwrap();
        assert!(back.after.is_none());
    }
}
