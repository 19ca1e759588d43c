//! Result marshaling.

use crate::engine::ScriptEngine;
use crate::error::EvalError;
use crate::handles::HandleTable;
use crate::transport::protocol::ValueKind;

/// Convert a settled value into the response bytes for `kind`.
///
/// `Handle` stores the value (by reference) in `table` and returns the new
/// handle as 8 little-endian bytes.
pub fn marshal<E: ScriptEngine>(
    value: E::Value,
    kind: ValueKind,
    engine: &E,
    table: &mut HandleTable<E::Value>,
) -> Result<Vec<u8>, EvalError> {
    match kind {
        ValueKind::None => Ok(Vec::new()),
        ValueKind::Bytes => engine.to_bytes(value),
        ValueKind::Json => {
            let json = engine.to_json(value)?;
            serde_json::to_vec(&json)
                .map_err(|e| EvalError::UnmarshalableResult(format!("cannot serialize to JSON: {e}")))
        }
        ValueKind::Handle => {
            let handle = table.allocate(engine.share(value));
            Ok(handle.to_le_bytes().to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use rhai::Dynamic;

    use super::*;
    use crate::config::EngineLimits;
    use crate::engine::{Pending, RhaiEngine};

    fn engine() -> RhaiEngine {
        RhaiEngine::new(&EngineLimits::default(), std::path::Path::new("."))
    }

    #[test]
    fn none_discards_value() {
        let engine = engine();
        let mut table = HandleTable::new();
        let out = marshal(Dynamic::from(5_i64), ValueKind::None, &engine, &mut table).unwrap();
        assert!(out.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn json_is_compact_text() {
        let engine = engine();
        let mut table = HandleTable::new();
        let value = engine.json(serde_json::json!({"k": [1, 2]})).unwrap();
        let out = marshal(value, ValueKind::Json, &engine, &mut table).unwrap();
        assert_eq!(out, br#"{"k":[1,2]}"#);

        let out = marshal(Dynamic::UNIT, ValueKind::Json, &engine, &mut table).unwrap();
        assert_eq!(out, b"null");
    }

    #[test]
    fn json_rejects_opaque_values() {
        let engine = engine();
        let mut table = HandleTable::new();
        let pending = Dynamic::from(Pending::Rejected("x".into()));
        let err = marshal(pending, ValueKind::Json, &engine, &mut table).unwrap_err();
        assert!(matches!(err, EvalError::UnmarshalableResult(_)));
    }

    #[test]
    fn handles_are_allocated_in_order() {
        let engine = engine();
        let mut table = HandleTable::new();
        let first = marshal(Dynamic::from(1_i64), ValueKind::Handle, &engine, &mut table).unwrap();
        let second = marshal(Dynamic::from(1_i64), ValueKind::Handle, &engine, &mut table).unwrap();
        assert_eq!(first, 0u64.to_le_bytes());
        assert_eq!(second, 1u64.to_le_bytes());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn bytes_from_string() {
        let engine = engine();
        let mut table = HandleTable::new();
        let out = marshal(engine.text("héllo".into()), ValueKind::Bytes, &engine, &mut table).unwrap();
        assert_eq!(out, "héllo".as_bytes());
    }
}
