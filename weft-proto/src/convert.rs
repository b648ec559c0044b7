//! Conversions between wire messages and model types.

use std::collections::HashMap;

impl From<weft_model::Value> for crate::Value {
    fn from(val: weft_model::Value) -> Self {
        Self {
            version: val.version,
            originator_id: val.originator_id,
            value: val.value,
            ttl_ms: val.ttl_ms,
            ttl_version: val.ttl_version,
            hash: val.hash,
        }
    }
}

impl From<crate::Value> for weft_model::Value {
    fn from(val: crate::Value) -> Self {
        Self {
            version: val.version,
            originator_id: val.originator_id,
            value: val.value,
            ttl_ms: val.ttl_ms,
            ttl_version: val.ttl_version,
            hash: val.hash,
        }
    }
}

/// Map conversion helper for publications and dump requests.
pub fn to_model_map(key_vals: HashMap<String, crate::Value>) -> HashMap<String, weft_model::Value> {
    key_vals.into_iter().map(|(k, v)| (k, v.into())).collect()
}

/// Map conversion helper for the reverse direction.
pub fn to_wire_map(key_vals: HashMap<String, weft_model::Value>) -> HashMap<String, crate::Value> {
    key_vals.into_iter().map(|(k, v)| (k, v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversion_roundtrip() {
        let model = weft_model::Value::new(4, "node-a", Some(b"v".to_vec()), 1_000, 1);
        let wire: crate::Value = model.clone().into();
        let back: weft_model::Value = wire.into();
        assert_eq!(back, model);
        assert_eq!(back.hash, back.content_hash());
    }

    #[test]
    fn map_conversion_preserves_entries() {
        let mut model_map = HashMap::new();
        model_map.insert(
            "k".to_string(),
            weft_model::Value::new(1, "n", None, 500, 2),
        );
        let wire = to_wire_map(model_map.clone());
        assert_eq!(to_model_map(wire), model_map);
    }
}
