//! Pluggable payload codec
//!
//! Drivers only ever see bytes. The facade converts typed values into a
//! `serde_json::Value` and hands that to the configured codec, so any codec
//! that round-trips JSON values can be swapped in.

use serde_json::Value;

/// Serialize/deserialize pair applied to every stored value
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Encode a value into the bytes handed to the driver
    fn serialize(&self, value: &Value) -> std::result::Result<Vec<u8>, String>;

    /// Decode bytes read back from the driver
    fn deserialize(&self, bytes: &[u8]) -> std::result::Result<Value, String>;
}

/// Compact JSON codec, the default
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value) -> std::result::Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }

    fn deserialize(&self, bytes: &[u8]) -> std::result::Result<Value, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec;
        let value = json!({"foo": "Foo", "nested": [1, 2, {"bar": null}]});
        let bytes = codec.serialize(&value).unwrap();
        assert_eq!(codec.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let err = JsonCodec.deserialize(b"this is bad JSON content").unwrap_err();
        assert!(err.contains("expected"));
    }
}
