use serde_json::Value;

use crate::StoreError;

/// Byte encoding of stored payloads (checkpoint rows, metadata, blobs, writes).
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Read-side shim for rows written by older writers that stored payloads as a
/// JSON string containing the serialized document. Writes go through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentCompat<C> {
    inner: C,
}

impl<C: PayloadCodec> FragmentCompat<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: PayloadCodec> PayloadCodec for FragmentCompat<C> {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        self.inner.encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StoreError> {
        let value = self.inner.decode(bytes)?;
        let Value::String(fragment) = &value else {
            return Ok(value);
        };
        match serde_json::from_str::<Value>(fragment) {
            Ok(inner @ (Value::Object(_) | Value::Array(_))) => Ok(inner),
            _ => Ok(value),
        }
    }
}
