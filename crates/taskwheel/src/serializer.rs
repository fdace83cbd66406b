use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SchedulerError;

/// Pluggable payload codec.
///
/// Payloads travel through `serde_json::Value` so the trait stays
/// object-safe; the codec decides the byte representation stored in the
/// `task_data` column. Forward and backward compatibility of the encoded
/// shape is the task author's concern.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SchedulerError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, SchedulerError>;
}

impl dyn Serializer {
    /// Serialize a typed payload.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SchedulerError> {
        let value = serde_json::to_value(value)?;
        self.serialize(&value)
    }

    /// Deserialize stored bytes into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SchedulerError> {
        let value = self.deserialize(bytes)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// The default codec: compact JSON.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SchedulerError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, SchedulerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
