use crate::CodecError;
use bytes::Bytes;
use serde::de::value::BytesDeserializer;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Pack a value with the wire serializer (MessagePack, structs as maps)
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(CodecError::from)
}

/// Unpack a value packed by [`encode`] or by any MessagePack peer
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(CodecError::from)
}

/// Hand an unpacked body to a type that can be built from bytes.
///
/// Raw queues skip the serializer; the body is presented to `T` as a byte
/// buffer, so `Bytes`, `serde_bytes`-style buffers and UTF-8 `String`s work.
pub fn decode_raw<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let deserializer = BytesDeserializer::<serde::de::value::Error>::new(bytes);
    T::deserialize(deserializer).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Request body of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Passed through unchanged
    Raw(Bytes),
    /// Already packed with the wire serializer
    Packed(Bytes),
}

impl TaskPayload {
    /// Pack a value into a payload
    pub fn pack<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(TaskPayload::Packed(Bytes::from(encode(value)?)))
    }

    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        TaskPayload::Raw(bytes.into())
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, TaskPayload::Raw(_))
    }

    /// Bytes as they go on the wire
    pub fn body(&self) -> Bytes {
        match self {
            TaskPayload::Raw(bytes) | TaskPayload::Packed(bytes) => bytes.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskPayload::Raw(bytes) | TaskPayload::Packed(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
