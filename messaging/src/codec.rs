//! Payload encoding shared by every writer and reader.
//!
//! Values travel as UTF-8 JSON text, so any consumer can decode them without a schema.

use crate::errors::MessagingError;
use serde::{de::DeserializeOwned, Serialize};

pub const JSON_CONTENT_TYPE: &str = "application/json";

pub fn encode<T>(value: &T) -> Result<Vec<u8>, MessagingError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value).map_err(|err| MessagingError::SerializePayloadError(err.to_string()))
}

pub fn decode<T>(data: &[u8]) -> Result<T, MessagingError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(data)
        .map_err(|err| MessagingError::DeserializePayloadError(err.to_string()))
}
