use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("internal error")]
    InternalError,

    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    #[error("failure to deserialize payload `{0}`")]
    DeserializePayloadError(String),

    #[error("failure to consume message, it can be retried `{0}`")]
    RetryableError(String),

    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl MessagingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MessagingError::RetryableError(_))
    }
}
