use crate::errors::MessagingError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::fmt::Display;

/// Terminal outcome applied to one delivery. Every delivery receives exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed, the broker may forget it.
    Acknowledge,
    /// Dropped for good, never redelivered.
    Discard,
    /// Handed back to the broker to be delivered again.
    Requeue,
}

impl Disposition {
    pub fn from_outcome(outcome: &Result<(), MessagingError>) -> Disposition {
        match outcome {
            Ok(_) => Disposition::Acknowledge,
            Err(err) if err.is_retryable() => Disposition::Requeue,
            Err(_) => Disposition::Discard,
        }
    }
}

impl Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let printable = match *self {
            Disposition::Acknowledge => "acknowledge",
            Disposition::Discard => "discard",
            Disposition::Requeue => "requeue",
        };
        write!(f, "{}", printable)
    }
}

/// Application logic run for every decoded payload.
///
/// `Ok` acknowledges the message, `MessagingError::RetryableError` requeues it and
/// any other error discards it.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn exec(&self, ctx: &Context, payload: &T) -> Result<(), MessagingError>;
}
