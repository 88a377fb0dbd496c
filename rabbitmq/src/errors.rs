use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("{0} is missing")]
    ValidationError(String),

    #[error("could not connect to {0}")]
    ConnectionError(String),

    #[error("failure to create a channel")]
    ChannelError,

    #[error("failure to configure the channel prefetch")]
    PrefetchError,

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to requeuing message")]
    RequeuingMessageError,

    #[error("failure to close the connection")]
    CloseError,

    #[error("broker error `{0}`")]
    BrokerError(String),
}

impl AmqpError {
    /// Failures raised while declaring exchanges, queues, bindings or consumers.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::BindingConsumerError(_)
        )
    }
}
