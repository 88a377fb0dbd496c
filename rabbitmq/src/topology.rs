use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;
use tracing::debug;

/// Exchange, optional queue and the binding between them.
///
/// `install` declares the exchange, then the queue, then binds the queue to the exchange with the
/// configured routing key (empty by default). Each step awaits the broker before the next one
/// starts and the first failure aborts the installation. Declarations are idempotent, so
/// installing the same topology twice is harmless.
///
/// ```rust,no_run
/// use rabbitmq::{exchange::ExchangeDefinition, queue::QueueDefinition, topology::AmqpTopology};
/// # async fn run(channel: std::sync::Arc<dyn rabbitmq::channel::AmqpChannel>) -> Result<(), rabbitmq::errors::AmqpError> {
/// let queue = AmqpTopology::new(channel, ExchangeDefinition::new("orders").direct().durable())
///     .queue(QueueDefinition::new("orders").durable())
///     .install()
///     .await?;
///
/// assert_eq!(queue.as_deref(), Some("orders"));
/// # Ok(())
/// # }
/// ```
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    exchange: ExchangeDefinition,
    queue: Option<QueueDefinition>,
    routing_key: String,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>, exchange: ExchangeDefinition) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchange,
            queue: None,
            routing_key: String::new(),
        }
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = Some(def);
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Returns the name of the bound queue, if any.
    pub async fn install(&self) -> Result<Option<String>, AmqpError> {
        self.channel.declare_exchange(&self.exchange).await?;

        let Some(def) = &self.queue else {
            return Ok(None);
        };

        let queue_name = self.channel.declare_queue(def).await?;

        self.channel
            .bind_queue(
                &QueueBinding::new(queue_name.clone())
                    .exchange(self.exchange.name())
                    .routing_key(self.routing_key.clone()),
            )
            .await?;

        debug!(
            exchange = self.exchange.name(),
            queue = queue_name,
            "topology installed"
        );

        Ok(Some(queue_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAmqpChannel, exchange::ExchangeKind};
    use mockall::Sequence;

    #[tokio::test]
    async fn should_install_exchange_queue_and_binding_in_order() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders" && def.exchange_kind() == ExchangeKind::Direct)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "orders" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| {
                binding.queue_name() == "orders"
                    && binding.exchange_name() == "orders"
                    && binding.key().is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let res = AmqpTopology::new(
            Arc::new(channel),
            ExchangeDefinition::new("orders").direct().durable(),
        )
        .queue(QueueDefinition::new("orders").durable())
        .install()
        .await;

        assert_eq!(res, Ok(Some("orders".to_owned())));
    }

    #[tokio::test]
    async fn should_bind_generated_queue_name() {
        let mut channel = MockAmqpChannel::new();

        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.is_anonymous())
            .returning(|_| Ok("amq.gen-1".to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| binding.queue_name() == "amq.gen-1")
            .times(1)
            .returning(|_| Ok(()));

        let res = AmqpTopology::new(Arc::new(channel), ExchangeDefinition::new("prices").fanout())
            .queue(QueueDefinition::anonymous().exclusive().delete())
            .install()
            .await;

        assert_eq!(res, Ok(Some("amq.gen-1".to_owned())));
    }

    #[tokio::test]
    async fn should_only_declare_exchange_without_queue() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let res = AmqpTopology::new(Arc::new(channel), ExchangeDefinition::new("prices").fanout())
            .install()
            .await;

        assert_eq!(res, Ok(None));
    }

    #[tokio::test]
    async fn should_abort_on_first_failure() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let res = AmqpTopology::new(Arc::new(channel), ExchangeDefinition::new("orders"))
            .queue(QueueDefinition::new("orders"))
            .install()
            .await;

        assert_eq!(
            res,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_surface_binding_failure() {
        let mut channel = MockAmqpChannel::new();

        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        channel.expect_bind_queue().returning(|binding| {
            Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ))
        });

        let res = AmqpTopology::new(Arc::new(channel), ExchangeDefinition::new("orders"))
            .queue(QueueDefinition::new("orders"))
            .install()
            .await;

        assert!(res.unwrap_err().is_provisioning());
    }
}
