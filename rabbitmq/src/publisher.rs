use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    read_stream::ReadStream,
    topology::AmqpTopology,
    write_stream::WriteStream,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Broadcast messaging on `name`.
///
/// Writers publish to a durable fanout exchange. Each reader declares its own broker-named,
/// exclusive and auto-deleting queue bound to that exchange, so every reader gets a copy of every
/// message published while it exists and nothing published before.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn AmqpChannel>,
    name: String,
}

impl Publisher {
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, name: &str) -> Publisher {
        Publisher {
            channel,
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.name).fanout().durable()
    }

    /// Writes with no reader bound are accepted and dropped by the broker.
    pub async fn create_write_stream<T>(&self) -> Result<WriteStream<T>, AmqpError>
    where
        T: Serialize,
    {
        AmqpTopology::new(self.channel.clone(), self.exchange())
            .install()
            .await?;

        Ok(WriteStream::new(self.channel.clone(), &self.name))
    }

    pub async fn create_read_stream<T>(&self) -> Result<ReadStream<T>, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(queue) = AmqpTopology::new(self.channel.clone(), self.exchange())
            .queue(QueueDefinition::anonymous().exclusive().delete())
            .install()
            .await?
        else {
            return Err(AmqpError::DeclareQueueError(self.name.clone()));
        };

        ReadStream::subscribe(&self.channel, &self.name, queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel, exchange::ExchangeKind, mocks::InMemoryBroker,
        session::connect_with,
    };
    use futures_util::{FutureExt, StreamExt};
    use serde_json::{json, Value};

    const URL: &str = "amqp://localhost";

    #[tokio::test]
    async fn should_provision_only_a_durable_fanout_exchange_for_writers() {
        let broker = InMemoryBroker::new();
        let session = connect_with(&broker, URL).await.unwrap();

        let writer = session
            .publisher("prices")
            .unwrap()
            .create_write_stream::<Value>()
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind("prices"), Some(ExchangeKind::Fanout));
        assert!(broker.is_durable_exchange("prices"));
        assert!(!broker.queue_exists("prices"));
        assert!(broker.bound_queues("prices").is_empty());

        assert!(writer.write(&json!({ "price": 10 })).await.is_ok());
    }

    #[tokio::test]
    async fn should_declare_an_anonymous_exclusive_queue_per_reader() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|def| def.exchange_kind() == ExchangeKind::Fanout && def.is_durable())
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.is_anonymous()
                    && def.is_exclusive()
                    && def.is_auto_delete()
                    && !def.is_durable()
            })
            .times(1)
            .returning(|_| Ok("amq.gen-42".to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| {
                binding.queue_name() == "amq.gen-42"
                    && binding.exchange_name() == "prices"
                    && binding.key().is_empty()
            })
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .withf(|queue, _| queue == "amq.gen-42")
            .returning(|_, _| Ok(futures_util::stream::empty().boxed()));

        let reader = Publisher::new(Arc::new(channel), "prices")
            .create_read_stream::<Value>()
            .await
            .unwrap();

        assert_eq!(reader.queue(), "amq.gen-42");
    }

    #[tokio::test]
    async fn should_broadcast_to_every_reader() {
        let broker = InMemoryBroker::new();
        let first = connect_with(&broker, URL).await.unwrap();
        let second = connect_with(&broker, URL).await.unwrap();

        let mut left = first
            .publisher("prices")
            .unwrap()
            .create_read_stream::<Value>()
            .await
            .unwrap();
        let mut right = second
            .publisher("prices")
            .unwrap()
            .create_read_stream::<Value>()
            .await
            .unwrap();
        assert_ne!(left.queue(), right.queue());

        let writer = first
            .publisher("prices")
            .unwrap()
            .create_write_stream::<Value>()
            .await
            .unwrap();
        writer.write(&json!({ "price": 10 })).await.unwrap();

        let a = left.next().await.unwrap().unwrap();
        let b = right.next().await.unwrap().unwrap();
        assert_eq!(a.payload(), &json!({ "price": 10 }));
        assert_eq!(b.payload(), &json!({ "price": 10 }));

        a.acknowledge().await.unwrap();
        b.acknowledge().await.unwrap();
    }

    #[tokio::test]
    async fn should_not_replay_messages_to_late_readers() {
        let broker = InMemoryBroker::new();
        let session = connect_with(&broker, URL).await.unwrap();
        let publisher = session.publisher("prices").unwrap();

        let writer = publisher.create_write_stream::<Value>().await.unwrap();
        writer.write(&json!({ "price": 1 })).await.unwrap();

        let mut reader = publisher.create_read_stream::<Value>().await.unwrap();
        assert!(reader.next().now_or_never().is_none());

        writer.write(&json!({ "price": 2 })).await.unwrap();
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(msg.payload()["price"], 2);
        msg.acknowledge().await.unwrap();
    }

    #[tokio::test]
    async fn should_remove_reader_queue_with_its_session() {
        let broker = InMemoryBroker::new();
        let session = connect_with(&broker, URL).await.unwrap();

        let reader = session
            .publisher("prices")
            .unwrap()
            .create_read_stream::<Value>()
            .await
            .unwrap();
        let queue = reader.queue().to_owned();
        assert!(broker.queue_exists(&queue));

        session.close().await.unwrap();

        assert!(!broker.queue_exists(&queue));
        assert!(broker.bound_queues("prices").is_empty());
        assert_eq!(broker.exchange_kind("prices"), Some(ExchangeKind::Fanout));
    }
}
