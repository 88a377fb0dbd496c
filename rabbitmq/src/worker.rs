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

/// Point-to-point messaging on `name`.
///
/// Backed by a durable direct exchange bound with an empty routing key to a durable queue of the
/// same name. Every reader of a name consumes that one queue, so readers compete and each message
/// reaches exactly one of them.
#[derive(Clone)]
pub struct Worker {
    channel: Arc<dyn AmqpChannel>,
    name: String,
}

impl Worker {
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, name: &str) -> Worker {
        Worker {
            channel,
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn topology(&self) -> AmqpTopology {
        AmqpTopology::new(
            self.channel.clone(),
            ExchangeDefinition::new(&self.name).direct().durable(),
        )
        .queue(QueueDefinition::new(&self.name).durable())
    }

    pub async fn create_write_stream<T>(&self) -> Result<WriteStream<T>, AmqpError>
    where
        T: Serialize,
    {
        self.topology().install().await?;

        Ok(WriteStream::new(self.channel.clone(), &self.name))
    }

    pub async fn create_read_stream<T>(&self) -> Result<ReadStream<T>, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(queue) = self.topology().install().await? else {
            return Err(AmqpError::DeclareQueueError(self.name.clone()));
        };

        ReadStream::subscribe(&self.channel, &self.name, queue).await
    }
}
