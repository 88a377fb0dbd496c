//! Point-to-point and broadcast messaging over RabbitMQ.
//!
//! A [`Session`] owns one connection and one channel with a prefetch of one unacknowledged
//! delivery. [`Worker`]s give competing consumers on a durable queue, [`Publisher`]s give
//! fanout broadcast to per-reader queues. Both hand out [`WriteStream`]s and [`ReadStream`]s.

mod consumer;
mod otel;

pub mod channel;
pub mod client;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod publisher;
pub mod queue;
pub mod read_stream;
pub mod session;
pub mod topology;
pub mod worker;
pub mod write_stream;

pub use errors::AmqpError;
pub use publisher::Publisher;
pub use read_stream::{Message, ReadStream};
pub use session::{connect, connect_with, connect_with_configs, Session, PREFETCH_COUNT};
pub use worker::Worker;
pub use write_stream::WriteStream;
