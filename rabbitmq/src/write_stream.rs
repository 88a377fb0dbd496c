use crate::{
    channel::{AmqpChannel, PublishProperties},
    errors::AmqpError,
    otel,
};
use messaging::codec::{self, JSON_CONTENT_TYPE};
use opentelemetry::{global, trace::SpanKind, Context};
use serde::Serialize;
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Sink publishing one persistent JSON message per write to a named exchange.
///
/// Writes are fire-and-forget: the broker does not confirm them and a message written to a
/// fanout exchange without bound queues is simply dropped by the broker.
pub struct WriteStream<T> {
    channel: Arc<dyn AmqpChannel>,
    exchange: String,
    _payload: PhantomData<fn(&T)>,
}

impl<T> WriteStream<T>
where
    T: Serialize,
{
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, exchange: impl Into<String>) -> Self {
        WriteStream {
            channel,
            exchange: exchange.into(),
            _payload: PhantomData,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `value` under a new producer span.
    pub async fn write(&self, value: &T) -> Result<(), AmqpError> {
        let tracer = global::tracer(otel::TRACER_NAME);
        let ctx = traces::span_ctx(&tracer, SpanKind::Producer, &self.exchange);

        self.write_with_context(&ctx, value).await
    }

    /// Publishes `value` carrying the trace context of `ctx` in the message headers.
    pub async fn write_with_context(&self, ctx: &Context, value: &T) -> Result<(), AmqpError> {
        let payload = match codec::encode(value) {
            Ok(p) => Ok(p),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange,
                    "failure to serialize payload"
                );
                Err(AmqpError::SerializePayloadError(err.to_string()))
            }
        }?;

        let props = PublishProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            persistent: true,
            headers: otel::inject(ctx),
        };

        self.channel
            .publish(&self.exchange, "", &payload, &props)
            .await?;

        debug!(
            trace.id = traces::trace_id(ctx),
            span.id = traces::span_id(ctx),
            exchange = self.exchange,
            message.id = props.message_id,
            "message published"
        );

        Ok(())
    }
}
