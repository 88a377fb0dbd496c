use crate::{
    channel::{AmqpChannel, DeliveryAcker, RawDelivery},
    consumer,
    errors::AmqpError,
    otel,
};
use futures_util::{
    stream::{BoxStream, Stream},
    StreamExt,
};
use messaging::{
    codec,
    handler::{ConsumerHandler, Disposition},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::TraceContextExt,
    Context,
};
use serde::de::DeserializeOwned;
use std::{
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

struct Acknowledger {
    acker: Arc<dyn DeliveryAcker>,
    delivery_tag: u64,
    queue: String,
    settled: bool,
}

impl Acknowledger {
    async fn settle(mut self, disposition: Disposition) -> Result<(), AmqpError> {
        self.settled = true;

        match disposition {
            Disposition::Acknowledge => self.acker.ack().await,
            Disposition::Discard => self.acker.nack(false).await,
            Disposition::Requeue => self.acker.nack(true).await,
        }
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                queue = self.queue,
                delivery.tag = self.delivery_tag,
                "message dropped without disposition, it stays unacknowledged until the channel closes"
            );
        }
    }
}

/// A decoded delivery awaiting exactly one disposition.
///
/// The disposition methods take the message by value, so a message can be settled once only.
/// Until it is settled the session prefetch slot stays taken and the broker pushes nothing else
/// on that channel.
pub struct Message<T> {
    payload: T,
    ctx: Context,
    message_id: Option<String>,
    redelivered: bool,
    acknowledger: Acknowledger,
}

impl<T> Message<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumer span context, child of the trace propagated by the producer.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Whether the broker delivered this message before, to this or another consumer.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn queue(&self) -> &str {
        &self.acknowledger.queue
    }

    /// Processed successfully, the broker forgets the message.
    pub async fn acknowledge(self) -> Result<(), AmqpError> {
        self.settle(Disposition::Acknowledge).await
    }

    /// Dropped for good, the broker never redelivers it.
    pub async fn discard(self) -> Result<(), AmqpError> {
        self.settle(Disposition::Discard).await
    }

    /// Handed back to the queue to be delivered again.
    pub async fn requeue(self) -> Result<(), AmqpError> {
        self.settle(Disposition::Requeue).await
    }

    pub async fn settle(self, disposition: Disposition) -> Result<(), AmqpError> {
        debug!(
            trace.id = traces::trace_id(&self.ctx),
            span.id = traces::span_id(&self.ctx),
            queue = self.acknowledger.queue,
            disposition = disposition.to_string(),
            "settling message"
        );

        self.acknowledger.settle(disposition).await
    }
}

async fn decode<T>(
    delivery: RawDelivery,
    tracer: &BoxedTracer,
    queue: &str,
) -> Result<Message<T>, AmqpError>
where
    T: DeserializeOwned,
{
    let (ctx, span) = otel::new_span(&delivery.headers, tracer, queue);
    let ctx = ctx.with_span(span);

    debug!(
        trace.id = traces::trace_id(&ctx),
        span.id = traces::span_id(&ctx),
        queue = queue,
        exchange = delivery.exchange,
        "message received"
    );

    let acknowledger = Acknowledger {
        acker: delivery.acker,
        delivery_tag: delivery.delivery_tag,
        queue: queue.to_owned(),
        settled: false,
    };

    match codec::decode::<T>(&delivery.data) {
        Ok(payload) => Ok(Message {
            payload,
            ctx,
            message_id: delivery.message_id,
            redelivered: delivery.redelivered,
            acknowledger,
        }),
        Err(err) => {
            error!(
                trace.id = traces::trace_id(&ctx),
                span.id = traces::span_id(&ctx),
                error = err.to_string(),
                queue = queue,
                "failure to parse payload, discarding message"
            );

            if let Err(nack) = acknowledger.settle(Disposition::Discard).await {
                error!(error = nack.to_string(), "failure to discard message");
            }

            Err(AmqpError::ParsePayloadError(err.to_string()))
        }
    }
}

/// Source of decoded messages from one queue.
///
/// Yields `Err(AmqpError::ParsePayloadError)` for a delivery that cannot be decoded (the
/// delivery is discarded first) and keeps going. Ends when the channel closes.
pub struct ReadStream<T> {
    queue: String,
    inner: BoxStream<'static, Result<Message<T>, AmqpError>>,
}

impl<T> ReadStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Starts consuming `queue` with a fresh consumer tag derived from `name`.
    pub(crate) async fn subscribe(
        channel: &Arc<dyn AmqpChannel>,
        name: &str,
        queue: String,
    ) -> Result<ReadStream<T>, AmqpError> {
        let tag = format!("{}-{}", name, Uuid::new_v4());
        let deliveries = channel.consume(&queue, &tag).await?;

        debug!(queue = queue, consumer.tag = tag, "consumer started");

        let tracer = Arc::new(global::tracer(otel::TRACER_NAME));
        let name = queue.clone();
        let inner = deliveries
            .then(move |res| {
                let tracer = tracer.clone();
                let queue = name.clone();
                async move {
                    match res {
                        Ok(delivery) => decode(delivery, &tracer, &queue).await,
                        Err(err) => Err(err),
                    }
                }
            })
            .boxed();

        Ok(ReadStream { queue, inner })
    }

    /// Name of the consumed queue, generated by the broker for broadcast readers.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Hands every message to `handler` and settles it from the outcome: `Ok` acknowledges,
    /// a retryable error requeues and any other error discards. Returns once the stream ends.
    pub async fn consume_blocking<H>(mut self, handler: Arc<H>)
    where
        T: Sync,
        H: ConsumerHandler<T> + ?Sized,
    {
        while let Some(next) = self.inner.next().await {
            match next {
                Ok(msg) => {
                    if let Err(err) = consumer::consume(handler.as_ref(), msg).await {
                        error!(error = err.to_string(), "failure to settle message");
                    }
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue = self.queue, "skipping delivery")
                }
            }
        }

        debug!(queue = self.queue, "consumer finished");
    }
}

impl<T> Stream for ReadStream<T> {
    type Item = Result<Message<T>, AmqpError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
