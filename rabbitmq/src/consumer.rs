use crate::{errors::AmqpError, read_stream::Message};
use messaging::handler::{ConsumerHandler, Disposition};
use opentelemetry::trace::{Status, TraceContextExt};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Runs `handler` on one message and settles it according to the outcome.
pub(crate) async fn consume<T, H>(handler: &H, msg: Message<T>) -> Result<Disposition, AmqpError>
where
    T: Send + Sync,
    H: ConsumerHandler<T> + ?Sized,
{
    let ctx = msg.context().clone();

    let outcome = handler.exec(&ctx, msg.payload()).await;
    let disposition = Disposition::from_outcome(&outcome);

    {
        let span = ctx.span();
        match &outcome {
            Ok(_) => {
                debug!(
                    trace.id = traces::trace_id(&ctx),
                    span.id = traces::span_id(&ctx),
                    queue = msg.queue(),
                    "message successfully processed"
                );
                span.set_status(Status::Ok);
            }
            Err(err) if disposition == Disposition::Requeue => {
                warn!(
                    trace.id = traces::trace_id(&ctx),
                    span.id = traces::span_id(&ctx),
                    error = err.to_string(),
                    queue = msg.queue(),
                    "error whiling handling msg, requeuing for latter"
                );
                span.record_error(err);
            }
            Err(err) => {
                error!(
                    trace.id = traces::trace_id(&ctx),
                    span.id = traces::span_id(&ctx),
                    error = err.to_string(),
                    queue = msg.queue(),
                    "error whiling handling msg, discarding"
                );
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from("message discarded"),
                });
            }
        }
    }

    msg.settle(disposition).await?;

    Ok(disposition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::InMemoryBroker, session::connect_with};
    use async_trait::async_trait;
    use futures_util::{FutureExt, StreamExt};
    use messaging::errors::MessagingError;
    use opentelemetry::Context;
    use serde_json::{json, Value};

    struct Flaky;

    #[async_trait]
    impl ConsumerHandler<Value> for Flaky {
        async fn exec(&self, _ctx: &Context, payload: &Value) -> Result<(), MessagingError> {
            match payload["kind"].as_str() {
                Some("ok") => Ok(()),
                Some("retry") => Err(MessagingError::RetryableError("later".to_owned())),
                _ => Err(MessagingError::ConsumerError("bad message".to_owned())),
            }
        }
    }

    #[tokio::test]
    async fn should_map_handler_outcome_to_disposition() {
        let broker = InMemoryBroker::new();
        let session = connect_with(&broker, "amqp://localhost").await.unwrap();
        let worker = session.worker("jobs").unwrap();
        let writer = worker.create_write_stream::<Value>().await.unwrap();
        let mut reader = worker.create_read_stream::<Value>().await.unwrap();

        writer.write(&json!({ "kind": "ok" })).await.unwrap();
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(consume(&Flaky, msg).await, Ok(Disposition::Acknowledge));

        writer.write(&json!({ "kind": "retry" })).await.unwrap();
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(consume(&Flaky, msg).await, Ok(Disposition::Requeue));

        let msg = reader.next().await.unwrap().unwrap();
        assert!(msg.redelivered());
        assert_eq!(msg.payload()["kind"], "retry");

        writer.write(&json!({ "kind": "broken" })).await.unwrap();
        msg.acknowledge().await.unwrap();
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(consume(&Flaky, msg).await, Ok(Disposition::Discard));

        assert!(reader.next().now_or_never().is_none());
        assert_eq!(broker.queue_depth("jobs"), 0);
        assert_eq!(broker.unacked(), 0);
    }
}
