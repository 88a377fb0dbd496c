//! In-process broker for tests.
//!
//! [`InMemoryBroker`] implements [`Connector`] and models the part of AMQP 0-9-1 the messaging
//! patterns rely on: direct and fanout routing, durable and exclusive queues, channel-wide
//! prefetch, ack/nack with requeue and the cleanup a broker performs when a channel goes away.
//! Deliveries are pushed synchronously while holding the broker lock, which makes "nothing was
//! delivered" observable without timers.

pub use crate::channel::{MockAmqpChannel, MockConnector};

use crate::{
    channel::{
        AmqpChannel, BrokerSignal, Connector, DeliveryAcker, DeliveryStream, PublishProperties,
        RawDelivery, SignalHandler,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::sync::mpsc::{self, UnboundedSender};

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Clone)]
struct Envelope {
    exchange: String,
    routing_key: String,
    message_id: String,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    redelivered: bool,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
}

struct ConsumerEntry {
    channel: u64,
    tx: UnboundedSender<Result<RawDelivery, AmqpError>>,
}

struct QueueEntry {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: u64,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

struct ChannelEntry {
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Envelope)>,
    handlers: Vec<SignalHandler>,
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < self.prefetch as usize)
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelEntry>,
    next_channel: u64,
    next_queue: u64,
}

impl BrokerState {
    fn is_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).map(|c| c.open).unwrap_or(false)
    }

    fn requeue_front(&mut self, queue: &str, mut envelope: Envelope) {
        if let Some(q) = self.queues.get_mut(queue) {
            envelope.redelivered = true;
            q.ready.push_front(envelope);
        }
    }

    /// Pushes ready messages to consumers, round-robin, while their channels have capacity.
    fn dispatch(&mut self, weak: &Weak<Mutex<BrokerState>>) {
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            loop {
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                let total = queue.consumers.len();
                let picked = (0..total)
                    .map(|offset| (queue.cursor + offset) % total)
                    .find(|idx| {
                        self.channels
                            .get(&queue.consumers[*idx].channel)
                            .map(ChannelEntry::has_capacity)
                            .unwrap_or(false)
                    });
                let Some(idx) = picked else {
                    break;
                };

                queue.cursor = (idx + 1) % total;
                let channel_id = queue.consumers[idx].channel;
                let tx = queue.consumers[idx].tx.clone();
                let Some(envelope) = queue.ready.pop_front() else {
                    break;
                };

                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    break;
                };
                channel.next_tag += 1;
                let tag = channel.next_tag;
                channel
                    .unacked
                    .insert(tag, (name.clone(), envelope.clone()));

                let delivery = RawDelivery {
                    delivery_tag: tag,
                    exchange: envelope.exchange.clone(),
                    routing_key: envelope.routing_key.clone(),
                    redelivered: envelope.redelivered,
                    message_id: Some(envelope.message_id.clone()),
                    headers: envelope.headers.clone(),
                    data: envelope.data.clone(),
                    acker: Arc::new(InMemoryAcker {
                        state: weak.clone(),
                        channel: channel_id,
                        tag,
                    }),
                };

                if tx.send(Ok(delivery)).is_err() {
                    // the consumer stream was dropped
                    channel.unacked.remove(&tag);
                    if let Some(queue) = self.queues.get_mut(&name) {
                        queue.consumers.retain(|c| !c.tx.same_channel(&tx));
                        queue.ready.push_front(envelope);
                        queue.cursor = 0;
                    }
                }
            }
        }
    }

    /// Closes `id` the way a broker does: unacked deliveries go back to the head of their queues,
    /// consumers are cancelled and exclusive or unused auto-delete queues disappear.
    fn close_channel(&mut self, id: u64) -> Vec<SignalHandler> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return vec![];
        };
        if !channel.open {
            return vec![];
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);
        let handlers = std::mem::take(&mut channel.handlers);

        for (_, (queue, envelope)) in unacked.into_iter().rev() {
            self.requeue_front(&queue, envelope);
        }

        let mut deleted = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            let cancelled = before != queue.consumers.len();
            queue.cursor = 0;

            if (queue.exclusive && queue.owner == id)
                || (queue.auto_delete && cancelled && queue.consumers.is_empty())
            {
                deleted.push(name.clone());
            }
        }

        for name in deleted {
            self.queues.remove(&name);
            self.bindings.retain(|b| b.queue != name);
        }

        handlers
    }
}

/// Broker living in the test process.
///
/// Every call to [`Connector::open`] yields a new connection with its own channel, so two
/// sessions opened on the same broker compete for the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Shared,
    reachable: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            reachable: true,
        }
    }

    /// A broker refusing every connection.
    pub fn unreachable() -> InMemoryBroker {
        InMemoryBroker {
            reachable: false,
            ..InMemoryBroker::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind)
    }

    pub fn is_durable_exchange(&self, name: &str) -> bool {
        self.lock()
            .exchanges
            .get(name)
            .map(|e| e.durable)
            .unwrap_or(false)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn is_durable_queue(&self, name: &str) -> bool {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.durable)
            .unwrap_or(false)
    }

    /// Number of messages waiting in `name`, unacknowledged deliveries excluded.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Names of the queues bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .map(|b| b.queue.clone())
            .collect()
    }

    /// Drops every connection as a network failure would.
    pub fn sever(&self) {
        let handlers = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            let handlers: Vec<SignalHandler> = ids
                .into_iter()
                .flat_map(|id| state.close_channel(id))
                .collect();
            let weak = Arc::downgrade(&self.state);
            state.dispatch(&weak);
            handlers
        };

        for handler in handlers {
            handler(BrokerSignal::ConnectionLost(
                "connection reset by peer".to_owned(),
            ));
        }
    }

    /// Closes every open channel with an error reply, as a broker does on `CONNECTION_FORCED`.
    pub fn fail_channels(&self, reason: &str) {
        let handlers = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            let handlers: Vec<SignalHandler> = ids
                .into_iter()
                .flat_map(|id| state.close_channel(id))
                .collect();
            let weak = Arc::downgrade(&self.state);
            state.dispatch(&weak);
            handlers
        };

        raise(handlers, reason);
    }
}

fn raise(handlers: Vec<SignalHandler>, reason: &str) {
    for handler in handlers {
        handler(BrokerSignal::ClosedByBroker(reason.to_owned()));
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn open(&self, url: &str) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.reachable {
            return Err(AmqpError::ConnectionError(url.to_owned()));
        }

        let mut state = self.lock();
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelEntry {
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                handlers: vec![],
            },
        );

        Ok(Arc::new(InMemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }
}

struct InMemoryChannel {
    state: Shared,
    id: u64,
}

impl InMemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel-level exception: the broker closes the channel and reports `reason`.
    fn close_with(&self, mut state: MutexGuard<'_, BrokerState>, reason: &str) {
        let handlers = state.close_channel(self.id);
        let weak = Arc::downgrade(&self.state);
        state.dispatch(&weak);
        drop(state);

        raise(handlers, reason);
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.lock();
        match state.channels.get_mut(&self.id) {
            Some(channel) if channel.open => {
                channel.prefetch = prefetch;
                Ok(())
            }
            _ => Err(AmqpError::PrefetchError),
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.lock();
        if !state.is_open(self.id) {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        let conflicting = state
            .exchanges
            .get(def.name())
            .map(|e| e.kind != def.exchange_kind() || e.durable != def.is_durable());

        match conflicting {
            Some(true) => {
                self.close_with(
                    state,
                    &format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        def.name()
                    ),
                );
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(false) => Ok(()),
            None => {
                state.exchanges.insert(
                    def.name().to_owned(),
                    ExchangeEntry {
                        kind: def.exchange_kind(),
                        durable: def.is_durable(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.lock();
        if !state.is_open(self.id) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        let name = if def.is_anonymous() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            def.name().to_owned()
        };

        if let Some(existing) = state.queues.get(&name) {
            let reason = if existing.exclusive && existing.owner != self.id {
                Some(format!("RESOURCE_LOCKED - exclusive queue '{name}'"))
            } else if existing.durable != def.is_durable() {
                Some(format!("PRECONDITION_FAILED - inequivalent arg for queue '{name}'"))
            } else {
                None
            };

            if let Some(reason) = reason {
                self.close_with(state, &reason);
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueEntry {
                durable: def.is_durable(),
                exclusive: def.is_exclusive(),
                auto_delete: def.is_auto_delete(),
                owner: self.id,
                ready: VecDeque::new(),
                consumers: vec![],
                cursor: 0,
            },
        );

        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.lock();
        let err = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            )
        };

        if !state.is_open(self.id)
            || !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(err());
        }

        let exists = state.bindings.iter().any(|b| {
            b.exchange == binding.exchange_name()
                && b.queue == binding.queue_name()
                && b.key == binding.key()
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: binding.exchange_name().to_owned(),
                queue: binding.queue_name().to_owned(),
                key: binding.key().to_owned(),
            });
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock();
        if !state.is_open(self.id) {
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }

        let targets: Vec<String> = if exchange.is_empty() {
            vec![key.to_owned()]
        } else {
            let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
                return Err(AmqpError::PublishingError(exchange.to_owned()));
            };
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| kind == ExchangeKind::Fanout || b.key == key)
                .map(|b| b.queue.clone())
                .collect()
        };

        let envelope = Envelope {
            exchange: exchange.to_owned(),
            routing_key: key.to_owned(),
            message_id: props.message_id.clone(),
            headers: props.headers.clone(),
            data: payload.to_vec(),
            redelivered: false,
        };

        // unroutable messages are dropped
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(envelope.clone());
            }
        }

        let weak = Arc::downgrade(&self.state);
        state.dispatch(&weak);

        Ok(())
    }

    async fn consume(&self, queue: &str, _tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.lock();
            let open = state.is_open(self.id);
            let Some(entry) = state.queues.get_mut(queue).filter(|_| open) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };
            entry.consumers.push(ConsumerEntry {
                channel: self.id,
                tx,
            });

            let weak = Arc::downgrade(&self.state);
            state.dispatch(&weak);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn on_signal(&self, handler: SignalHandler) {
        if let Some(channel) = self.lock().channels.get_mut(&self.id) {
            channel.handlers.push(handler);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.close_channel(self.id);
        let weak = Arc::downgrade(&self.state);
        state.dispatch(&weak);
        Ok(())
    }
}

struct InMemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: u64,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>, err: AmqpError) -> Result<(), AmqpError> {
        let Some(state) = self.state.upgrade() else {
            return Err(err);
        };
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some((queue, envelope)) = guard
            .channels
            .get_mut(&self.channel)
            .filter(|c| c.open)
            .and_then(|c| c.unacked.remove(&self.tag))
        else {
            return Err(err);
        };

        if requeue == Some(true) {
            guard.requeue_front(&queue, envelope);
        }

        guard.dispatch(&self.state);
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(None, AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let err = if requeue {
            AmqpError::RequeuingMessageError
        } else {
            AmqpError::NackMessageError
        };
        self.settle(Some(requeue), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn props(id: &str) -> PublishProperties {
        PublishProperties {
            message_id: id.to_owned(),
            ..PublishProperties::default()
        }
    }

    async fn work_queue(channel: &Arc<dyn AmqpChannel>) {
        channel
            .declare_exchange(&ExchangeDefinition::new("jobs").direct().durable())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDefinition::new("jobs").durable())
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("jobs").exchange("jobs"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_refuse_connections_when_unreachable() {
        let res = InMemoryBroker::unreachable().open("amqp://localhost").await;

        assert_eq!(
            res.err(),
            Some(AmqpError::ConnectionError("amqp://localhost".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_hold_back_deliveries_over_prefetch() {
        let broker = InMemoryBroker::new();
        let channel = broker.open("amqp://localhost").await.unwrap();
        channel.qos(1).await.unwrap();
        work_queue(&channel).await;

        channel.publish("jobs", "", b"1", &props("1")).await.unwrap();
        channel.publish("jobs", "", b"2", &props("2")).await.unwrap();

        let mut deliveries = channel.consume("jobs", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"1");
        assert!(deliveries.next().now_or_never().is_none());
        assert_eq!(broker.queue_depth("jobs"), 1);

        first.acker.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"2");
        assert_eq!(second.message_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn should_redeliver_requeued_message_first() {
        let broker = InMemoryBroker::new();
        let channel = broker.open("amqp://localhost").await.unwrap();
        channel.qos(1).await.unwrap();
        work_queue(&channel).await;

        channel.publish("jobs", "", b"1", &props("1")).await.unwrap();
        channel.publish("jobs", "", b"2", &props("2")).await.unwrap();

        let mut deliveries = channel.consume("jobs", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        first.acker.nack(true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"1");
        assert!(again.redelivered);
        assert_eq!(first.acker.ack().await, Err(AmqpError::AckMessageError));
    }

    #[tokio::test]
    async fn should_return_unacked_deliveries_on_close() {
        let broker = InMemoryBroker::new();
        let channel = broker.open("amqp://localhost").await.unwrap();
        work_queue(&channel).await;
        channel.publish("jobs", "", b"1", &props("1")).await.unwrap();

        let mut deliveries = channel.consume("jobs", "c1").await.unwrap();
        let _pending = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("jobs"), 0);

        channel.close().await.unwrap();

        assert_eq!(broker.queue_depth("jobs"), 1);
        assert_eq!(broker.unacked(), 0);
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn should_close_the_channel_on_conflicting_redeclaration() {
        let broker = InMemoryBroker::new();
        let channel = broker.open("amqp://localhost").await.unwrap();
        work_queue(&channel).await;

        let seen = Arc::new(Mutex::new(vec![]));
        let recorded = seen.clone();
        channel.on_signal(Arc::new(move |signal: BrokerSignal| {
            recorded.lock().unwrap().push(signal);
        }));

        let res = channel
            .declare_exchange(&ExchangeDefinition::new("jobs").fanout().durable())
            .await;

        assert_eq!(
            res,
            Err(AmqpError::DeclareExchangeError("jobs".to_owned()))
        );
        assert_eq!(broker.exchange_kind("jobs"), Some(ExchangeKind::Direct));
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [BrokerSignal::ClosedByBroker(reason)] if reason.starts_with("PRECONDITION_FAILED")
        ));
        assert!(channel
            .publish("jobs", "", b"1", &props("1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn should_close_the_channel_on_foreign_exclusive_queue() {
        let broker = InMemoryBroker::new();
        let owner = broker.open("amqp://localhost").await.unwrap();
        let other = broker.open("amqp://localhost").await.unwrap();
        owner
            .declare_queue(&QueueDefinition::new("private").exclusive())
            .await
            .unwrap();

        let res = other
            .declare_queue(&QueueDefinition::new("private").exclusive())
            .await;

        assert_eq!(res, Err(AmqpError::DeclareQueueError("private".to_owned())));
        assert!(other.qos(1).await.is_err());
        assert!(owner.qos(1).await.is_ok());
    }

    #[tokio::test]
    async fn should_notify_handlers_when_severed() {
        let broker = InMemoryBroker::new();
        let channel = broker.open("amqp://localhost").await.unwrap();

        let seen = Arc::new(Mutex::new(vec![]));
        let recorded = seen.clone();
        channel.on_signal(Arc::new(move |signal: BrokerSignal| {
            recorded.lock().unwrap().push(signal);
        }));

        broker.sever();
        broker.sever();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![BrokerSignal::ConnectionLost(
                "connection reset by peer".to_owned()
            )]
        );
        assert!(channel
            .publish("jobs", "", b"1", &props("1"))
            .await
            .is_err());
    }
}
