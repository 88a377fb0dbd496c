use crate::{
    channel::{AmqpChannel, BrokerSignal, Connector},
    client::LapinConnector,
    errors::AmqpError,
    publisher::Publisher,
    worker::Worker,
};
use configs::{Configs, DynamicConfigs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, error, warn};

/// Unacknowledged deliveries the broker pushes to a session before waiting for a disposition.
/// Applied to the whole channel, so every read stream of a session shares it.
pub const PREFETCH_COUNT: u16 = 1;

type ErrorHandler = Arc<dyn Fn(&AmqpError) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_error: Vec<ErrorHandler>,
    on_disconnect: Vec<DisconnectHandler>,
}

struct Listeners {
    connected: AtomicBool,
    handlers: Mutex<Handlers>,
}

impl Listeners {
    fn handle(&self, signal: BrokerSignal) {
        match signal {
            BrokerSignal::Closed => self.disconnect("closed"),
            BrokerSignal::ClosedByBroker(reason) => {
                self.error(AmqpError::BrokerError(reason.clone()));
                self.disconnect(&reason);
            }
            BrokerSignal::ConnectionLost(reason) => self.disconnect(&reason),
            BrokerSignal::Error(reason) => self.error(AmqpError::BrokerError(reason)),
        }
    }

    fn error(&self, err: AmqpError) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        error!(error = err.to_string(), "amqp session failure");

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_error
            .clone();
        for handler in handlers {
            handler(&err);
        }
    }

    /// Emits the disconnect notification once and drops every subscription.
    fn disconnect(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(reason = reason, "amqp session disconnected");

        let handlers = std::mem::take(
            &mut *self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handler in handlers.on_disconnect {
            handler();
        }
    }
}

/// One broker connection with its single channel.
///
/// Cloning a session shares the channel. Workers and publishers obtained from it hold a
/// reference to the same channel, which outlives every stream created on it. A session never
/// reconnects: after the disconnect notification it and everything derived from it are dead.
#[derive(Clone)]
pub struct Session {
    channel: Arc<dyn AmqpChannel>,
    listeners: Arc<Listeners>,
}

impl Session {
    pub(crate) async fn establish(channel: Arc<dyn AmqpChannel>) -> Result<Session, AmqpError> {
        channel.qos(PREFETCH_COUNT).await?;

        let listeners = Arc::new(Listeners {
            connected: AtomicBool::new(true),
            handlers: Mutex::new(Handlers::default()),
        });

        let forward = listeners.clone();
        channel.on_signal(Arc::new(move |signal| forward.handle(signal)));

        Ok(Session { channel, listeners })
    }

    /// Point-to-point handle for `name`. No broker round-trip happens until a stream is created.
    pub fn worker(&self, name: &str) -> Result<Worker, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::ValidationError("name".to_owned()));
        }

        Ok(Worker::new(self.channel.clone(), name))
    }

    /// Broadcast handle for `name`. No broker round-trip happens until a stream is created.
    pub fn publisher(&self, name: &str) -> Result<Publisher, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::ValidationError("name".to_owned()));
        }

        Ok(Publisher::new(self.channel.clone(), name))
    }

    /// Registers a callback invoked for every broker-side failure that does not end the session.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&AmqpError) + Send + Sync + 'static,
    {
        self.listeners
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_error
            .push(Arc::new(handler));
    }

    /// Registers a callback invoked once when the connection or the channel goes away.
    /// On a session that is already disconnected the callback runs immediately.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut handlers = self
            .listeners
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_connected() {
            handlers.on_disconnect.push(Arc::new(handler));
            return;
        }

        drop(handlers);
        handler();
    }

    pub fn is_connected(&self) -> bool {
        self.listeners.connected.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }

    /// Closes the channel and the connection, then emits the disconnect notification.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        let res = self.channel.close().await;
        self.listeners.disconnect("closed by the application");
        res
    }
}

/// Connects to `url` with lapin and prepares the session channel.
pub async fn connect(url: &str) -> Result<Session, AmqpError> {
    connect_with(&LapinConnector::new(), url).await
}

pub async fn connect_with(connector: &dyn Connector, url: &str) -> Result<Session, AmqpError> {
    if url.is_empty() {
        return Err(AmqpError::ValidationError("url".to_owned()));
    }

    let channel = connector.open(url).await?;
    let session = match Session::establish(channel.clone()).await {
        Ok(s) => Ok(s),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(
                    error = close_err.to_string(),
                    "failure to close the connection after a failed setup"
                );
            }
            Err(err)
        }
    }?;
    debug!("amqp session ready");

    Ok(session)
}

/// Connects with the RabbitMQ settings of `cfg`, naming the connection after the application.
pub async fn connect_with_configs<T>(cfg: &Configs<T>) -> Result<Session, AmqpError>
where
    T: DynamicConfigs,
{
    let connector = LapinConnector::new().connection_name(cfg.app.name.clone());

    connect_with(&connector, &cfg.rabbitmq_uri()).await
}
