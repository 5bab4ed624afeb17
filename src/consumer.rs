// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! A [`Consumer`] owns one connection and one channel for a single
//! [`ConsumerHandler`]. Running it dials the broker, subscribes to the queue
//! and starts the worker pool. A supervisor task watches the connection and,
//! when the broker drops it, reconnects and sets the consumer up again.
//!
//! Lifecycle:
//! `Disconnected -> Connected -> Configured`, back to `Reconnecting` when the
//! connection is lost, and `ShuttingDown` once [`Consumer::close`] is called.
//!
//! Every connection gets a new epoch. A setup started on one epoch only
//! touches the state if that epoch is still current when it completes.
//!
//! The state lock is never held across network calls.

use crate::{
    backoff::{Backoff, ReconnectPolicy},
    channel::BrokerChannel,
    connection::{AmqpConnector, BrokerConnection, Connector, SubscribeRequest},
    errors::AmqpError,
    handler::ConsumerHandler,
    observer::{ConsumerObserver, TracingObserver},
    queue::QueueOptions,
    worker::{shutdown_requested, WorkerPool},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Observable state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Disconnected,
    Connected,
    Configured,
    Reconnecting,
    ShuttingDown,
}

/// Connection loss reported by the broker client, tagged with the epoch of
/// the connection it belongs to.
#[derive(Debug)]
struct CloseNotification {
    epoch: u64,
    reason: String,
}

#[derive(Default)]
struct ConnectionState {
    connected: bool,
    configured: bool,
    reconnecting: bool,
    shutting_down: bool,
    epoch: u64,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    close_rx: Option<mpsc::UnboundedReceiver<CloseNotification>>,
}

impl ConnectionState {
    fn status(&self) -> ConsumerStatus {
        if self.shutting_down {
            ConsumerStatus::ShuttingDown
        } else if self.reconnecting {
            ConsumerStatus::Reconnecting
        } else if self.configured {
            ConsumerStatus::Configured
        } else if self.connected {
            ConsumerStatus::Connected
        } else {
            ConsumerStatus::Disconnected
        }
    }

    /// Claims the configuration of the current connection and returns its
    /// epoch.
    fn begin_configure(&mut self) -> Result<u64, AmqpError> {
        if self.shutting_down {
            return Err(AmqpError::ShuttingDown);
        }
        if self.configured {
            return Err(AmqpError::AlreadyConfigured);
        }
        self.configured = true;
        Ok(self.epoch)
    }

    /// Releases a failed claim. A claim made on an older epoch is ignored.
    fn abort_configure(&mut self, epoch: u64) {
        if self.epoch == epoch {
            self.configured = false;
        }
    }

    /// Stores the channel of a completed setup. Returns false when the claim
    /// no longer holds.
    fn attach_channel(&mut self, epoch: u64, channel: Arc<dyn BrokerChannel>) -> bool {
        if self.shutting_down || !self.configured || self.epoch != epoch {
            return false;
        }
        self.channel = Some(channel);
        true
    }

    /// Forgets the current connection and starts a new epoch.
    fn invalidate(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        self.epoch += 1;
        self.connected = false;
        self.configured = false;
        self.channel = None;
        self.connection.take()
    }

    /// Enters the reconnecting state. Returns false when a reconnect is
    /// already running or the consumer is shutting down.
    fn begin_reconnect(&mut self) -> bool {
        if self.reconnecting || self.shutting_down {
            return false;
        }
        self.reconnecting = true;
        self.invalidate();
        true
    }

    fn finish_reconnect(&mut self) {
        self.reconnecting = false;
    }
}

/// Handler settings with the lower bounds applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    concurrent: usize,
    max_attempts: i32,
    max_in_flight: u16,
    consumer_tag: String,
}

impl Settings {
    fn from_handler(handler: &ConsumerHandler) -> Self {
        let consumer_tag = if handler.channel.is_empty() {
            format!("{}-{}", handler.topic, Uuid::new_v4())
        } else {
            handler.channel.clone()
        };

        Settings {
            concurrent: handler.concurrent.max(1),
            max_attempts: handler.max_attempts.max(1),
            max_in_flight: handler.max_in_flight.max(1),
            consumer_tag,
        }
    }
}

/// Configures a [`Consumer`] before it is built.
pub struct ConsumerBuilder {
    handler: ConsumerHandler,
    observer: Arc<dyn ConsumerObserver>,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    reconnect_policy: ReconnectPolicy,
    connection_name: Option<String>,
}

impl ConsumerBuilder {
    /// Where lifecycle and delivery events are reported. Defaults to
    /// [`TracingObserver`].
    pub fn observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// How the broker is dialed. Defaults to [`AmqpConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Delay policy for requeued messages.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay policy between reconnection attempts.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Name the broker shows for the connection. Defaults to the topic.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Builds the consumer. Nothing is dialed until [`Consumer::run`].
    pub fn build(self) -> Consumer {
        let (shutdown, _) = watch::channel(false);
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let connection_name = self
            .connection_name
            .unwrap_or_else(|| self.handler.topic.clone());

        Consumer {
            inner: Arc::new(Inner {
                handler: self.handler,
                connection_name,
                observer: self.observer,
                connector: self.connector,
                backoff: self.backoff,
                reconnect_policy: self.reconnect_policy,
                state: Mutex::new(ConnectionState {
                    close_rx: Some(close_rx),
                    ..Default::default()
                }),
                shutdown,
                close_tx,
            }),
        }
    }
}

struct Inner {
    handler: ConsumerHandler,
    connection_name: String,
    observer: Arc<dyn ConsumerObserver>,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    reconnect_policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
    shutdown: watch::Sender<bool>,
    close_tx: mpsc::UnboundedSender<CloseNotification>,
}

/// A consumer bound to one queue. Cloning yields another handle to the same
/// consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

enum Attach {
    Attached,
    AlreadyConnected,
    ShuttingDown,
}

impl Consumer {
    /// Creates a consumer for `handler` with the default observer, connector
    /// and policies.
    ///
    /// # Parameters
    /// * `handler` - Queue settings and the handler to run for each delivery.
    pub fn new(handler: ConsumerHandler) -> Self {
        Consumer::builder(handler).build()
    }

    /// Starts a [`ConsumerBuilder`] for `handler`.
    pub fn builder(handler: ConsumerHandler) -> ConsumerBuilder {
        ConsumerBuilder {
            handler,
            observer: Arc::new(TracingObserver),
            connector: Arc::new(AmqpConnector),
            backoff: Backoff::default(),
            reconnect_policy: ReconnectPolicy::default(),
            connection_name: None,
        }
    }

    pub fn handler(&self) -> &ConsumerHandler {
        &self.inner.handler
    }

    pub fn topic(&self) -> &str {
        &self.inner.handler.topic
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConsumerStatus {
        self.state().status()
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects, starts the reconnect supervisor and sets the consumer up.
    ///
    /// A setup error is returned to the caller but the supervisor keeps
    /// running, so a later reconnect can still bring the consumer up.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `AmqpError::MissingHandler` without a handler
    ///   function, otherwise the first dial or setup error.
    pub async fn run(&self) -> Result<(), AmqpError> {
        if self.inner.handler.handler.is_none() {
            return Err(AmqpError::MissingHandler);
        }

        self.connect().await?;

        let close_rx = self.state().close_rx.take();
        if let Some(close_rx) = close_rx {
            tokio::spawn(self.clone().supervise(close_rx));
        }

        self.setup_consumer().await
    }

    /// Dials the broker unless a connection is already established.
    pub(crate) async fn connect(&self) -> Result<(), AmqpError> {
        {
            let state = self.state();
            if state.shutting_down {
                return Err(AmqpError::ShuttingDown);
            }
            if state.connected {
                return Ok(());
            }
        }

        let conn = self
            .inner
            .connector
            .connect(&self.inner.handler.url, &self.inner.connection_name)
            .await?;

        let attached = {
            let mut state = self.state();
            if state.shutting_down {
                Attach::ShuttingDown
            } else if state.connected {
                Attach::AlreadyConnected
            } else {
                state.epoch += 1;
                let epoch = state.epoch;
                let close_tx = self.inner.close_tx.clone();
                conn.on_close(Box::new(move |reason| {
                    let _ = close_tx.send(CloseNotification { epoch, reason });
                }));
                state.connection = Some(conn.clone());
                state.connected = true;
                Attach::Attached
            }
        };

        match attached {
            Attach::Attached => {
                self.inner.observer.connected(self.topic());
                Ok(())
            }
            Attach::AlreadyConnected => {
                close_quietly(conn.as_ref()).await;
                Ok(())
            }
            Attach::ShuttingDown => {
                close_quietly(conn.as_ref()).await;
                Err(AmqpError::ShuttingDown)
            }
        }
    }

    /// Subscribes to the queue and spawns the workers. Runs once per
    /// connection.
    pub(crate) async fn setup_consumer(&self) -> Result<(), AmqpError> {
        let (epoch, connection) = {
            let mut state = self.state();
            let epoch = state.begin_configure()?;
            (epoch, state.connection.clone())
        };

        let result = match connection {
            Some(connection) => self.configure(epoch, connection.as_ref()).await,
            None => Err(AmqpError::NotConnected),
        };

        if let Err(err) = result {
            self.state().abort_configure(epoch);
            self.inner.observer.setup_failed(self.topic(), &err);
            return Err(err);
        }

        Ok(())
    }

    async fn configure(&self, epoch: u64, connection: &dyn BrokerConnection) -> Result<(), AmqpError> {
        let handler = &self.inner.handler;
        let handler_fn = handler.handler.clone().ok_or(AmqpError::MissingHandler)?;
        let settings = Settings::from_handler(handler);

        let subscription = connection
            .subscribe(SubscribeRequest {
                topic: handler.topic.clone(),
                consumer_tag: settings.consumer_tag.clone(),
                max_in_flight: settings.max_in_flight,
                max_attempts: settings.max_attempts,
                options: QueueOptions::from_extra(handler.extra_config()),
                observer: self.inner.observer.clone(),
            })
            .await?;

        if !self.state().attach_channel(epoch, subscription.channel.clone()) {
            debug!(topic = handler.topic, epoch, "dropping setup of a superseded connection");
            if let Err(err) = subscription.channel.shutdown().await {
                debug!(error = err.to_string(), "failure to close channel");
            }
            return Err(AmqpError::NotConnected);
        }

        let pool = WorkerPool::new(
            &handler.topic,
            handler_fn,
            self.inner.backoff,
            self.inner.observer.clone(),
        );
        pool.spawn(
            subscription.messages,
            settings.concurrent,
            self.inner.shutdown.subscribe(),
        );

        debug!(
            topic = handler.topic,
            workers = settings.concurrent,
            epoch,
            "consumer configured"
        );

        Ok(())
    }

    async fn supervise(self, mut close_rx: mpsc::UnboundedReceiver<CloseNotification>) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            let notification = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return,
                notification = close_rx.recv() => notification,
            };

            let Some(notification) = notification else {
                return;
            };

            if notification.epoch != self.state().epoch {
                debug!(
                    topic = self.topic(),
                    epoch = notification.epoch,
                    "ignoring close of a superseded connection"
                );
                continue;
            }

            self.inner
                .observer
                .connection_lost(self.topic(), &notification.reason);
            self.reconnect().await;
        }
    }

    /// Re-establishes the connection and the consumer setup, retrying with a
    /// doubling delay until it succeeds or the consumer is closed.
    pub(crate) async fn reconnect(&self) {
        if !self.state().begin_reconnect() {
            return;
        }

        let policy = self.inner.reconnect_policy;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut delay = policy.initial();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    self.state().finish_reconnect();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = match self.connect().await {
                Ok(()) => match self.setup_consumer().await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.drop_connection().await;
                        Err(err)
                    }
                },
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    self.state().finish_reconnect();
                    self.inner.observer.reconnected(self.topic());
                    return;
                }
                Err(err) => {
                    delay = policy.next(delay);
                    self.inner
                        .observer
                        .reconnect_failed(self.topic(), &err, delay);
                }
            }
        }
    }

    async fn drop_connection(&self) {
        let connection = self.state().invalidate();

        if let Some(connection) = connection {
            close_quietly(connection.as_ref()).await;
        }
    }

    /// Stops the supervisor and the workers, then closes the channel and the
    /// connection.
    ///
    /// Handlers already running are not interrupted.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - The error from closing the connection, if any.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let (channel, connection) = {
            let mut state = self.state();
            state.shutting_down = true;
            state.connected = false;
            state.configured = false;
            (state.channel.take(), state.connection.take())
        };

        self.inner.shutdown.send_replace(true);

        if let Some(channel) = channel {
            if let Err(err) = channel.shutdown().await {
                debug!(error = err.to_string(), "failure to close channel");
            }
        }

        let result = match connection {
            Some(connection) => connection.shutdown().await,
            None => Ok(()),
        };

        self.inner.observer.shutdown(self.topic());
        result
    }
}

async fn close_quietly(connection: &dyn BrokerConnection) {
    if let Err(err) = connection.shutdown().await {
        debug!(error = err.to_string(), "failure to close connection");
    }
}
