// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! The `ConnectionManager` multiplexes consumer channels over a small set of
//! physical connections. It owns:
//! - a registry of connections keyed by their canonical URI, each with the
//!   set of channels opened on it;
//! - an event queue fed by broker close notifications, applied by a single
//!   event loop so every state change happens under the registry lock;
//! - a reaper that drains and closes faulted channels, then releases
//!   connections left without channels;
//! - a sampler reporting queue depth and oldest-message age.
//!
//! The manager never reconnects on its own. Consumers and producers ask for a
//! new channel or connection when theirs goes away.

use crate::{
    broker::{BrokerChannel, Connector, DeliveryStream},
    channel::ManagedChannel,
    config::{effective_tag, ConnectionConfig, ConsumerConfig, SupervisorOptions},
    connection::{EntityState, ManagedConnection},
    errors::AmqpError,
    metrics::Metrics,
    queue::with_priority,
};
use futures_util::future::join_all;
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, warn};

/// State changes posted to the manager's event loop.
#[derive(Debug)]
pub(crate) enum Event {
    ConnectionFaulted {
        connection_id: u64,
        error: AmqpError,
    },
    ChannelFaulted {
        connection_id: u64,
        channel_id: u64,
        error: Option<AmqpError>,
    },
    ChannelReaped {
        connection_id: u64,
        channel_id: u64,
    },
}

struct ChannelSlot {
    channel: Arc<ManagedChannel>,
    reaping: bool,
}

struct ConnectionEntry {
    key: String,
    connection: Arc<ManagedConnection>,
    channels: HashMap<u64, ChannelSlot>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<u64, ConnectionEntry>,
}

impl Registry {
    fn live_connection(&self, key: &str) -> Option<Arc<ManagedConnection>> {
        self.connections
            .values()
            .find(|entry| entry.key == key && entry.connection.is_live())
            .map(|entry| Arc::clone(&entry.connection))
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: SupervisorOptions,
    metrics: Arc<Metrics>,
    registry: Mutex<Registry>,
    events: mpsc::UnboundedSender<Event>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Shared registry of broker connections and consumer channels.
///
/// Cloning the manager yields another handle to the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Creates the manager and starts its event loop, reaper and sampler.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Parameters
    /// * `connector` - Dials the physical broker connections
    /// * `options` - Background intervals, backoff and publish retry settings
    /// * `metrics` - Instruments fed by consumers and the sampler
    ///
    /// # Returns
    /// A cloneable handle; every clone drives the same registry
    pub fn new(
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
        metrics: Metrics,
    ) -> ConnectionManager {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connector,
            options,
            metrics: Arc::new(metrics),
            registry: Mutex::new(Registry::default()),
            events,
            next_id: AtomicU64::new(1),
            shutdown: watch::Sender::new(false),
        });

        let tasks = vec![
            tokio::spawn(event_loop(Arc::clone(&inner), receiver)),
            tokio::spawn(reap_loop(Arc::clone(&inner))),
            tokio::spawn(sample_loop(Arc::clone(&inner))),
        ];

        ConnectionManager {
            inner,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.inner.connector
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Returns the live connection for `cfg`, dialing one if there is none.
    ///
    /// The registry lock is held across the dial, so concurrent callers with
    /// the same key wait for the first dial and then share its connection.
    ///
    /// # Parameters
    /// * `cfg` - Broker address and credentials; its canonical URI is the key
    /// * `tag` - Connection name announced to the broker when dialing
    ///
    /// # Returns
    /// The shared connection, or the dial error
    pub async fn get_connection(
        &self,
        cfg: &ConnectionConfig,
        tag: &str,
    ) -> Result<Arc<ManagedConnection>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionError(
                "connection manager is closed".to_owned(),
            ));
        }

        let key = cfg.amqp_uri()?;
        let mut registry = self.inner.registry.lock().await;
        if let Some(connection) = registry.live_connection(&key) {
            return Ok(connection);
        }

        let host = cfg.host();
        debug!(host = host.as_str(), "dialing broker");
        let transport = self.inner.connector.connect(&key, &effective_tag(tag)).await?;

        let connection = Arc::new(ManagedConnection::new(self.inner.next_id(), host, transport));
        let connection_id = connection.id();
        let events = self.inner.events.clone();
        connection.transport().on_close(Box::new(move |error| {
            let _ = events.send(Event::ConnectionFaulted {
                connection_id,
                error,
            });
        }));

        registry.connections.insert(
            connection_id,
            ConnectionEntry {
                key,
                connection: Arc::clone(&connection),
                channels: HashMap::new(),
            },
        );

        Ok(connection)
    }

    /// Opens a consumer channel for `consumer_cfg` on the shared connection.
    ///
    /// The channel gets `basic.qos` with the effective prefetch, its queue is
    /// declared (with `x-max-priority` when requested) and consumption starts
    /// under the consumer tag. Failures are returned as is; retrying is up to
    /// the caller.
    ///
    /// # Parameters
    /// * `connection_cfg` - Broker the channel is opened on
    /// * `consumer_cfg` - Queue, prefetch, priority and tag of the subscription
    ///
    /// # Returns
    /// The connection together with the new channel, already consuming
    pub async fn get_channel(
        &self,
        connection_cfg: &ConnectionConfig,
        consumer_cfg: &ConsumerConfig,
    ) -> Result<(Arc<ManagedConnection>, Arc<ManagedChannel>), AmqpError> {
        let connection = self.get_connection(connection_cfg, &consumer_cfg.tag).await?;

        let transport = match connection.transport().create_channel().await {
            Ok(transport) => transport,
            Err(err) => {
                // a connection that cannot open channels is gone
                let _ = self.inner.events.send(Event::ConnectionFaulted {
                    connection_id: connection.id(),
                    error: err.clone(),
                });
                return Err(err);
            }
        };

        let channel_id = self.inner.next_id();
        let deliveries = match self
            .subscribe(&transport, consumer_cfg, connection.id(), channel_id)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                release_channel(transport);
                return Err(err);
            }
        };

        let channel = Arc::new(ManagedChannel::new(
            channel_id,
            Arc::clone(&connection),
            transport,
            consumer_cfg.clone(),
            deliveries,
            self.inner.events.clone(),
        ));

        let mut registry = self.inner.registry.lock().await;
        match registry.connections.get_mut(&connection.id()) {
            Some(entry) if entry.connection.is_live() => {
                entry.channels.insert(
                    channel_id,
                    ChannelSlot {
                        channel: Arc::clone(&channel),
                        reaping: false,
                    },
                );
            }
            _ => {
                drop(registry);
                release_channel(Arc::clone(channel.transport()));
                return Err(AmqpError::ChannelError(
                    "connection closed while opening the channel".to_owned(),
                ));
            }
        }

        debug!(
            queue = consumer_cfg.queue.as_str(),
            prefetch = consumer_cfg.prefetch(),
            "channel subscribed"
        );

        Ok((connection, channel))
    }

    /// Marks a pooled connection as faulted, as if the broker had closed it.
    pub(crate) fn fault_connection(&self, connection_id: u64, error: AmqpError) {
        let _ = self.inner.events.send(Event::ConnectionFaulted {
            connection_id,
            error,
        });
    }

    async fn subscribe(
        &self,
        transport: &Arc<dyn BrokerChannel>,
        cfg: &ConsumerConfig,
        connection_id: u64,
        channel_id: u64,
    ) -> Result<DeliveryStream, AmqpError> {
        transport.basic_qos(cfg.prefetch()).await?;

        transport
            .queue_declare(
                &cfg.queue,
                QueueDeclareOptions::default(),
                with_priority(FieldTable::default(), cfg.queue_priority),
            )
            .await?;

        let events = self.inner.events.clone();
        transport.on_close(Box::new(move |error| {
            let _ = events.send(Event::ChannelFaulted {
                connection_id,
                channel_id,
                error: Some(error),
            });
        }));

        transport
            .basic_consume(&cfg.queue, &cfg.effective_tag())
            .await
    }

    /// Registered connections, in no particular order.
    ///
    /// Faulted connections stay listed, as `Draining`, until the reaper has
    /// closed all their channels.
    pub async fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        self.inner
            .registry
            .lock()
            .await
            .connections
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    /// Channels still registered on a connection, including draining ones.
    ///
    /// # Parameters
    /// * `connection_id` - Id of a connection returned by `connections`
    ///
    /// # Returns
    /// The channels, or an empty list for an unknown id
    pub async fn channels(&self, connection_id: u64) -> Vec<Arc<ManagedChannel>> {
        self.inner
            .registry
            .lock()
            .await
            .connections
            .get(&connection_id)
            .map(|entry| {
                entry
                    .channels
                    .values()
                    .map(|slot| Arc::clone(&slot.channel))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stops the background tasks, then drains and closes everything.
    ///
    /// Waits for every outstanding delivery to be settled first, so consumers
    /// should be closed before the manager.
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "manager task failed");
            }
        }

        let entries = self
            .inner
            .registry
            .lock()
            .await
            .connections
            .drain()
            .map(|(_, entry)| entry)
            .collect::<Vec<_>>();

        for entry in entries {
            entry.connection.transition(EntityState::Draining);

            join_all(entry.channels.into_values().map(|slot| async move {
                slot.channel.transition(EntityState::Draining);
                slot.channel.wait_drained().await;
                if let Err(err) = slot.channel.transport().close().await {
                    debug!(error = err.to_string(), "failure to close channel");
                }
                slot.channel.transition(EntityState::Closed);
            }))
            .await;

            if let Err(err) = entry.connection.transport().close().await {
                warn!(
                    error = err.to_string(),
                    host = entry.connection.host(),
                    "failure to close connection"
                );
            }
            entry.connection.transition(EntityState::Closed);
        }

        debug!("connection manager closed");
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn apply(&self, event: Event) {
        let mut registry = self.registry.lock().await;

        match event {
            Event::ConnectionFaulted {
                connection_id,
                error,
            } => {
                let Some(entry) = registry.connections.get(&connection_id) else {
                    return;
                };

                if entry.connection.transition(EntityState::Draining) {
                    warn!(
                        error = error.to_string(),
                        host = entry.connection.host(),
                        "connection faulted"
                    );
                }

                for slot in entry.channels.values() {
                    if slot.channel.transition(EntityState::Draining) {
                        slot.channel.config().report(&error);
                    }
                }
            }

            Event::ChannelFaulted {
                connection_id,
                channel_id,
                error,
            } => {
                let Some(slot) = registry
                    .connections
                    .get(&connection_id)
                    .and_then(|entry| entry.channels.get(&channel_id))
                else {
                    return;
                };

                if !slot.channel.transition(EntityState::Draining) {
                    return;
                }

                match error {
                    Some(err) => {
                        warn!(
                            error = err.to_string(),
                            queue = slot.channel.config().queue.as_str(),
                            "channel faulted"
                        );
                        slot.channel.config().report(&err);
                    }
                    None => debug!(
                        queue = slot.channel.config().queue.as_str(),
                        "channel released"
                    ),
                }
            }

            Event::ChannelReaped {
                connection_id,
                channel_id,
            } => {
                if let Some(slot) = registry
                    .connections
                    .get_mut(&connection_id)
                    .and_then(|entry| entry.channels.remove(&channel_id))
                {
                    slot.channel.transition(EntityState::Closed);
                }
            }
        }
    }

    /// One reaper pass.
    ///
    /// Faulted channels (or channels of a faulted connection) get a close task
    /// that first waits for their in-flight deliveries. They stay registered
    /// until that task reports back, so a connection is only released once
    /// all of its channels are gone.
    async fn reap(self: &Arc<Self>) {
        let mut registry = self.registry.lock().await;
        let mut released = Vec::new();

        registry.connections.retain(|_, entry| {
            let connection_live = entry.connection.is_live();
            if !connection_live && entry.channels.is_empty() {
                entry.connection.transition(EntityState::Closed);
                released.push(Arc::clone(&entry.connection));
                return false;
            }

            for slot in entry.channels.values_mut() {
                if slot.reaping || (connection_live && slot.channel.state().is_live()) {
                    continue;
                }

                slot.channel.transition(EntityState::Draining);
                slot.reaping = true;
                tokio::spawn(close_drained_channel(
                    Arc::clone(self),
                    Arc::clone(&slot.channel),
                ));
            }

            true
        });
        drop(registry);

        for connection in released {
            tokio::spawn(async move {
                debug!(host = connection.host(), "closing dead connection");
                if let Err(err) = connection.transport().close().await {
                    debug!(error = err.to_string(), "failure to close dead connection");
                }
            });
        }
    }

    async fn sample(self: &Arc<Self>) {
        let targets = {
            let registry = self.registry.lock().await;
            registry
                .connections
                .values()
                .filter(|entry| entry.connection.is_live())
                .flat_map(|entry| {
                    entry
                        .channels
                        .values()
                        .filter(|slot| {
                            slot.channel.is_live() && slot.channel.config().metrics.is_some()
                        })
                        .map(|slot| (Arc::clone(&entry.connection), Arc::clone(&slot.channel)))
                })
                .collect::<Vec<_>>()
        };

        for (connection, channel) in targets {
            tokio::spawn(sample_queue(Arc::clone(&self.metrics), connection, channel));
        }
    }
}

async fn event_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<Event>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            event = events.recv() => match event {
                Some(event) => inner.apply(event).await,
                None => return,
            },
        }
    }
}

async fn reap_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = interval(inner.options.reap_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = ticker.tick() => inner.reap().await,
        }
    }
}

async fn sample_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = interval(inner.options.metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = ticker.tick() => inner.sample().await,
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn close_drained_channel(inner: Arc<Inner>, channel: Arc<ManagedChannel>) {
    channel.wait_drained().await;

    if let Err(err) = channel.transport().close().await {
        debug!(error = err.to_string(), "failure to close dead channel");
        channel.config().report(&err);
    }

    let _ = inner.events.send(Event::ChannelReaped {
        connection_id: channel.connection().id(),
        channel_id: channel.id(),
    });
}

fn release_channel(transport: Arc<dyn BrokerChannel>) {
    tokio::spawn(async move {
        if let Err(err) = transport.close().await {
            debug!(error = err.to_string(), "failure to release channel");
        }
    });
}

/// Reports the queue depth and the age of its oldest message.
///
/// The age comes from peeking at the head of the queue: the message is
/// fetched without ack and immediately rejected back with requeue.
async fn sample_queue(
    metrics: Arc<Metrics>,
    connection: Arc<ManagedConnection>,
    channel: Arc<ManagedChannel>,
) {
    let Some(callbacks) = channel.config().metrics.as_ref() else {
        return;
    };
    let queue = channel.config().queue.as_str();
    let host = connection.host();

    let depth = match channel
        .transport()
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(depth) => i64::from(depth),
        Err(err) => {
            debug!(error = err.to_string(), queue, "failure to inspect queue");
            return;
        }
    };

    metrics.queue_length(host, queue, depth);
    if let Some(report) = &callbacks.queue_length {
        report(host, queue, depth);
    }

    let delay = if depth == 0 {
        Some(0)
    } else {
        match channel.transport().basic_get(queue).await {
            Ok(Some(delivery)) => {
                let age = delivery.timestamp.map(|published| now_secs() - published as i64);
                if let Err(err) = delivery.acker.reject(true).await {
                    debug!(error = err.to_string(), queue, "failure to return sampled message");
                }
                age.filter(|age| *age >= 0)
            }
            Ok(None) => Some(0),
            Err(err) => {
                debug!(error = err.to_string(), queue, "failure to sample queue");
                None
            }
        }
    };

    if let Some(delay) = delay {
        metrics.queue_delay(host, queue, delay);
        if let Some(report) = &callbacks.queue_delay {
            report(host, queue, delay);
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
