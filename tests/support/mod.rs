// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the integration tests.
//!
//! It implements the transport traits with just enough AMQP behaviour for the
//! supervisor: direct routing through bindings, prefetch-bounded push to
//! subscriptions, manual settlement with requeue, and fault injection.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use rabbitmq_supervisor::{
    broker::{
        Acker, BrokerChannel, BrokerConnection, CloseHandler, Connector, Delivery, DeliveryStream,
    },
    config::{ConnectionConfig, SupervisorOptions},
    container::Container,
    errors::AmqpError,
    message::Message,
    metrics::Metrics,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{sync::mpsc, time::sleep};

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    timestamp: Option<u64>,
    headers: Option<FieldTable>,
    redelivered: bool,
}

struct Subscription {
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
    outstanding: usize,
}

struct ChannelState {
    connection: u64,
    alive: bool,
    prefetch: u16,
    confirms: bool,
    subscription: Option<Subscription>,
    handlers: Vec<CloseHandler>,
}

struct ConnectionState {
    alive: bool,
    handlers: Vec<CloseHandler>,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: Stored,
    /// Counted against the subscription's prefetch
    counted: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_tag: u64,
    fail_dials: bool,
    fail_publishes: bool,
    dials: Vec<(String, String)>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, VecDeque<Stored>>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    qos: Vec<u16>,
    queue_args: Vec<(String, FieldTable)>,
    ops: Vec<String>,
    acked: Vec<Vec<u8>>,
    channel_closes: usize,
    confirm_selects: usize,
    published: Vec<BasicProperties>,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn dials(&self) -> usize {
        self.lock().dials.len()
    }

    pub fn dialed_names(&self) -> Vec<String> {
        self.lock().dials.iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn set_fail_dials(&self, fail: bool) {
        self.lock().fail_dials = fail;
    }

    /// With `fail` set, the broker NACKs publishes on confirm-mode channels
    /// and silently drops them on the others.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    pub fn qos_log(&self) -> Vec<u16> {
        self.lock().qos.clone()
    }

    /// Arguments of the last non-passive declaration of `queue`.
    pub fn queue_args(&self, queue: &str) -> Option<FieldTable> {
        self.lock()
            .queue_args
            .iter()
            .rev()
            .find(|(name, _)| name == queue)
            .map(|(_, args)| args.clone())
    }

    /// Declarations in call order: `exchange:e`, `queue:q`, `bind:e:q:rk`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Number of channels put in publisher-confirm mode.
    pub fn confirm_selects(&self) -> usize {
        self.lock().confirm_selects
    }

    pub fn channel_closes(&self) -> usize {
        self.lock().channel_closes
    }

    pub fn live_connections(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|connection| connection.alive)
            .count()
    }

    pub fn published(&self) -> Vec<BasicProperties> {
        self.lock().published.clone()
    }

    /// Puts a message straight into `queue`, stamped `age` seconds ago.
    pub fn enqueue_aged(&self, queue: &str, body: &str, age: u64) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(Stored {
                body: body.as_bytes().to_vec(),
                timestamp: Some(now_secs() - age),
                headers: None,
                redelivered: false,
            });
        self.dispatch(&mut state);
    }

    pub fn enqueue(&self, queue: &str, body: &str) {
        self.enqueue_aged(queue, body, 0);
    }

    /// Fails the channel consuming `queue` as the broker would on a channel error.
    pub fn kill_channel(&self, queue: &str) -> bool {
        let handlers = {
            let mut state = self.lock();
            let Some(id) = state
                .channels
                .iter()
                .find(|(_, channel)| {
                    channel.alive
                        && channel
                            .subscription
                            .as_ref()
                            .is_some_and(|subscription| subscription.queue == queue)
                })
                .map(|(id, _)| *id)
            else {
                return false;
            };

            let handlers = shutdown_channel(&mut state, id);
            self.dispatch(&mut state);
            handlers
        };

        for mut handler in handlers {
            handler(AmqpError::ChannelClosed("channel killed".to_owned()));
        }
        true
    }

    /// Fails every connection as a broker restart would.
    pub fn drop_connections(&self) {
        let (channel_handlers, connection_handlers) = {
            let mut state = self.lock();
            let mut channel_handlers = Vec::new();
            let mut connection_handlers = Vec::new();

            let ids = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.alive)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();

            for id in ids {
                channel_handlers.extend(shutdown_connection(&mut state, id));
                if let Some(connection) = state.connections.get_mut(&id) {
                    connection_handlers.extend(connection.handlers.drain(..));
                }
            }

            (channel_handlers, connection_handlers)
        };

        for mut handler in channel_handlers {
            handler(AmqpError::ChannelClosed("connection lost".to_owned()));
        }
        for mut handler in connection_handlers {
            handler(AmqpError::ConnectionClosed("connection lost".to_owned()));
        }
    }

    /// Pushes ready messages to subscriptions with prefetch room.
    fn dispatch(&self, state: &mut State) {
        let mut ids = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.alive && channel.subscription.is_some())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_unstable();

        for id in ids {
            loop {
                let Some((queue, prefetch, outstanding)) =
                    state.channels.get(&id).and_then(|channel| {
                        channel.subscription.as_ref().map(|subscription| {
                            (
                                subscription.queue.clone(),
                                channel.prefetch,
                                subscription.outstanding,
                            )
                        })
                    })
                else {
                    break;
                };

                if prefetch > 0 && outstanding >= usize::from(prefetch) {
                    break;
                }

                let Some(message) = state
                    .queues
                    .get_mut(&queue)
                    .and_then(|ready| ready.pop_front())
                else {
                    break;
                };

                state.next_tag += 1;
                let tag = state.next_tag;
                let delivery = self.delivery(tag, &message);

                let sent = state
                    .channels
                    .get_mut(&id)
                    .and_then(|channel| channel.subscription.as_mut())
                    .map(|subscription| {
                        let sent = subscription.sender.send(Ok(delivery)).is_ok();
                        if sent {
                            subscription.outstanding += 1;
                        }
                        sent
                    })
                    .unwrap_or(false);

                if !sent {
                    state.queues.entry(queue).or_default().push_front(message);
                    break;
                }

                state.unacked.insert(
                    tag,
                    Unacked {
                        channel: id,
                        queue,
                        message,
                        counted: true,
                    },
                );
            }
        }
    }

    fn delivery(&self, tag: u64, message: &Stored) -> Delivery {
        Delivery {
            body: message.body.clone(),
            redelivered: message.redelivered,
            timestamp: message.timestamp,
            headers: message.headers.clone(),
            acker: Arc::new(FakeAcker {
                broker: self.clone(),
                tag,
            }),
        }
    }

    /// `None` acks, `Some(requeue)` nacks.
    fn settle(&self, tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let mut state = self.lock();
        let Some(entry) = state.unacked.remove(&tag) else {
            let reason = "unknown delivery tag".to_owned();
            return Err(match requeue {
                None => AmqpError::AckMessageError(reason),
                Some(_) => AmqpError::NackMessageError(reason),
            });
        };

        if entry.counted {
            if let Some(subscription) = state
                .channels
                .get_mut(&entry.channel)
                .and_then(|channel| channel.subscription.as_mut())
            {
                subscription.outstanding = subscription.outstanding.saturating_sub(1);
            }
        }

        match requeue {
            None => state.acked.push(entry.message.body),
            Some(true) => {
                let mut message = entry.message;
                message.redelivered = true;
                state.queues.entry(entry.queue).or_default().push_front(message);
            }
            Some(false) => {}
        }

        self.dispatch(&mut state);
        Ok(())
    }
}

/// Marks a channel dead and requeues its unsettled deliveries, in order.
fn shutdown_channel(state: &mut State, id: u64) -> Vec<CloseHandler> {
    let Some(channel) = state.channels.get_mut(&id) else {
        return Vec::new();
    };
    if !channel.alive {
        return Vec::new();
    }
    channel.alive = false;
    channel.subscription = None;
    let handlers = channel.handlers.drain(..).collect::<Vec<_>>();

    let mut tags = state
        .unacked
        .iter()
        .filter(|(_, entry)| entry.channel == id)
        .map(|(tag, _)| *tag)
        .collect::<Vec<_>>();
    tags.sort_unstable_by(|a, b| b.cmp(a));

    for tag in tags {
        if let Some(entry) = state.unacked.remove(&tag) {
            let mut message = entry.message;
            message.redelivered = true;
            state.queues.entry(entry.queue).or_default().push_front(message);
        }
    }

    handlers
}

fn shutdown_connection(state: &mut State, id: u64) -> Vec<CloseHandler> {
    if let Some(connection) = state.connections.get_mut(&id) {
        connection.alive = false;
    }

    let ids = state
        .channels
        .iter()
        .filter(|(_, channel)| channel.connection == id)
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();

    ids.into_iter()
        .flat_map(|id| shutdown_channel(state, id))
        .collect()
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        // a dial is never instantaneous; let racing callers run meanwhile
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.dials.push((uri.to_owned(), connection_name.to_owned()));
        if state.fail_dials {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            ConnectionState {
                alive: true,
                handlers: Vec::new(),
            },
        );

        Ok(Arc::new(FakeConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.alive) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                alive: true,
                prefetch: 0,
                confirms: false,
                subscription: None,
                handlers: Vec::new(),
            },
        );

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn on_close(&self, handler: CloseHandler) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.handlers.push(handler);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let _ = shutdown_connection(&mut state, self.id);
        self.broker.dispatch(&mut state);
        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: u64,
}

impl FakeChannel {
    fn live(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.lock();
        if state.channels.get(&self.id).is_some_and(|c| c.alive) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelClosed("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.qos.push(prefetch_count);
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.confirm_selects += 1;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.ops.push(format!("exchange:{exchange}"));
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        let mut state = self.live()?;

        if options.passive {
            return state
                .queues
                .get(queue)
                .map(|ready| ready.len() as u32)
                .ok_or_else(|| AmqpError::DeclareQueueError(queue.to_owned(), "NOT_FOUND".to_owned()));
        }

        state.ops.push(format!("queue:{queue}"));
        state.queue_args.push((queue.to_owned(), arguments));
        Ok(state.queues.entry(queue.to_owned()).or_default().len() as u32)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        state.ops.push(format!("bind:{exchange}:{queue}:{routing_key}"));

        let binding = (exchange.to_owned(), routing_key.to_owned(), queue.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.live()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.subscription = Some(Subscription {
                queue: queue.to_owned(),
                sender,
                outstanding: 0,
            });
        }
        self.broker.dispatch(&mut state);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.live()?;
        let Some(message) = state.queues.get_mut(queue).and_then(|ready| ready.pop_front()) else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = self.broker.delivery(tag, &message);
        state.unacked.insert(
            tag,
            Unacked {
                channel: self.id,
                queue: queue.to_owned(),
                message,
                counted: false,
            },
        );

        Ok(Some(delivery))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.live()?;
        if state.fail_publishes {
            let confirms = state.channels.get(&self.id).is_some_and(|c| c.confirms);
            return if confirms {
                Err(AmqpError::PublishingError("publisher confirm NACK".to_owned()))
            } else {
                Ok(())
            };
        }

        let targets = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            state
                .bindings
                .iter()
                .filter(|(e, rk, _)| e == exchange && rk == routing_key)
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        for queue in targets {
            if let Some(ready) = state.queues.get_mut(&queue) {
                ready.push_back(Stored {
                    body: body.to_vec(),
                    timestamp: *properties.timestamp(),
                    headers: properties.headers().clone(),
                    redelivered: false,
                });
            }
        }

        state.published.push(properties);
        self.broker.dispatch(&mut state);
        Ok(())
    }

    fn on_close(&self, handler: CloseHandler) {
        if let Some(channel) = self.broker.lock().channels.get_mut(&self.id) {
            channel.handlers.push(handler);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_closes += 1;
        let _ = shutdown_channel(&mut state, self.id);
        self.broker.dispatch(&mut state);
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    tag: u64,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Some(requeue))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Some(requeue))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

pub fn options() -> SupervisorOptions {
    SupervisorOptions {
        reap_interval: Duration::from_millis(20),
        metrics_interval: Duration::from_secs(3600),
        reconnect_backoff: Duration::from_millis(20),
        publish_attempts: 3,
        publish_retry_delay: Duration::from_millis(10),
        publish_timeout: Duration::from_secs(1),
        metrics_namespace: String::new(),
    }
}

/// A container on `broker` with a `main` connection registered.
pub fn container(broker: &FakeBroker) -> Container {
    let container =
        Container::with_connector(Arc::new(broker.clone()), options(), Metrics::global(""));
    container
        .add_connection("main", ConnectionConfig::new("rabbit:5672"))
        .unwrap();
    container
}

/// Polls `condition` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn next_message<S>(messages: &mut S) -> Message
where
    S: futures_util::Stream<Item = Message> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(2), messages.next())
        .await
        .expect("no message within two seconds")
        .expect("message stream ended")
}
