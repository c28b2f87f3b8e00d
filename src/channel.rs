// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Managed Channels
//!
//! A `ManagedChannel` is one consumer subscription multiplexed on a
//! `ManagedConnection`. It tracks how many of its deliveries are held by the
//! caller so the reaper can wait for them to settle before closing it.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    config::ConsumerConfig,
    connection::{advance, EntityState, ManagedConnection},
    errors::AmqpError,
    manager::Event,
    message::Completion,
};
use std::{fmt, sync::Arc};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::error;

pub struct ManagedChannel {
    id: u64,
    connection: Arc<ManagedConnection>,
    transport: Arc<dyn BrokerChannel>,
    config: ConsumerConfig,
    deliveries: Mutex<Option<DeliveryStream>>,
    state: watch::Sender<EntityState>,
    in_flight: watch::Sender<usize>,
    events: mpsc::UnboundedSender<Event>,
}

impl ManagedChannel {
    pub(crate) fn new(
        id: u64,
        connection: Arc<ManagedConnection>,
        transport: Arc<dyn BrokerChannel>,
        config: ConsumerConfig,
        deliveries: DeliveryStream,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        ManagedChannel {
            id,
            connection,
            transport,
            config,
            deliveries: Mutex::new(Some(deliveries)),
            state: watch::Sender::new(EntityState::Live),
            in_flight: watch::Sender::new(0),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.connection
    }

    pub fn transport(&self) -> &Arc<dyn BrokerChannel> {
        &self.transport
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> EntityState {
        *self.state.borrow()
    }

    /// A channel on a faulted connection is not live either.
    pub fn is_live(&self) -> bool {
        self.state().is_live() && self.connection.is_live()
    }

    pub fn watch_state(&self) -> watch::Receiver<EntityState> {
        self.state.subscribe()
    }

    /// Hands the delivery stream to its single reader.
    pub async fn take_deliveries(&self) -> Option<DeliveryStream> {
        self.deliveries.lock().await.take()
    }

    /// Reports the channel as unusable.
    ///
    /// The state change itself is applied by the manager's event loop.
    /// `None` marks a quiet shutdown, such as an exhausted delivery stream.
    pub fn fault(&self, error: Option<AmqpError>) {
        let _ = self.events.send(Event::ChannelFaulted {
            connection_id: self.connection.id(),
            channel_id: self.id,
            error,
        });
    }

    /// Deliveries handed to the caller and not settled yet.
    ///
    /// The reaper only closes a faulted channel once this reaches zero.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub(crate) fn delivery_started(&self) {
        self.in_flight.send_modify(|count| *count += 1);
    }

    pub(crate) fn delivery_settled(&self) {
        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Resolves once every handed out delivery has been settled.
    pub async fn wait_drained(&self) {
        let mut in_flight = self.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }

    /// Settlement hook given to every `Message` built from this channel.
    ///
    /// A failed ack or nack leaves the broker-side channel in an unknown
    /// state, so the channel is faulted and a fresh one will be acquired.
    pub(crate) fn completion(self: &Arc<Self>) -> Completion {
        let channel = Arc::clone(self);
        Box::new(move |result| {
            channel.delivery_settled();
            if let Some(err) = result {
                error!(
                    error = err.to_string(),
                    queue = channel.config.queue.as_str(),
                    "message callback error"
                );
                channel.fault(Some(err.clone()));
            }
        })
    }

    /// Only called by the manager while it holds the registry lock.
    pub(crate) fn transition(&self, to: EntityState) -> bool {
        self.state.send_if_modified(|state| advance(state, to))
    }
}

impl fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("queue", &self.config.queue)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
