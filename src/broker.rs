// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Traits
//!
//! The supervisor never speaks AMQP itself. Every call it makes to the broker
//! goes through the traits in this module: `transport` implements them on top
//! of lapin, and tests implement them with an in-memory broker.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
#[cfg(test)]
use mockall::automock;
use std::{fmt, sync::Arc};

/// Invoked once the broker reports a connection or channel as closed.
pub type CloseHandler = Box<dyn FnMut(AmqpError) + Send + 'static>;

/// Deliveries pushed by the broker to one consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles one delivery at the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message delivered by the broker.
#[derive(Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    /// Publish time in seconds since the epoch, when the publisher set it
    pub timestamp: Option<u64>,
    pub headers: Option<FieldTable>,
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Dials physical broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection to `uri`, announcing `connection_name` to the broker.
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live physical connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the handler fired when the connection fails.
    fn on_close(&self, handler: CloseHandler);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed on a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher-confirm mode so that `basic_publish`
    /// waits for the broker to ACK or NACK every message.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares the queue and returns the number of ready messages in it.
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Fetches one message without subscribing, leaving it unacknowledged.
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Registers the handler fired when the channel fails.
    fn on_close(&self, handler: CloseHandler);

    async fn close(&self) -> Result<(), AmqpError>;
}
