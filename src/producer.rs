// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module provides a publisher that survives broker restarts. Each
//! `produce` call makes a bounded number of attempts; an attempt reconnects
//! first when the previous link broke, declares the producer's bindings again
//! and then publishes with a deadline. The caller's OpenTelemetry context is
//! propagated in the message headers.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    config::{effective_tag, ConnectionConfig, ProducerConfig, ProducerConnection},
    connection::ManagedConnection,
    errors::AmqpError,
    manager::ConnectionManager,
    otel,
    queue::ArgValue,
    topology::bind,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerMessage {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    /// Zero leaves the priority unset
    pub priority: u8,
    /// Empty leaves the content type unset
    pub content_type: String,
    pub headers: BTreeMap<String, ArgValue>,
}

impl ProducerMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> ProducerMessage {
        ProducerMessage {
            body: body.into(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Serializes `payload` as the body and marks it as JSON.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<ProducerMessage, AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error to serialize payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        Ok(ProducerMessage::new(exchange, routing_key, body).content_type(JSON_CONTENT_TYPE))
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: ArgValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Properties of one publish attempt: a fresh message id, the publish
    /// time in seconds and the trace context merged with the caller headers.
    fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut headers);

        for (key, value) in &self.headers {
            headers.insert(ShortString::from(key.clone()), AMQPValue::from(value));
        }

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(now_secs())
            .with_headers(FieldTable::from(headers));

        if self.priority > 0 {
            properties = properties.with_priority(self.priority);
        }

        if !self.content_type.is_empty() {
            properties = properties.with_content_type(ShortString::from(self.content_type.clone()));
        }

        properties
    }
}

/// The connection and channel a producer publishes on.
struct Link {
    /// Only set for dedicated producers
    connection: Option<Arc<dyn BrokerConnection>>,
    /// Only set for shared producers
    shared: Option<Arc<ManagedConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Raised by close notifications of the current generation
    broken: Arc<AtomicBool>,
}

impl Link {
    fn is_usable(&self) -> bool {
        self.channel.is_some()
            && !self.broken.load(Ordering::Acquire)
            && self.shared.as_ref().map_or(true, |shared| shared.is_live())
    }
}

pub struct Producer {
    connection_cfg: ConnectionConfig,
    config: ProducerConfig,
    manager: ConnectionManager,
    link: Mutex<Link>,
    closed: AtomicBool,
}

impl Producer {
    /// Builds a producer and performs its first connect, returning its error.
    pub(crate) async fn connect(
        manager: ConnectionManager,
        connection_cfg: ConnectionConfig,
        config: ProducerConfig,
    ) -> Result<Producer, AmqpError> {
        let producer = Producer {
            connection_cfg,
            config,
            manager,
            link: Mutex::new(Link {
                connection: None,
                shared: None,
                channel: None,
                broken: Arc::new(AtomicBool::new(false)),
            }),
            closed: AtomicBool::new(false),
        };

        {
            let mut link = producer.link.lock().await;
            if let Err(err) = producer.reconnect(&mut link).await {
                producer.release(&mut link).await;
                return Err(err);
            }
        }

        Ok(producer)
    }

    /// Publishes `message`, reconnecting between attempts when needed.
    ///
    /// Calls are serialized. After the configured number of attempts the
    /// error of every attempt is returned in `ProduceFailed`. A publish only
    /// counts once the broker confirmed it; a NACK fails the attempt.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `message` - Payload, destination and properties of the message
    ///
    /// # Returns
    /// Ok(()) once confirmed, `ProducerClosed` after `close`, or
    /// `ProduceFailed` with one error per attempt
    pub async fn produce(&self, ctx: &Context, message: &ProducerMessage) -> Result<(), AmqpError> {
        let mut link = self.link.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ProducerClosed);
        }

        let options = self.manager.options();
        let mut errors = Vec::new();

        for attempt in 1..=options.publish_attempts.max(1) {
            if attempt > 1 {
                sleep(options.publish_retry_delay).await;
            }

            if !link.is_usable() {
                if let Err(err) = self.reconnect(&mut link).await {
                    warn!(attempt, error = err.to_string(), "failure to reconnect producer");
                    errors.push(err);
                    continue;
                }
            }

            let Some(channel) = link.channel.clone() else {
                errors.push(AmqpError::InternalError);
                continue;
            };

            match timeout(
                options.publish_timeout,
                channel.basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    &message.body,
                    message.properties(ctx),
                ),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    warn!(attempt, error = err.to_string(), "error publishing message");
                    errors.push(err);
                }
                Err(_) => {
                    warn!(attempt, "publish timed out");
                    errors.push(AmqpError::PublishTimeout);
                }
            }

            link.broken.store(true, Ordering::Release);
        }

        error!(
            exchange = message.exchange.as_str(),
            routing_key = message.routing_key.as_str(),
            attempts = errors.len(),
            "failure to publish message"
        );
        Err(AmqpError::ProduceFailed(errors))
    }

    /// Closes the producer's channel and, when dedicated, its connection.
    ///
    /// Later calls, and `produce` after this, do nothing or fail with
    /// `ProducerClosed` respectively.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut link = self.link.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channel = match link.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        let connection = match link.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };
        link.shared = None;

        debug!("producer closed");
        channel
            .and(connection)
            .map_err(|err| AmqpError::ClosingError(err.to_string()))
    }

    /// Replaces the link with a fresh one and declares every binding on it.
    async fn reconnect(&self, link: &mut Link) -> Result<(), AmqpError> {
        self.release(link).await;

        let broken = Arc::new(AtomicBool::new(false));
        link.broken = Arc::clone(&broken);

        let transport = match self.config.connection {
            ProducerConnection::Dedicated => {
                let uri = self.connection_cfg.amqp_uri()?;
                let connection = self
                    .manager
                    .connector()
                    .connect(&uri, &effective_tag(&self.config.tag))
                    .await?;

                let flag = Arc::clone(&broken);
                connection.on_close(Box::new(move |err| {
                    warn!(error = err.to_string(), "producer connection closed");
                    flag.store(true, Ordering::Release);
                }));

                link.connection = Some(Arc::clone(&connection));
                connection
            }
            ProducerConnection::Shared => {
                let connection = self
                    .manager
                    .get_connection(&self.connection_cfg, &self.config.tag)
                    .await?;
                let transport = Arc::clone(connection.transport());
                link.shared = Some(connection);
                transport
            }
        };

        let channel = match transport.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Some(shared) = &link.shared {
                    self.manager.fault_connection(shared.id(), err.clone());
                }
                return Err(err);
            }
        };

        let flag = Arc::clone(&broken);
        channel.on_close(Box::new(move |err| {
            warn!(error = err.to_string(), "producer channel closed");
            flag.store(true, Ordering::Release);
        }));
        link.channel = Some(Arc::clone(&channel));

        // without confirm mode a broker NACK would go unnoticed
        if let Err(err) = channel.confirm_select().await {
            broken.store(true, Ordering::Release);
            return Err(err);
        }

        for binding in &self.config.bindings {
            if let Err(err) = bind(channel.as_ref(), binding).await {
                broken.store(true, Ordering::Release);
                return Err(err);
            }
        }

        debug!(
            host = self.connection_cfg.host().as_str(),
            bindings = self.config.bindings.len(),
            "producer connected"
        );
        Ok(())
    }

    async fn release(&self, link: &mut Link) {
        if let Some(channel) = link.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "failure to close producer channel");
            }
        }

        if let Some(connection) = link.connection.take() {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "failure to close producer connection");
            }
        }

        link.shared = None;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
