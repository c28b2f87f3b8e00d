// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module implements the broker traits with lapin. It establishes
//! connections to the RabbitMQ server, creates channels on them and maps
//! lapin errors into `AmqpError`s.

use crate::{
    broker::{Acker, BrokerChannel, BrokerConnection, CloseHandler, Connector, Delivery, DeliveryStream},
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    /// Uses the given properties (executor, reactor, client properties) for
    /// every connection; the connection name is set per dial.
    pub fn new(properties: ConnectionProperties) -> LapinConnector {
        LapinConnector { properties }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = self
            .properties
            .clone()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn on_close(&self, mut handler: CloseHandler) {
        self.conn
            .on_error(move |err| handler(AmqpError::ConnectionClosed(err.to_string())));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ClosingError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(exchange.to_owned(), err.to_string()))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_declare(queue, options, arguments)
            .await
            .map(|declared| declared.message_count())
            .map_err(|err| AmqpError::DeclareQueueError(queue.to_owned(), err.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned(), err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ChannelClosed(err.to_string()))
            })
            .boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        self.channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map(|message| message.map(|message| into_delivery(message.delivery)))
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if confirm.is_nack() {
            return Err(AmqpError::PublishingError(
                "publisher confirm NACK".to_owned(),
            ));
        }

        Ok(())
    }

    fn on_close(&self, mut handler: CloseHandler) {
        self.channel
            .on_error(move |err| handler(AmqpError::ChannelClosed(err.to_string())));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ClosingError(err.to_string()))
    }
}

struct LapinAcker {
    acker: acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        timestamp: *delivery.properties.timestamp(),
        headers: delivery.properties.headers().clone(),
        redelivered: delivery.redelivered,
        body: delivery.data,
        acker: Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}
