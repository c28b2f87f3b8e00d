// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the topology a producer or an operator tool depends
//! on: one exchange, one queue and the binding between them, as described by
//! a `BindConfig`.
//!
//! The main components are:
//! - `bind`: declares a `BindConfig` on an open channel
//! - `Binder`: a standalone connection that only declares topology

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    config::{effective_tag, BindConfig, ConnectionConfig},
    errors::AmqpError,
    queue::{field_table, with_priority},
};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Declares the exchange, then the queue, then binds them.
///
/// The first failing step aborts the declaration and its error names the
/// step and the entity involved.
pub async fn bind(channel: &dyn BrokerChannel, cfg: &BindConfig) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", cfg.exchange);

    match channel
        .exchange_declare(
            &cfg.exchange,
            (&cfg.exchange_kind).into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: cfg.exchange_durable,
                auto_delete: cfg.exchange_auto_delete,
                internal: cfg.exchange_internal,
                nowait: cfg.exchange_no_wait,
            },
            field_table(&cfg.exchange_args),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = cfg.exchange.as_str(),
                "error to declare the exchange"
            );
            Err(exchange_error(&cfg.exchange, err))
        }
        _ => Ok(()),
    }?;

    debug!("creating queue: {}", cfg.queue);

    match channel
        .queue_declare(
            &cfg.queue,
            QueueDeclareOptions {
                passive: false,
                durable: cfg.queue_durable,
                exclusive: cfg.queue_exclusive,
                auto_delete: cfg.queue_auto_delete,
                nowait: cfg.queue_no_wait,
            },
            with_priority(field_table(&cfg.queue_args), cfg.queue_priority),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = cfg.queue.as_str(),
                "error to declare the queue"
            );
            Err(queue_error(&cfg.queue, err))
        }
        _ => Ok(()),
    }?;

    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        cfg.queue, cfg.exchange, cfg.routing_key
    );

    match channel
        .queue_bind(
            &cfg.queue,
            &cfg.exchange,
            &cfg.routing_key,
            QueueBindOptions {
                nowait: cfg.bind_no_wait,
            },
            field_table(&cfg.bind_args),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(binding_error(cfg, err))
        }
        _ => Ok(()),
    }
}

// Transport errors that already name the step are passed through untouched.

fn exchange_error(exchange: &str, err: AmqpError) -> AmqpError {
    match err {
        AmqpError::DeclareExchangeError(..) => err,
        other => AmqpError::DeclareExchangeError(exchange.to_owned(), other.to_string()),
    }
}

fn queue_error(queue: &str, err: AmqpError) -> AmqpError {
    match err {
        AmqpError::DeclareQueueError(..) => err,
        other => AmqpError::DeclareQueueError(queue.to_owned(), other.to_string()),
    }
}

fn binding_error(cfg: &BindConfig, err: AmqpError) -> AmqpError {
    match err {
        AmqpError::BindingExchangeToQueueError(..) => err,
        other => AmqpError::BindingExchangeToQueueError(
            cfg.exchange.clone(),
            cfg.queue.clone(),
            other.to_string(),
        ),
    }
}

/// A dedicated connection used only to declare topology.
///
/// Declarations are serialized: concurrent `bind` calls run one after the
/// other on the same channel.
pub struct Binder {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl Binder {
    /// Dials a dedicated connection and opens the channel declarations run on.
    ///
    /// # Parameters
    /// * `connector` - Transport used to dial
    /// * `cfg` - Broker address and credentials
    /// * `tag` - Connection name; empty falls back to the hostname
    ///
    /// # Returns
    /// The binder, or the dial or channel error
    pub async fn connect(
        connector: &dyn Connector,
        cfg: &ConnectionConfig,
        tag: &str,
    ) -> Result<Binder, AmqpError> {
        let uri = cfg.amqp_uri()?;
        let connection = connector.connect(&uri, &effective_tag(tag)).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        Ok(Binder {
            connection,
            channel,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Declares `cfg` on the binder's channel. `BinderClosed` after `close`.
    pub async fn bind(&self, cfg: &BindConfig) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::BinderClosed);
        }

        bind(self.channel.as_ref(), cfg).await
    }

    /// Closes the channel and the connection. Later calls do nothing.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channel = self.channel.close().await;
        let connection = self.connection.close().await;

        channel
            .and(connection)
            .map_err(|err| AmqpError::ClosingError(err.to_string()))
    }
}
