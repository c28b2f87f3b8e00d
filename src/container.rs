// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervisor Container
//!
//! The entry point of the crate. A `Container` holds named connection configs
//! and one `ConnectionManager`, and builds consumers, producers and binders on
//! top of them.
//!
//! ```no_run
//! use rabbitmq_supervisor::{
//!     config::{ConnectionConfig, ConsumerConfig, SupervisorOptions},
//!     container::Container,
//! };
//! use futures_util::StreamExt;
//!
//! # async fn run() -> Result<(), rabbitmq_supervisor::errors::AmqpError> {
//! let container = Container::new(SupervisorOptions::default());
//! container.add_connection("main", ConnectionConfig::new("localhost:5672"))?;
//!
//! let consumer = container.create_consumer(ConsumerConfig::new("main", "orders"))?;
//! let mut messages = consumer.consume();
//! while let Some(msg) = messages.next().await {
//!     msg.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::Connector,
    config::{ConnectionConfig, ConsumerConfig, ProducerConfig, SupervisorOptions},
    consumer::Consumer,
    errors::AmqpError,
    manager::ConnectionManager,
    metrics::Metrics,
    producer::Producer,
    topology::Binder,
    transport::LapinConnector,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, error};

pub struct Container {
    manager: ConnectionManager,
    connections: RwLock<HashMap<String, ConnectionConfig>>,
}

impl Container {
    /// A container dialing real brokers through lapin and recording metrics
    /// on the global meter provider.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: SupervisorOptions) -> Container {
        let metrics = Metrics::global(&options.metrics_namespace);
        Container::with_connector(Arc::new(LapinConnector::default()), options, metrics)
    }

    /// A container dialing through `connector`.
    ///
    /// # Parameters
    /// * `connector` - Transport used for every connection, consumer or not
    /// * `options` - Settings handed to the connection manager
    /// * `metrics` - Instruments owned by the connection manager
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
        metrics: Metrics,
    ) -> Container {
        Container {
            manager: ConnectionManager::new(connector, options, metrics),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Registers a named connection. A name registered twice keeps the last config.
    ///
    /// # Parameters
    /// * `name` - Name consumers, producers and binders refer to
    /// * `cfg` - Broker address and credentials
    ///
    /// # Returns
    /// Ok(()) or `InvalidConfig` naming the connection when `cfg` is invalid
    pub fn add_connection(&self, name: &str, cfg: ConnectionConfig) -> Result<(), AmqpError> {
        cfg.validate()
            .map_err(|err| AmqpError::InvalidConfig(format!("{name}: {err}")))?;

        let mut connections = self.connections.write().map_err(|_| {
            error!("connections lock poisoned");
            AmqpError::InternalError
        })?;
        connections.insert(name.to_owned(), cfg);

        debug!(name, "connection registered");
        Ok(())
    }

    /// Starts a consumer on the named connection.
    ///
    /// Returns as soon as the consumer is running; connecting happens in the
    /// background and failures go to the consumer's error callback.
    pub fn create_consumer(&self, cfg: ConsumerConfig) -> Result<Consumer, AmqpError> {
        let connection = self.connection(&cfg.connection_name)?;
        Ok(Consumer::start(self.manager.clone(), connection, cfg))
    }

    /// Connects a producer and declares its bindings.
    ///
    /// # Parameters
    /// * `cfg` - Connection name, bindings and connection mode of the producer
    ///
    /// # Returns
    /// The connected producer, `ConfigNotFound` for an unknown connection name
    /// or the error of the initial connect
    pub async fn create_producer(&self, cfg: ProducerConfig) -> Result<Producer, AmqpError> {
        let connection = self.connection(&cfg.connection_name)?;
        Producer::connect(self.manager.clone(), connection, cfg).await
    }

    /// Opens a standalone connection that only declares topology.
    ///
    /// # Parameters
    /// * `connection_name` - Name of a connection registered with `add_connection`
    ///
    /// # Returns
    /// The connected binder, or `ConfigNotFound` for an unknown name
    pub async fn create_binder(&self, connection_name: &str) -> Result<Binder, AmqpError> {
        let connection = self.connection(connection_name)?;
        Binder::connect(self.manager.connector().as_ref(), &connection, "").await
    }

    /// Closes the connection manager. Consumers and producers should be
    /// closed first.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    fn connection(&self, name: &str) -> Result<ConnectionConfig, AmqpError> {
        let connections = self.connections.read().map_err(|_| {
            error!("connections lock poisoned");
            AmqpError::InternalError
        })?;

        connections
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::ConfigNotFound(name.to_owned()))
    }
}
