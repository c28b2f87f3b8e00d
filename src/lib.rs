// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod container;
pub mod errors;
pub mod exchange;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod topology;
pub mod transport;

pub use config::{
    BindConfig, ConnectionConfig, ConsumerConfig, ConsumerMetrics, ProducerConfig,
    ProducerConnection, SupervisorOptions,
};
pub use consumer::Consumer;
pub use container::Container;
pub use errors::AmqpError;
pub use manager::ConnectionManager;
pub use message::Message;
pub use producer::{Producer, ProducerMessage};
pub use topology::Binder;
