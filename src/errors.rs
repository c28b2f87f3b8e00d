// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Supervisor
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum covers configuration mistakes, transport failures
//! (dial, channel, fault notifications), topology declaration steps, publish
//! retries and message settlement.

use thiserror::Error;

/// Represents errors that can occur while supervising AMQP connections.
///
/// Transient transport errors are recovered by the consumer and producer
/// reconnect loops and only reported through callbacks and logs. Configuration
/// errors are returned synchronously and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid connection or consumer configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No connection registered under the given name
    #[error("connection config `{0}` is not found")]
    ConfigNotFound(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The broker reported the connection as closed
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker reported the channel as closed
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// A single publish attempt ran past its deadline
    #[error("publish timed out")]
    PublishTimeout,

    /// Every publish attempt failed
    #[error("failure to publish after {} attempts: {}", .0.len(), join(.0))]
    ProduceFailed(Vec<AmqpError>),

    /// The producer was closed before the call
    #[error("producer is closed")]
    ProducerClosed,

    /// The binder was closed before the call
    #[error("binder is closed")]
    BinderClosed,

    /// Error closing a connection or channel
    #[error("failure to close: {0}")]
    ClosingError(String),

    /// Error parsing or building a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),
}

fn join(errors: &[AmqpError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
