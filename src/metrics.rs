// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Metrics
//!
//! OpenTelemetry instruments for consumed messages, settlement outcomes and
//! sampled queue state. One `Metrics` value is owned by each
//! `ConnectionManager`; nothing here is process-global.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

const METER_NAME: &str = "rabbitmq-supervisor";

/// Outcome label of a settled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    Ack,
    AckError,
    Nack,
    NackError,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Ack => "ack",
            SettlementStatus::AckError => "ack-error",
            SettlementStatus::Nack => "nack",
            SettlementStatus::NackError => "nack-error",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    consumed: Counter<u64>,
    settled: Counter<u64>,
    queue_length: Gauge<i64>,
    queue_delay: Gauge<i64>,
}

impl Metrics {
    /// Builds the instruments on `meter`, prefixing names with `namespace`
    /// when it is not empty.
    pub fn new(meter: &Meter, namespace: &str) -> Metrics {
        let name = |base: &str| {
            if namespace.is_empty() {
                base.to_owned()
            } else {
                format!("{namespace}_{base}")
            }
        };

        Metrics {
            consumed: meter
                .u64_counter(name("queue_consumed_messages"))
                .with_description("Messages handed to consumers")
                .build(),
            settled: meter
                .u64_counter(name("queue_consumed_messages_ack_status"))
                .with_description("Settled messages by outcome")
                .build(),
            queue_length: meter
                .i64_gauge(name("queue_length"))
                .with_description("Ready messages in the queue")
                .build(),
            queue_delay: meter
                .i64_gauge(name("queue_delay_seconds"))
                .with_unit("s")
                .with_description("Age of the oldest ready message")
                .build(),
        }
    }

    /// Instruments on the global meter provider.
    pub fn global(namespace: &str) -> Metrics {
        Metrics::new(&global::meter(METER_NAME), namespace)
    }

    pub(crate) fn message_consumed(&self, host: &str, queue: &str) {
        self.consumed.add(1, &labels(host, queue));
    }

    pub(crate) fn message_settled(&self, host: &str, queue: &str, status: SettlementStatus) {
        let mut attributes = labels(host, queue).to_vec();
        attributes.push(KeyValue::new("status", status.as_str()));
        self.settled.add(1, &attributes);
    }

    pub(crate) fn queue_length(&self, host: &str, queue: &str, length: i64) {
        self.queue_length.record(length, &labels(host, queue));
    }

    pub(crate) fn queue_delay(&self, host: &str, queue: &str, seconds: i64) {
        self.queue_delay.record(seconds, &labels(host, queue));
    }
}

fn labels(host: &str, queue: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("queue_host", host.to_owned()),
        KeyValue::new("queue", queue.to_owned()),
    ]
}
