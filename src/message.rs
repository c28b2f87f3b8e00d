// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! A `Message` wraps exactly one broker delivery handed to the caller. It can
//! be settled once: the first `ack` or `nack` talks to the broker, runs the
//! completion hook and records the outcome; later calls do nothing.

use crate::{
    broker::Delivery,
    errors::AmqpError,
    metrics::{Metrics, SettlementStatus},
    otel,
};
use opentelemetry::Context;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, warn};

/// Runs once when a message is settled, with the settlement error if any.
pub type Completion = Box<dyn Fn(Option<&AmqpError>) + Send + Sync>;

pub struct Message {
    delivery: Delivery,
    host: String,
    queue: String,
    settled: AtomicBool,
    completion: Arc<Completion>,
    metrics: Arc<Metrics>,
}

impl Message {
    pub(crate) fn new(
        delivery: Delivery,
        host: &str,
        queue: &str,
        metrics: Arc<Metrics>,
        completion: Completion,
    ) -> Message {
        Message {
            delivery,
            host: host.to_owned(),
            queue: queue.to_owned(),
            settled: AtomicBool::new(false),
            completion: Arc::new(completion),
            metrics,
        }
    }

    /// Acknowledges the delivery.
    ///
    /// Only the first settlement of a message reaches the broker; any later
    /// `ack` or `nack` returns `Ok(())` without side effects.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.delivery.acker.ack().await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                (self.completion)(Some(&err));
                self.record(SettlementStatus::AckError);
                Err(err)
            }
            Ok(()) => {
                (self.completion)(None);
                self.record(SettlementStatus::Ack);
                Ok(())
            }
        }
    }

    /// Rejects the delivery and asks the broker to requeue it.
    pub async fn nack(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.delivery.acker.nack(true).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                (self.completion)(Some(&err));
                self.record(SettlementStatus::NackError);
                Err(err)
            }
            Ok(()) => {
                (self.completion)(None);
                self.record(SettlementStatus::Nack);
                Ok(())
            }
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Publish time in seconds since the epoch, when the producer set one.
    pub fn timestamp(&self) -> Option<u64> {
        self.delivery.timestamp
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Trace context propagated by the producer.
    pub fn context(&self) -> Context {
        otel::extract(self.delivery.headers.as_ref())
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn record(&self, status: SettlementStatus) {
        self.metrics.message_settled(&self.host, &self.queue, status);
    }
}

impl Drop for Message {
    /// An unsettled message would hold its channel's drain forever, so it is
    /// handed back to the broker for redelivery.
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(queue = self.queue.as_str(), "message dropped unsettled, requeuing");

        let acker = Arc::clone(&self.delivery.acker);
        let completion = Arc::clone(&self.completion);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = acker.nack(true).await;
                    completion(result.as_ref().err());
                });
            }
            Err(_) => completion(None),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("queue", &self.queue)
            .field("delivery", &self.delivery)
            .field("settled", &self.is_settled())
            .finish()
    }
}
