// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervised Consumer
//!
//! A `Consumer` keeps one subscription to a queue alive for as long as it is
//! open. A background task acquires a channel from the `ConnectionManager`,
//! forwards its deliveries to the caller one at a time and acquires a new
//! channel whenever the current one faults. Failures along the way are logged
//! and reported to the consumer's error callback; they never reach the stream.

use crate::{
    channel::ManagedChannel,
    config::{ConnectionConfig, ConsumerConfig},
    connection::EntityState,
    errors::AmqpError,
    manager::ConnectionManager,
    message::Message,
};
use futures_util::{
    future::join_all,
    stream::{self, BoxStream},
    StreamExt,
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, warn};

pub struct Consumer {
    queue: String,
    closed: watch::Sender<bool>,
    output: Arc<Mutex<mpsc::Receiver<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub(crate) fn start(
        manager: ConnectionManager,
        connection: ConnectionConfig,
        config: ConsumerConfig,
    ) -> Consumer {
        let closed = watch::Sender::new(false);
        // a single slot: the next delivery is only taken once the previous one was handed over
        let (sender, receiver) = mpsc::channel(1);
        let output = Arc::new(Mutex::new(receiver));

        let queue = config.queue.clone();
        let task = tokio::spawn(run(
            manager,
            connection,
            config,
            closed.subscribe(),
            sender,
            Arc::clone(&output),
        ));

        Consumer {
            queue,
            closed,
            output,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stream of messages from the queue.
    ///
    /// The stream ends once the consumer is closed. Every message must be
    /// settled with `ack` or `nack`; a message dropped unsettled is requeued.
    ///
    /// # Returns
    /// A stream sharing the consumer's single hand-off slot; several streams
    /// from one consumer compete for the same messages
    pub fn consume(&self) -> BoxStream<'static, Message> {
        stream::unfold(Arc::clone(&self.output), |output| async move {
            let message = output.lock().await.recv().await;
            message.map(|message| (message, output))
        })
        .boxed()
    }

    /// Stops consuming and waits until every handed out message is settled.
    ///
    /// Closing twice is harmless; a second call returns once the first one
    /// has finished.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closed.send_replace(true);

        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failed");
            AmqpError::InternalError
        })?;

        debug!(queue = self.queue.as_str(), "consumer closed");
        Ok(())
    }
}

async fn run(
    manager: ConnectionManager,
    connection: ConnectionConfig,
    config: ConsumerConfig,
    mut closed: watch::Receiver<bool>,
    sender: mpsc::Sender<Message>,
    output: Arc<Mutex<mpsc::Receiver<Message>>>,
) {
    let mut draining: Vec<Arc<ManagedChannel>> = Vec::new();

    while !is_stopped(&closed) {
        let channel = match manager.get_channel(&connection, &config).await {
            Ok((_, channel)) => channel,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = config.queue.as_str(),
                    "failure to acquire channel"
                );
                config.report(&err);

                tokio::select! {
                    _ = stopped(&mut closed) => {}
                    _ = sleep(manager.options().reconnect_backoff) => {}
                }
                continue;
            }
        };

        forward(&manager, &channel, &mut closed, &sender).await;
        channel.fault(None);

        draining.retain(|channel| channel.in_flight() > 0);
        draining.push(channel);
    }

    drop(sender);

    // whatever is still buffered was never handed to the caller
    loop {
        let buffered = output.lock().await.try_recv();
        let Ok(message) = buffered else {
            break;
        };
        if let Err(err) = message.nack().await {
            warn!(error = err.to_string(), "failure to requeue buffered message");
        }
    }

    join_all(draining.iter().map(|channel| channel.wait_drained())).await;
}

/// Forwards deliveries from `channel` until it faults, its stream ends or the
/// consumer is closed.
async fn forward(
    manager: &ConnectionManager,
    channel: &Arc<ManagedChannel>,
    closed: &mut watch::Receiver<bool>,
    sender: &mpsc::Sender<Message>,
) {
    let Some(mut deliveries) = channel.take_deliveries().await else {
        return;
    };
    let mut state = channel.watch_state();
    let mut connection_state = channel.connection().watch_state();
    let host = channel.connection().host();
    let queue = channel.config().queue.as_str();

    loop {
        let delivery = tokio::select! {
            biased;
            _ = stopped(closed) => return,
            _ = faulted(&mut state) => return,
            _ = faulted(&mut connection_state) => return,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    channel.fault(Some(err));
                    return;
                }
                None => {
                    debug!(queue, "delivery stream ended");
                    return;
                }
            },
        };

        let permit = tokio::select! {
            biased;
            _ = stopped(closed) => None,
            permit = sender.reserve() => permit.ok(),
        };

        let Some(permit) = permit else {
            if let Err(err) = delivery.acker.nack(true).await {
                warn!(error = err.to_string(), queue, "failure to requeue delivery");
            }
            return;
        };

        channel.delivery_started();
        manager.metrics().message_consumed(host, queue);
        permit.send(Message::new(
            delivery,
            host,
            queue,
            Arc::clone(manager.metrics()),
            channel.completion(),
        ));
    }
}

/// Closed explicitly, or the `Consumer` handle is gone.
fn is_stopped(closed: &watch::Receiver<bool>) -> bool {
    *closed.borrow() || closed.has_changed().is_err()
}

async fn stopped(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn faulted(state: &mut watch::Receiver<EntityState>) {
    let _ = state.wait_for(|state| !state.is_live()).await;
}
