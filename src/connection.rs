// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Managed Connections
//!
//! A `ManagedConnection` is one physical broker connection registered with
//! the `ConnectionManager` and shared by every consumer using the same
//! canonical connection key.

use crate::broker::BrokerConnection;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Lifecycle of a registered connection or channel.
///
/// Entities start `Live`. A fault moves them to `Draining`, where they accept
/// no new work while outstanding deliveries settle. The reaper moves them to
/// `Closed` once the transport handle has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Live,
    Draining,
    Closed,
}

impl EntityState {
    pub fn is_live(self) -> bool {
        self == EntityState::Live
    }
}

pub struct ManagedConnection {
    id: u64,
    host: String,
    transport: Arc<dyn BrokerConnection>,
    state: watch::Sender<EntityState>,
}

impl ManagedConnection {
    pub(crate) fn new(id: u64, host: String, transport: Arc<dyn BrokerConnection>) -> Self {
        ManagedConnection {
            id,
            host,
            transport,
            state: watch::Sender::new(EntityState::Live),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Broker host, used as the `queue_host` metric label.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> EntityState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn watch_state(&self) -> watch::Receiver<EntityState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn BrokerConnection> {
        &self.transport
    }

    /// Only called by the manager while it holds the registry lock.
    pub(crate) fn transition(&self, to: EntityState) -> bool {
        self.state.send_if_modified(|state| advance(state, to))
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

/// States only move forward: Live -> Draining -> Closed.
pub(crate) fn advance(state: &mut EntityState, to: EntityState) -> bool {
    let allowed = matches!(
        (*state, to),
        (EntityState::Live, EntityState::Draining)
            | (EntityState::Live, EntityState::Closed)
            | (EntityState::Draining, EntityState::Closed)
    );

    if allowed {
        *state = to;
    }
    allowed
}
