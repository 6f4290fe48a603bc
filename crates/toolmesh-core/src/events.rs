//! Observability events
//!
//! The core never formats or ships metrics itself. Components emit
//! [`MeshEvent`]s on a shared [`EventBus`]; collaborators subscribe either
//! with a callback per [`EventKind`] or with a broadcast receiver.

use crate::registry::ServerStatus;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Why a pooled connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Pool or client shutdown
    Shutdown,
    /// Failed or timed-out health ping
    HealthCheckFailed,
    /// Idle longer than the idle timeout
    IdleEvicted,
    /// Transport error, timeout or abandoned in-flight request
    Broken,
}

/// Something observable happened inside the client
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    ServerRegistered {
        server_id: String,
    },
    ServerUnregistered {
        server_id: String,
    },
    ServerStatusChanged {
        server_id: String,
        from: ServerStatus,
        to: ServerStatus,
    },
    ConnectionCreated {
        server_id: String,
        connection_id: u64,
    },
    ConnectionClosed {
        server_id: String,
        connection_id: u64,
        reason: CloseReason,
    },
    CircuitOpened {
        server_id: String,
        cooldown: Duration,
        tier: u32,
    },
    CircuitHalfOpened {
        server_id: String,
    },
    CircuitClosed {
        server_id: String,
    },
}

/// Discriminant of [`MeshEvent`], used for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerRegistered,
    ServerUnregistered,
    ServerStatusChanged,
    ConnectionCreated,
    ConnectionClosed,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
}

impl EventKind {
    /// Stable wire name of the event
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerRegistered => "server-registered",
            Self::ServerUnregistered => "server-unregistered",
            Self::ServerStatusChanged => "server-status-changed",
            Self::ConnectionCreated => "connection-created",
            Self::ConnectionClosed => "connection-closed",
            Self::CircuitOpened => "circuit-opened",
            Self::CircuitHalfOpened => "circuit-half-opened",
            Self::CircuitClosed => "circuit-closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MeshEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServerRegistered { .. } => EventKind::ServerRegistered,
            Self::ServerUnregistered { .. } => EventKind::ServerUnregistered,
            Self::ServerStatusChanged { .. } => EventKind::ServerStatusChanged,
            Self::ConnectionCreated { .. } => EventKind::ConnectionCreated,
            Self::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            Self::CircuitOpened { .. } => EventKind::CircuitOpened,
            Self::CircuitHalfOpened { .. } => EventKind::CircuitHalfOpened,
            Self::CircuitClosed { .. } => EventKind::CircuitClosed,
        }
    }

    /// Server the event concerns
    pub fn server_id(&self) -> &str {
        match self {
            Self::ServerRegistered { server_id }
            | Self::ServerUnregistered { server_id }
            | Self::ServerStatusChanged { server_id, .. }
            | Self::ConnectionCreated { server_id, .. }
            | Self::ConnectionClosed { server_id, .. }
            | Self::CircuitOpened { server_id, .. }
            | Self::CircuitHalfOpened { server_id }
            | Self::CircuitClosed { server_id } => server_id,
        }
    }
}

/// Callback invoked for matching events
pub type EventHandler = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Fan-out point for [`MeshEvent`]s
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
    sender: broadcast::Sender<MeshEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
            sender,
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one kind of event
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Register a handler for every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Remove a handler; returns `false` if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Channel receiver seeing every event emitted after this call
    pub fn receiver(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every matching subscriber
    pub fn emit(&self, event: MeshEvent) {
        debug!(event = event.kind().as_str(), server_id = event.server_id(), "mesh event");

        // Handlers run without the lock held so they may (un)subscribe.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == event.kind()))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            handler(&event);
        }

        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    fn add(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription { id, kind, handler });
        id
    }
}
