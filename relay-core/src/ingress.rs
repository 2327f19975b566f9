//! Boundary types for the two external notification sources: the system
//! event bus carrying wireless state broadcasts, and the upstream tunnel
//! availability notifier.
//!
//! Both are thin wrappers over a tokio broadcast channel. The coordination
//! driver holds a subscription only while it is tracking a forming or active
//! group and drops it on cleanup, which is what "unsubscribing" means here.

use std::net::IpAddr;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::group::Group;

const DEFAULT_CAPACITY: usize = 16;

/// System-level wireless notifications delivered while subscribed.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// The wireless radio was switched on or off.
    RadioState { enabled: bool },
    /// Group connection state changed: formation completed, a client joined
    /// or left, or the group was torn down.
    ConnectionChanged {
        owner: Option<IpAddr>,
        group: Option<Group>,
    },
}

/// Publisher handle for system wireless broadcasts.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Delivers an event to all current subscribers. Events published with
    /// no subscriber are dropped, like any missed broadcast.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> BroadcastStream<SystemEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Upstream tunnel lifecycle notifications.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A usable upstream interface exists and is ready.
    Available { ifname: String },
    /// The upstream interface went away.
    Lost { ifname: String },
}

/// Publisher handle for tunnel availability.
#[derive(Debug, Clone)]
pub struct TunnelNotifier {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn available(&self, ifname: impl Into<String>) {
        let _ = self.tx.send(TunnelEvent::Available { ifname: ifname.into() });
    }

    pub fn lost(&self, ifname: impl Into<String>) {
        let _ = self.tx.send(TunnelEvent::Lost { ifname: ifname.into() });
    }

    pub(crate) fn watch(&self) -> BroadcastStream<TunnelEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for TunnelNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
