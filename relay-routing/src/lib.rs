#![doc(issue_tracker_base_url = "https://github.com/relay-rs/relay-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Kernel routing sessions for the relay hotspot: forwarding, NAT and DNS
//! redirection between a downstream wireless-direct interface and an
//! upstream tunnel interface.

use std::net::{IpAddr, SocketAddr};

pub mod command;
pub mod session;
pub mod sysctl;

pub use session::RoutingSession;

/// A started or startable routing rule set.
///
/// `start` applies the staged rules and reports whether all of them took
/// effect; on `false` the caller must still call `stop` to revert the rules
/// applied before the failure. `stop` is idempotent.
pub trait Session: Send + 'static {
    fn start(&mut self) -> bool;
    fn stop(&mut self) -> bool;
}

impl Session for RoutingSession {
    fn start(&mut self) -> bool {
        Self::start(self)
    }

    fn stop(&mut self) -> bool {
        Self::stop(self)
    }
}

/// Stages routing sessions for interface pairs. The coordination core is
/// generic over this so tests can substitute a recording double.
pub trait Routes: Send + Sync + 'static {
    type Session: Session;

    /// Builds a fresh, unapplied session for the given pair. Called once per
    /// start attempt; sessions are never reused.
    fn stage(&self, upstream: &str, downstream: &str, owner: IpAddr) -> Self::Session;
}

/// The production provider: full kernel rule set with DNS queries redirected
/// to the injected resolver.
#[derive(Debug, Clone)]
pub struct NetRoutes {
    dns: SocketAddr,
}

impl NetRoutes {
    pub const fn new(dns: SocketAddr) -> Self {
        Self { dns }
    }
}

impl Routes for NetRoutes {
    type Session = RoutingSession;

    fn stage(&self, upstream: &str, downstream: &str, owner: IpAddr) -> RoutingSession {
        RoutingSession::new(upstream, downstream, owner)
            .ip_forward()
            .forward()
            .dns_redirect(self.dns)
    }
}
