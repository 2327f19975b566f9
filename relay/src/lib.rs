#![doc(issue_tracker_base_url = "https://github.com/relay-rs/relay-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Turn a wireless-direct capable Linux device into a relay hotspot: a
//! locally owned group whose clients reach the internet through an upstream
//! tunnel interface.

pub use relay_core::*;
pub use relay_routing::{command, session, sysctl, NetRoutes, Routes, RoutingSession, Session};
