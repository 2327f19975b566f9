#![doc(issue_tracker_base_url = "https://github.com/relay-rs/relay-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Coordination core for the relay hotspot.
//!
//! A [`Repeater`] turns a device with wireless-direct capability into a
//! relay: it forms a local group as group owner, binds the group interface
//! to an upstream tunnel interface, and keeps kernel routing between the two
//! alive across tunnel drops, stale leftover groups and external teardowns.
//! The control channel, the tunnel notifier and the system event bus are
//! external collaborators plugged in at construction.

mod control;
mod controller;
mod driver;
mod group;
mod ingress;
mod machine;

pub use control::{ControlFailure, GroupBackend};
pub use controller::{Notice, Repeater, RepeaterOptions};
pub use group::{Group, GroupClient, GroupOwnership};
pub use ingress::{EventBus, SystemEvent, TunnelEvent, TunnelNotifier};
pub use machine::RelayStatus;
