use std::net::IpAddr;

use bytes::Bytes;

/// A device connected to the relay group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupClient {
    /// Hardware address of the client device.
    pub device_address: String,
    /// Advertised device name, if any.
    pub device_name: Option<String>,
}

/// Snapshot of a formed wireless-direct group.
///
/// Snapshots are immutable: whenever the platform reports newer group state,
/// the whole snapshot is replaced, never patched in place. The passphrase is
/// opaque data produced by the control channel and handed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Network name (SSID) clients see.
    pub network_name: String,
    /// Opaque passphrase for joining the group.
    pub passphrase: Bytes,
    /// Address of the group owner on the group interface.
    pub owner_addr: Option<IpAddr>,
    /// Devices currently connected to the group.
    pub clients: Vec<GroupClient>,
    /// Whether this device is the group owner.
    pub is_owner: bool,
    /// Name of the network interface backing the group.
    pub interface: Option<String>,
}

impl Group {
    /// Number of connected client devices.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// The three-way reconcile result for pre-existing group state.
///
/// The wireless-direct service is shared system-wide: a crashed previous run
/// or another consumer may have left a group behind, so a start attempt
/// classifies what it finds instead of assuming a clean slate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOwnership {
    /// No group exists; one has to be created.
    NoGroup,
    /// A group exists and this device owns it; adopt it as-is.
    OwnedByUs(Group),
    /// A leftover group owned by someone else; remove it before creating
    /// ours.
    OwnedByOther(Group),
}

impl GroupOwnership {
    pub fn classify(info: Option<Group>) -> Self {
        match info {
            None => Self::NoGroup,
            Some(group) if group.is_owner => Self::OwnedByUs(group),
            Some(group) => Self::OwnedByOther(group),
        }
    }
}
