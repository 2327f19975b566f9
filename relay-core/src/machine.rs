//! The repeater state machine.
//!
//! Everything hard about the relay lives here: reconciling inputs from the
//! tunnel notifier, the group-control channel and the system event bus into
//! one status, while guaranteeing routing resources are neither leaked nor
//! double-applied. The machine is a pure transition function: it consumes
//! one [`Event`] at a time and emits the [`Action`]s the driver must carry
//! out, touching no I/O itself. All events are delivered on the single
//! coordination loop, so the machine needs no synchronization.

use std::net::IpAddr;

use tracing::{debug, info, warn};

use crate::control::ControlFailure;
use crate::group::{Group, GroupOwnership};

/// Relay lifecycle status. Every failure path converges back to `Idle`;
/// there is no failed state, failures surface as warning notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayStatus {
    #[default]
    Idle,
    Starting,
    Active,
}

/// The closed set of inputs the machine reacts to.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    /// External start trigger.
    Start,
    /// External stop trigger or host teardown.
    Stop,
    /// The upstream tunnel is up, or came back after a drop.
    TunnelAvailable { ifname: String },
    /// The upstream tunnel went away.
    TunnelLost { ifname: String },
    /// The bounded wait for tunnel availability elapsed.
    TunnelTimeout,
    /// Outcome of a group-state query.
    GroupInfo(Result<Option<Group>, ControlFailure>),
    /// Outcome of a group-creation request.
    GroupCreated(Result<(), ControlFailure>),
    /// Outcome of a group-removal request.
    GroupRemoved(Result<(), ControlFailure>),
    /// Connection-changed broadcast from the system bus.
    ConnectionChanged {
        owner: Option<IpAddr>,
        group: Option<Group>,
    },
    /// The wireless radio was switched off.
    RadioDisabled,
    /// A routing start attempt finished.
    RoutingStarted { ok: bool },
    /// A routing stop finished.
    RoutingStopped { ok: bool },
}

/// Side effects the driver executes on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// Start watching tunnel availability.
    WatchTunnel,
    /// Drop the tunnel watch.
    UnwatchTunnel,
    /// Arm the bounded tunnel-availability timeout.
    ArmTimeout,
    /// Disarm the timeout.
    CancelTimeout,
    /// Subscribe to system wireless broadcasts.
    Subscribe,
    /// Drop the broadcast subscription.
    Unsubscribe,
    /// Ask the control channel for current group state.
    QueryGroup,
    /// Ask the control channel to create a group.
    CreateGroup,
    /// Ask the control channel to remove the current group.
    RemoveGroup,
    /// Stage and apply a fresh routing session for the given pair.
    StartRouting {
        upstream: String,
        downstream: String,
        owner: IpAddr,
    },
    /// Retract the current routing session.
    StopRouting,
    /// Publish a status transition to observers.
    Status(RelayStatus),
    /// Update the shared group snapshot without notifying.
    StoreGroup(Group),
    /// Update the shared group snapshot and notify observers.
    GroupChanged(Group),
    /// Surface a user-visible warning.
    Warn(String),
}

/// Routing lifecycle as the machine tracks it. The actual session object
/// lives in the driver; the machine only needs the pair it is bound to and
/// which operations are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A start is in flight.
    Starting,
    /// Rules are applied.
    Established,
    /// A stop is in flight.
    Stopping,
    /// Rules retracted, binding kept for re-establishment.
    Stopped,
}

/// The interface pair a routing session is (or was) bound to. Retained
/// across a tunnel drop so routing can be re-run with the same downstream
/// and owner once the tunnel comes back.
#[derive(Debug, Clone)]
struct Binding {
    downstream: String,
    owner: IpAddr,
    phase: Phase,
}

/// Why a group removal was requested; decides what its outcome leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Removing a stale group found at startup; create ours afterwards.
    ReplaceStale,
    /// Removing our group after a routing failure; clean up afterwards.
    Teardown,
    /// Removing our group on an external stop request.
    Shutdown,
}

#[derive(Debug, Default)]
pub(crate) struct Machine {
    status: RelayStatus,
    group: Option<Group>,
    upstream: Option<String>,
    binding: Option<Binding>,
    removal: Option<Removal>,
    subscribed: bool,
    watching: bool,
}

impl Machine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn status(&self) -> RelayStatus {
        self.status
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.status == RelayStatus::Idle
    }

    /// Advances the machine by one event, returning the side effects to run.
    pub(crate) fn step(&mut self, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        match event {
            Event::Start => self.on_start(&mut out),
            Event::Stop => self.on_stop(&mut out),
            Event::TunnelAvailable { ifname } => self.on_tunnel_available(ifname, &mut out),
            Event::TunnelLost { ifname } => self.on_tunnel_lost(&ifname, &mut out),
            Event::TunnelTimeout => self.on_tunnel_timeout(&mut out),
            Event::GroupInfo(result) => self.on_group_info(result, &mut out),
            Event::GroupCreated(result) => self.on_group_created(result, &mut out),
            Event::GroupRemoved(result) => self.on_group_removed(result, &mut out),
            Event::ConnectionChanged { owner, group } => {
                self.on_connection_changed(owner, group, &mut out)
            }
            Event::RadioDisabled => self.on_radio_disabled(&mut out),
            Event::RoutingStarted { ok } => self.on_routing_started(ok, &mut out),
            Event::RoutingStopped { ok } => self.on_routing_stopped(ok, &mut out),
        }
        out
    }

    fn on_start(&mut self, out: &mut Vec<Action>) {
        if self.status != RelayStatus::Idle {
            debug!(status = ?self.status, "start ignored, relay already running");
            return;
        }
        // Watch before announcing: an observer reacting to the status change
        // may immediately report tunnel availability.
        self.watching = true;
        out.push(Action::WatchTunnel);
        out.push(Action::ArmTimeout);
        self.set_status(RelayStatus::Starting, out);
    }

    fn on_stop(&mut self, out: &mut Vec<Action>) {
        match self.status {
            RelayStatus::Idle => {}
            RelayStatus::Starting => self.cleanup(out),
            RelayStatus::Active => {
                if self.removal.is_some() {
                    debug!("stop ignored, a removal is already in flight");
                    return;
                }
                self.removal = Some(Removal::Shutdown);
                out.push(Action::RemoveGroup);
            }
        }
    }

    fn on_tunnel_available(&mut self, ifname: String, out: &mut Vec<Action>) {
        match self.status {
            RelayStatus::Starting => {
                out.push(Action::CancelTimeout);
                self.upstream = Some(ifname);
                if !self.subscribed {
                    self.subscribed = true;
                    out.push(Action::Subscribe);
                }
                out.push(Action::QueryGroup);
            }
            RelayStatus::Active => {
                // The group outlives a transient tunnel drop; re-run routing
                // with the known pair instead of re-creating the group. The
                // previous session must already be stopped.
                let binding = self
                    .binding
                    .as_mut()
                    .expect("active relay without a routing binding");
                match binding.phase {
                    Phase::Stopped => {
                        binding.phase = Phase::Starting;
                        let action = Action::StartRouting {
                            upstream: ifname.clone(),
                            downstream: binding.downstream.clone(),
                            owner: binding.owner,
                        };
                        self.upstream = Some(ifname);
                        out.push(action);
                    }
                    Phase::Starting | Phase::Stopping => {
                        // A second availability notification can race the
                        // previous routing teardown; reconciliation happens
                        // when the in-flight operation completes.
                        warn!("tunnel available while a routing operation is in flight, ignoring");
                    }
                    Phase::Established => {
                        panic!("tunnel became available while routing is still established");
                    }
                }
            }
            RelayStatus::Idle => {
                // The watch is dropped on cleanup, so this cannot be
                // delivered while idle.
                panic!("tunnel availability delivered while idle");
            }
        }
    }

    fn on_tunnel_lost(&mut self, ifname: &str, out: &mut Vec<Action>) {
        debug!(ifname, "upstream tunnel lost");
        self.upstream = None;
        if let Some(binding) = self.binding.as_mut() {
            if binding.phase == Phase::Established {
                binding.phase = Phase::Stopping;
                out.push(Action::StopRouting);
            }
        }
    }

    fn on_tunnel_timeout(&mut self, out: &mut Vec<Action>) {
        if self.status == RelayStatus::Starting && self.upstream.is_none() {
            out.push(Action::Warn("upstream tunnel unavailable".to_string()));
            self.cleanup(out);
        } else {
            debug!("stale tunnel timeout, ignoring");
        }
    }

    fn on_group_info(&mut self, result: Result<Option<Group>, ControlFailure>, out: &mut Vec<Action>) {
        if self.status != RelayStatus::Starting {
            debug!(status = ?self.status, "group info ignored");
            return;
        }
        match result {
            Ok(info) => match GroupOwnership::classify(info) {
                GroupOwnership::NoGroup => out.push(Action::CreateGroup),
                GroupOwnership::OwnedByUs(group) => {
                    // Adopt the leftover group instead of re-creating it. If
                    // the snapshot is missing the interface or owner address,
                    // the connection-changed broadcast will carry them.
                    info!(name = %group.network_name, "adopting existing group");
                    self.form(group.owner_addr, group, out);
                }
                GroupOwnership::OwnedByOther(group) => {
                    info!(name = %group.network_name, "removing stale group");
                    self.removal = Some(Removal::ReplaceStale);
                    out.push(Action::RemoveGroup);
                }
            },
            Err(reason) => {
                out.push(Action::Warn(format!("failed to query group state ({reason})")));
                self.cleanup(out);
            }
        }
    }

    fn on_group_created(&mut self, result: Result<(), ControlFailure>, out: &mut Vec<Action>) {
        if self.status != RelayStatus::Starting {
            debug!(status = ?self.status, "group creation outcome ignored");
            return;
        }
        match result {
            // Formation is reported through the event bus; nothing to do yet.
            Ok(()) => debug!("group creation acknowledged, waiting for formation broadcast"),
            Err(reason) => {
                out.push(Action::Warn(format!("failed to create group ({reason})")));
                self.cleanup(out);
            }
        }
    }

    fn on_group_removed(&mut self, result: Result<(), ControlFailure>, out: &mut Vec<Action>) {
        let Some(removal) = self.removal.take() else {
            debug!("unsolicited group removal outcome, ignoring");
            return;
        };
        // A busy control channel means the group is already gone.
        let gone = matches!(result, Ok(()) | Err(ControlFailure::Busy));
        match removal {
            Removal::ReplaceStale => {
                if gone {
                    out.push(Action::CreateGroup);
                } else if let Err(reason) = result {
                    out.push(Action::Warn(format!("failed to remove stale group ({reason})")));
                    self.cleanup(out);
                }
            }
            Removal::Teardown => {
                if let Err(reason) = result {
                    if reason != ControlFailure::Busy {
                        out.push(Action::Warn(format!("failed to remove group ({reason})")));
                    }
                }
                self.cleanup(out);
            }
            Removal::Shutdown => {
                if gone {
                    self.cleanup(out);
                } else if let Err(reason) = result {
                    // The group is still up; the relay stays active.
                    out.push(Action::Warn(format!("failed to remove group ({reason})")));
                }
            }
        }
    }

    fn on_connection_changed(
        &mut self,
        owner: Option<IpAddr>,
        group: Option<Group>,
        out: &mut Vec<Action>,
    ) {
        if self.group.is_none() && self.binding.is_none() {
            // Not yet tracking a group: this is the formation report.
            if self.status != RelayStatus::Starting {
                debug!(status = ?self.status, "connection change ignored");
                return;
            }
            let Some(group) = group else { return };
            self.form(owner, group, out);
            return;
        }

        match group {
            Some(group) if !group.is_owner => {
                // The platform tore the group down underneath us. Normal
                // lifecycle, not an error: clean up silently, and there is
                // nothing left to remove.
                debug!("group no longer ours, cleaning up");
                self.cleanup(out);
            }
            Some(group) => {
                // Metadata refresh: client list or name changed.
                self.group = Some(group.clone());
                if self.status == RelayStatus::Active {
                    out.push(Action::GroupChanged(group));
                } else {
                    out.push(Action::StoreGroup(group));
                }
            }
            None => {}
        }
    }

    /// Binds to a fully formed group and kicks off routing. Partial or
    /// irrelevant snapshots are ignored: the group must be formed with this
    /// device as owner, and both the interface and the owner address must be
    /// known.
    fn form(&mut self, owner: Option<IpAddr>, group: Group, out: &mut Vec<Action>) {
        if !group.is_owner {
            return;
        }
        let Some(owner) = owner.or(group.owner_addr) else { return };
        let Some(downstream) = group.interface.clone() else { return };

        match self.upstream.clone() {
            Some(upstream) => {
                self.binding = Some(Binding {
                    downstream: downstream.clone(),
                    owner,
                    phase: Phase::Starting,
                });
                self.group = Some(group.clone());
                out.push(Action::StoreGroup(group));
                out.push(Action::StartRouting { upstream, downstream, owner });
            }
            None => {
                // The tunnel vanished while the group was forming. The group
                // is up but there is nothing to route into, so take it down
                // rather than leave clients on a dead network.
                self.group = Some(group);
                out.push(Action::Warn(
                    "upstream tunnel lost while the group was forming".to_string(),
                ));
                self.removal = Some(Removal::Teardown);
                out.push(Action::RemoveGroup);
            }
        }
    }

    fn on_radio_disabled(&mut self, out: &mut Vec<Action>) {
        if self.status == RelayStatus::Idle {
            return;
        }
        debug!("wireless radio disabled, ending relay");
        self.cleanup(out);
    }

    fn on_routing_started(&mut self, ok: bool, out: &mut Vec<Action>) {
        match self.status {
            RelayStatus::Starting => {
                if !ok {
                    // Never leave a client-visible group standing with no
                    // working route behind it.
                    if let Some(binding) = self.binding.as_mut() {
                        binding.phase = Phase::Stopped;
                    }
                    out.push(Action::Warn("failed to apply relay routing".to_string()));
                    self.removal = Some(Removal::Teardown);
                    out.push(Action::RemoveGroup);
                } else if self.upstream.is_some() {
                    if let Some(binding) = self.binding.as_mut() {
                        binding.phase = Phase::Established;
                    }
                    self.set_status(RelayStatus::Active, out);
                } else {
                    // The tunnel was lost while the start was in flight.
                    // Retract and wait for it to come back.
                    warn!("tunnel lost during routing start, retracting");
                    if let Some(binding) = self.binding.as_mut() {
                        binding.phase = Phase::Stopping;
                    }
                    out.push(Action::StopRouting);
                }
            }
            RelayStatus::Active => {
                // Completion of the re-establishment started on tunnel
                // re-availability.
                if ok {
                    if let Some(binding) = self.binding.as_mut() {
                        binding.phase = Phase::Established;
                    }
                } else {
                    if let Some(binding) = self.binding.as_mut() {
                        binding.phase = Phase::Stopped;
                    }
                    out.push(Action::Warn("failed to re-apply relay routing".to_string()));
                    self.removal = Some(Removal::Teardown);
                    out.push(Action::RemoveGroup);
                }
            }
            RelayStatus::Idle => {
                // Cleanup won the race against the start; retract the
                // session so no rules outlive the relay.
                if ok {
                    out.push(Action::StopRouting);
                }
            }
        }
    }

    fn on_routing_stopped(&mut self, ok: bool, out: &mut Vec<Action>) {
        if let Some(binding) = self.binding.as_mut() {
            if binding.phase == Phase::Stopping {
                binding.phase = Phase::Stopped;
            }
        }
        if !ok {
            // Retraction failure never blocks the state machine; the kernel
            // state is logged for diagnosis.
            out.push(Action::Warn("failed to fully revert relay routing".to_string()));
        }
    }

    /// The single converging path back to idle. Releases every external
    /// subscription, retracts routing if it is applied, and forgets all
    /// session state.
    fn cleanup(&mut self, out: &mut Vec<Action>) {
        if self.watching {
            self.watching = false;
            out.push(Action::UnwatchTunnel);
        }
        if self.subscribed {
            self.subscribed = false;
            out.push(Action::Unsubscribe);
        }
        out.push(Action::CancelTimeout);
        if let Some(binding) = &self.binding {
            match binding.phase {
                Phase::Established => out.push(Action::StopRouting),
                // A start still in flight is retracted when its completion
                // arrives in idle; a stop in flight is already on its way.
                Phase::Starting | Phase::Stopping | Phase::Stopped => {}
            }
        }
        self.binding = None;
        self.group = None;
        self.upstream = None;
        self.removal = None;
        self.set_status(RelayStatus::Idle, out);
    }

    fn set_status(&mut self, status: RelayStatus, out: &mut Vec<Action>) {
        if self.status == status {
            return;
        }
        self.status = status;
        out.push(Action::Status(status));
    }

    /// Structural invariants, checked by the driver after every event.
    pub(crate) fn check_invariants(&self) {
        match self.status {
            RelayStatus::Idle => {
                assert!(self.binding.is_none(), "idle relay holds a routing binding");
                assert!(self.group.is_none(), "idle relay tracks a group");
                assert!(self.upstream.is_none(), "idle relay remembers an upstream");
                assert!(self.removal.is_none(), "idle relay awaits a removal");
                assert!(!self.subscribed && !self.watching, "idle relay holds subscriptions");
            }
            RelayStatus::Active => {
                assert!(self.binding.is_some(), "active relay without a routing binding");
                assert!(self.group.is_some(), "active relay without a group");
            }
            RelayStatus::Starting => {}
        }
    }
}
