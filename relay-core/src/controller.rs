//! The repeater frontend: the handle applications hold to start and stop the
//! relay and observe its state. All coordination happens in the driver task;
//! the frontend only sends commands and reads the shared view.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::error;

use relay_common::{channel, JoinMap};
use relay_routing::Routes;

use crate::{
    control::{GroupBackend, GroupController},
    driver::{Command, RepeaterDriver},
    group::Group,
    ingress::{EventBus, TunnelNotifier},
    machine::{Machine, RelayStatus},
};

const DEFAULT_COMMAND_BUFFER: usize = 8;

/// Notifications delivered to observers.
#[derive(Debug, Clone)]
pub enum Notice {
    /// The relay status changed. Emitted once per transition, never for
    /// no-op sets or metadata updates.
    StatusChanged(RelayStatus),
    /// The group snapshot was replaced while the relay stayed active, e.g.
    /// a client joined or left.
    GroupChanged(Group),
    /// A user-visible warning: a failed start, a routing problem, a group
    /// that could not be removed.
    Warning(String),
}

/// Configuration for a repeater instance.
#[derive(Debug, Clone)]
pub struct RepeaterOptions {
    /// How long to wait for the upstream tunnel after a start request.
    pub(crate) tunnel_timeout: Duration,
    /// Buffer size for the observer notice channel.
    pub(crate) notice_capacity: usize,
    /// Buffer size for the control request/response channel.
    pub(crate) control_buffer: usize,
}

impl Default for RepeaterOptions {
    fn default() -> Self {
        Self {
            tunnel_timeout: Duration::from_secs(4),
            notice_capacity: 16,
            control_buffer: 8,
        }
    }
}

impl RepeaterOptions {
    /// Sets the bounded wait for tunnel availability.
    pub fn tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_timeout = timeout;
        self
    }

    /// Sets the observer notice buffer size.
    pub fn notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }
}

#[derive(Debug, Default)]
struct View {
    status: RelayStatus,
    group: Option<Group>,
}

/// Observer view shared between the driver and the frontend. Written only by
/// the driver; group data is readable only while the relay is active.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    view: RwLock<View>,
}

impl Shared {
    pub(crate) fn set_status(&self, status: RelayStatus) {
        self.view.write().status = status;
    }

    pub(crate) fn set_group(&self, group: Group) {
        self.view.write().group = Some(group);
    }

    fn status(&self) -> RelayStatus {
        self.view.read().status
    }

    fn active_group(&self) -> Option<Group> {
        let view = self.view.read();
        if view.status == RelayStatus::Active {
            view.group.clone()
        } else {
            None
        }
    }
}

/// The relay hotspot controller handle.
///
/// One instance owns one relay lifetime at a time: `start` drives the
/// machine from idle through group formation to active, `stop` tears
/// everything down. Dropping the handle tears the relay down as well.
pub struct Repeater<B, R: Routes> {
    to_driver: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    notices: broadcast::Sender<Notice>,
    /// The pending driver and control actor, spawned on first use.
    driver: Option<(RepeaterDriver<R>, GroupController<B>)>,
}

impl<B, R> Repeater<B, R>
where
    B: GroupBackend,
    R: Routes + Unpin,
    R::Session: Unpin,
{
    pub fn new(backend: B, routes: R, notifier: TunnelNotifier, bus: EventBus) -> Self {
        Self::with_options(backend, routes, notifier, bus, RepeaterOptions::default())
    }

    pub fn with_options(
        backend: B,
        routes: R,
        notifier: TunnelNotifier,
        bus: EventBus,
        options: RepeaterOptions,
    ) -> Self {
        let options = Arc::new(options);
        let shared = Arc::new(Shared::default());
        let (notices, _) = broadcast::channel(options.notice_capacity);
        let (to_driver, from_frontend) = mpsc::channel(DEFAULT_COMMAND_BUFFER);
        let (control, actor_half) = channel(options.control_buffer, options.control_buffer);

        let controller = GroupController::new(backend, actor_half);
        let driver = RepeaterDriver {
            machine: Machine::new(),
            options: Arc::clone(&options),
            shared: Arc::clone(&shared),
            notices: notices.clone(),
            from_frontend,
            control,
            routes,
            session: None,
            routing_tasks: JoinMap::new(),
            notifier,
            bus,
            tunnel: None,
            ingress: None,
            timeout: None,
            pending: VecDeque::new(),
            closing: false,
        };

        Self { to_driver, shared, notices, driver: Some((driver, controller)) }
    }

    /// Spawns the driver and the control actor on first use.
    fn ensure_active_driver(&mut self) {
        if let Some((driver, controller)) = self.driver.take() {
            tokio::spawn(controller.run());
            tokio::spawn(driver);
        }
    }

    /// Requests the relay to start forming. Ignored while already starting
    /// or active.
    pub fn start(&mut self) {
        self.ensure_active_driver();
        self.send(Command::Start);
    }

    /// Requests teardown. Safe in any state, idempotent from idle.
    pub fn stop(&mut self) {
        self.ensure_active_driver();
        self.send(Command::Stop);
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.to_driver.try_send(command) {
            error!(?e, "repeater driver unavailable");
        }
    }

    pub fn status(&self) -> RelayStatus {
        self.shared.status()
    }

    /// The group's network name, available while active.
    pub fn ssid(&self) -> Option<String> {
        self.shared.active_group().map(|g| g.network_name)
    }

    /// The group's passphrase, available while active.
    pub fn passphrase(&self) -> Option<Bytes> {
        self.shared.active_group().map(|g| g.passphrase)
    }

    /// The current group snapshot, available while active.
    pub fn group(&self) -> Option<Group> {
        self.shared.active_group()
    }

    /// Subscribes to status, group and warning notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

impl<B, R: Routes> std::fmt::Debug for Repeater<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repeater").field("status", &self.shared.status()).finish_non_exhaustive()
    }
}
