//! The coordination driver: a future polled on the runtime that funnels
//! every asynchronous completion — control responses, routing task results,
//! bus broadcasts, tunnel notifications, the availability timeout, frontend
//! commands — into the state machine, strictly in arrival order, and carries
//! out the actions it emits. Machine state is only ever touched from this
//! loop.

use std::{
    collections::VecDeque,
    net::IpAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Future, FutureExt, StreamExt};
use tokio::{
    sync::{broadcast, mpsc},
    time::{sleep, Sleep},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, trace, warn};

use relay_common::{Channel, JoinMap};
use relay_routing::{Routes, Session};

use crate::{
    control::{ControlRequest, ControlResponse},
    controller::{Notice, RepeaterOptions, Shared},
    ingress::{EventBus, SystemEvent, TunnelEvent, TunnelNotifier},
    machine::{Action, Event, Machine},
};

/// Commands from the repeater frontend.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command {
    Start,
    Stop,
}

/// Keys for in-flight routing tasks. The [`JoinMap`] refuses a second task
/// with the same key, so a start or stop can never be issued twice
/// concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RoutingOp {
    Start,
    Stop,
}

/// Outcome of a routing task, carrying the session back on success so the
/// driver can keep it for the eventual stop.
pub(crate) enum RoutingDone<S> {
    Started { session: Option<S>, ok: bool },
    Stopped { ok: bool },
}

pub(crate) struct RepeaterDriver<R: Routes> {
    pub(crate) machine: Machine,
    pub(crate) options: Arc<RepeaterOptions>,
    /// Observer view, shared with the frontend.
    pub(crate) shared: Arc<Shared>,
    /// Notices to observers.
    pub(crate) notices: broadcast::Sender<Notice>,
    /// Commands from the frontend.
    pub(crate) from_frontend: mpsc::Receiver<Command>,
    /// Request/response channel to the group-control actor.
    pub(crate) control: Channel<ControlRequest, ControlResponse>,
    /// Routing session provider.
    pub(crate) routes: R,
    /// The established session, present exactly while rules are applied.
    pub(crate) session: Option<R::Session>,
    pub(crate) routing_tasks: JoinMap<RoutingOp, RoutingDone<R::Session>>,
    pub(crate) notifier: TunnelNotifier,
    pub(crate) bus: EventBus,
    /// Held while registered for tunnel availability.
    pub(crate) tunnel: Option<BroadcastStream<TunnelEvent>>,
    /// Held while subscribed to system broadcasts.
    pub(crate) ingress: Option<BroadcastStream<SystemEvent>>,
    /// The armed tunnel-availability timeout, if any.
    pub(crate) timeout: Option<Pin<Box<Sleep>>>,
    /// Events synthesized while executing actions, processed before any new
    /// input so ordering stays strict.
    pub(crate) pending: VecDeque<Event>,
    pub(crate) closing: bool,
}

impl<R> RepeaterDriver<R>
where
    R: Routes + Unpin,
    R::Session: Unpin,
{
    fn handle(&mut self, event: Event) {
        trace!(?event, status = ?self.machine.status(), "processing event");
        let actions = self.machine.step(event);
        for action in actions {
            self.execute(action);
        }
        self.machine.check_invariants();
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::WatchTunnel => self.tunnel = Some(self.notifier.watch()),
            Action::UnwatchTunnel => self.tunnel = None,
            Action::ArmTimeout => {
                self.timeout = Some(Box::pin(sleep(self.options.tunnel_timeout)));
            }
            Action::CancelTimeout => self.timeout = None,
            Action::Subscribe => self.ingress = Some(self.bus.subscribe()),
            Action::Unsubscribe => self.ingress = None,
            Action::QueryGroup => self.request(ControlRequest::QueryGroup),
            Action::CreateGroup => self.request(ControlRequest::CreateGroup),
            Action::RemoveGroup => self.request(ControlRequest::RemoveGroup),
            Action::StartRouting { upstream, downstream, owner } => {
                self.start_routing(&upstream, &downstream, owner);
            }
            Action::StopRouting => self.stop_routing(),
            Action::Status(status) => {
                self.shared.set_status(status);
                let _ = self.notices.send(Notice::StatusChanged(status));
            }
            Action::StoreGroup(group) => self.shared.set_group(group),
            Action::GroupChanged(group) => {
                self.shared.set_group(group.clone());
                let _ = self.notices.send(Notice::GroupChanged(group));
            }
            Action::Warn(message) => {
                warn!(%message);
                let _ = self.notices.send(Notice::Warning(message));
            }
        }
    }

    /// Forwards a request to the control actor. A dead or saturated channel
    /// is reported back to the machine as that operation failing, keeping
    /// the single-converging-cleanup guarantee.
    fn request(&mut self, request: ControlRequest) {
        if let Err(e) = self.control.try_send(request) {
            error!(?e, "control channel unavailable");
            use crate::control::ControlFailure::Generic;
            self.pending.push_back(match request {
                ControlRequest::QueryGroup => Event::GroupInfo(Err(Generic)),
                ControlRequest::CreateGroup => Event::GroupCreated(Err(Generic)),
                ControlRequest::RemoveGroup => Event::GroupRemoved(Err(Generic)),
            });
        }
    }

    fn start_routing(&mut self, upstream: &str, downstream: &str, owner: IpAddr) {
        if self.routing_tasks.contains_key(&RoutingOp::Start) {
            // The machine's phase guard makes this unreachable; the key
            // dedup below would drop the task silently, so be loud instead.
            warn!("routing start already in flight, ignoring");
            return;
        }
        debug!(upstream, downstream, %owner, "starting routing session");
        let session = self.routes.stage(upstream, downstream, owner);
        self.routing_tasks.spawn(RoutingOp::Start, async move {
            let done = match tokio::task::spawn_blocking(move || {
                let mut session = session;
                if session.start() {
                    RoutingDone::Started { session: Some(session), ok: true }
                } else {
                    // A failed start still stops, reverting whatever subset
                    // of rules was applied before the failure.
                    let _ = session.stop();
                    RoutingDone::Started { session: None, ok: false }
                }
            })
            .await
            {
                Ok(done) => done,
                Err(e) => {
                    error!(%e, "routing start task failed");
                    RoutingDone::Started { session: None, ok: false }
                }
            };
            (RoutingOp::Start, done)
        });
    }

    fn stop_routing(&mut self) {
        let Some(session) = self.session.take() else {
            // Nothing applied; stopping nothing succeeds by definition.
            self.pending.push_back(Event::RoutingStopped { ok: true });
            return;
        };
        self.routing_tasks.spawn(RoutingOp::Stop, async move {
            let done = match tokio::task::spawn_blocking(move || {
                let mut session = session;
                session.stop()
            })
            .await
            {
                Ok(ok) => RoutingDone::Stopped { ok },
                Err(e) => {
                    error!(%e, "routing stop task failed");
                    RoutingDone::Stopped { ok: false }
                }
            };
            (RoutingOp::Stop, done)
        });
    }

    fn on_routing_done(&mut self, done: RoutingDone<R::Session>) {
        match done {
            RoutingDone::Started { session, ok } => {
                if ok {
                    self.session = session;
                }
                self.pending.push_back(Event::RoutingStarted { ok });
            }
            RoutingDone::Stopped { ok } => {
                self.pending.push_back(Event::RoutingStopped { ok });
            }
        }
    }

    fn on_system_event(&mut self, event: SystemEvent) {
        match event {
            SystemEvent::RadioState { enabled: false } => self.handle(Event::RadioDisabled),
            // Radio coming up is not an input; the relay only cares about
            // losing it.
            SystemEvent::RadioState { enabled: true } => {}
            SystemEvent::ConnectionChanged { owner, group } => {
                self.handle(Event::ConnectionChanged { owner, group });
            }
        }
    }
}

fn control_event(response: ControlResponse) -> Event {
    match response {
        ControlResponse::GroupInfo(result) => Event::GroupInfo(result),
        ControlResponse::Created(result) => Event::GroupCreated(result),
        ControlResponse::Removed(result) => Event::GroupRemoved(result),
    }
}

impl<R> Future for RepeaterDriver<R>
where
    R: Routes + Unpin,
    R::Session: Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            // Synthesized events keep strict ordering: drain them before
            // accepting any new input.
            if let Some(event) = this.pending.pop_front() {
                this.handle(event);
                continue;
            }

            if let Some(timeout) = this.timeout.as_mut() {
                if timeout.poll_unpin(cx).is_ready() {
                    this.timeout = None;
                    this.handle(Event::TunnelTimeout);
                    continue;
                }
            }

            if let Poll::Ready(Some(response)) = this.control.poll_recv(cx) {
                this.handle(control_event(response));
                continue;
            }

            if let Poll::Ready(Some(result)) = this.routing_tasks.poll_join_next(cx) {
                match result {
                    Ok((_, done)) => this.on_routing_done(done),
                    Err(e) => error!(%e, "routing task panicked"),
                }
                continue;
            }

            if let Some(tunnel) = this.tunnel.as_mut() {
                match tunnel.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(TunnelEvent::Available { ifname }))) => {
                        this.handle(Event::TunnelAvailable { ifname });
                        continue;
                    }
                    Poll::Ready(Some(Ok(TunnelEvent::Lost { ifname }))) => {
                        this.handle(Event::TunnelLost { ifname });
                        continue;
                    }
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                        warn!(missed, "tunnel watch lagged");
                        continue;
                    }
                    Poll::Ready(None) => {
                        debug!("tunnel notifier dropped");
                        this.tunnel = None;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            if let Some(ingress) = this.ingress.as_mut() {
                match ingress.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(event))) => {
                        this.on_system_event(event);
                        continue;
                    }
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                        warn!(missed, "system event subscription lagged");
                        continue;
                    }
                    Poll::Ready(None) => {
                        debug!("system event bus dropped");
                        this.ingress = None;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            match this.from_frontend.poll_recv(cx) {
                Poll::Ready(Some(Command::Start)) => {
                    this.handle(Event::Start);
                    continue;
                }
                Poll::Ready(Some(Command::Stop)) => {
                    this.handle(Event::Stop);
                    continue;
                }
                Poll::Ready(None) => {
                    // Host teardown: the frontend handle was dropped. Run
                    // the stop path once, then drain until quiescent.
                    if !this.closing {
                        this.closing = true;
                        debug!("repeater handle dropped, shutting down");
                        this.handle(Event::Stop);
                        continue;
                    }
                }
                Poll::Pending => {}
            }

            if this.closing
                && this.machine.is_idle()
                && this.routing_tasks.is_empty()
                && this.pending.is_empty()
            {
                return Poll::Ready(());
            }

            return Poll::Pending;
        }
    }
}
