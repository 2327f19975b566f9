//! End-to-end scenarios driving a real repeater against the scripted
//! backend and recording routes.

use bytes::Bytes;

use relay_core::{
    ControlFailure, EventBus, Group, Notice, RelayStatus, Repeater, RepeaterOptions, SystemEvent,
    TunnelNotifier,
};

use crate::fixtures::{
    drain, formed_group, joined_client, owner_addr, wait_status, wait_until, MemRoutes,
    ScriptedBackend, DOWN, UP,
};

struct Harness {
    repeater: Repeater<ScriptedBackend, MemRoutes>,
    backend: ScriptedBackend,
    routes: MemRoutes,
    notifier: TunnelNotifier,
    bus: EventBus,
    notices: tokio::sync::broadcast::Receiver<Notice>,
}

fn harness_with(
    backend: impl FnOnce(ScriptedBackend) -> ScriptedBackend,
    routes: impl FnOnce(MemRoutes) -> MemRoutes,
) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();
    let bus = EventBus::default();
    let notifier = TunnelNotifier::default();
    let backend = backend(ScriptedBackend::new(bus.clone()));
    let routes = routes(MemRoutes::new());
    let repeater =
        Repeater::new(backend.clone(), routes.clone(), notifier.clone(), bus.clone());
    let notices = repeater.notices();
    Harness { repeater, backend, routes, notifier, bus, notices }
}

fn harness() -> Harness {
    harness_with(|b| b, |r| r)
}

impl Harness {
    async fn bring_up(&mut self) {
        self.repeater.start();
        wait_status(&mut self.notices, RelayStatus::Starting).await;
        self.notifier.available(UP);
        wait_status(&mut self.notices, RelayStatus::Active).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_comes_up_and_tears_down() {
    let mut h = harness();
    h.bring_up().await;

    // The reported snapshot is exposed verbatim while active.
    assert_eq!(h.repeater.status(), RelayStatus::Active);
    assert_eq!(h.repeater.ssid().as_deref(), Some("DIRECT-xy"));
    assert_eq!(h.repeater.passphrase(), Some(Bytes::from_static(b"s3cretpw")));
    assert_eq!(h.repeater.group(), Some(formed_group()));

    assert_eq!(h.backend.queries(), 1);
    assert_eq!(h.backend.creates(), 1);
    assert_eq!(h.routes.started(), 1);
    let pairs = h.routes.pairs.lock().unwrap().clone();
    assert_eq!(pairs, vec![(UP.to_string(), DOWN.to_string(), owner_addr())]);

    h.repeater.stop();
    wait_status(&mut h.notices, RelayStatus::Idle).await;
    wait_until("routing stopped", || h.routes.stopped() == 1).await;

    assert_eq!(h.backend.removes(), 1);
    assert_eq!(h.repeater.ssid(), None);
    assert_eq!(h.repeater.passphrase(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_is_idempotent_while_running() {
    let mut h = harness();
    h.repeater.start();
    h.repeater.start();
    wait_status(&mut h.notices, RelayStatus::Starting).await;
    h.notifier.available(UP);
    wait_status(&mut h.notices, RelayStatus::Active).await;
    h.repeater.start();

    // Exactly one pass through the group-control channel.
    wait_until("group created", || h.backend.creates() == 1).await;
    assert_eq!(h.backend.queries(), 1);

    // Let the driver digest the redundant start, then check nothing moved.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.repeater.status(), RelayStatus::Active);
    let starting = drain(&mut h.notices)
        .into_iter()
        .filter(|n| matches!(n, Notice::StatusChanged(RelayStatus::Starting)))
        .count();
    assert_eq!(starting, 0, "no duplicate starting transition");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routing_failure_removes_the_group() {
    let mut h = harness_with(|b| b, MemRoutes::failing_start);
    h.repeater.start();
    wait_status(&mut h.notices, RelayStatus::Starting).await;
    h.notifier.available(UP);

    wait_status(&mut h.notices, RelayStatus::Idle).await;
    // The group was actively removed, not just abandoned, and the failed
    // start was still stopped to revert partial rules.
    assert_eq!(h.backend.removes(), 1);
    assert_eq!(h.routes.started(), 1);
    wait_until("failed session reverted", || h.routes.stopped() == 1).await;

    let warned = drain(&mut h.notices)
        .into_iter()
        .any(|n| matches!(n, Notice::Warning(msg) if msg.contains("routing")));
    assert!(warned, "routing failure surfaces a warning");
}

#[tokio::test(start_paused = true)]
async fn times_out_when_tunnel_never_appears() {
    let mut h = harness();
    h.repeater.start();
    wait_status(&mut h.notices, RelayStatus::Starting).await;

    // Time auto-advances: the 4s availability wait elapses without a tunnel.
    wait_status(&mut h.notices, RelayStatus::Idle).await;

    // No group-control traffic was issued.
    assert_eq!(h.backend.queries(), 0);
    assert_eq!(h.backend.creates(), 0);
    assert_eq!(h.backend.removes(), 0);

    let warned = drain(&mut h.notices)
        .into_iter()
        .any(|n| matches!(n, Notice::Warning(msg) if msg.contains("tunnel")));
    assert!(warned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tunnel_bounce_restarts_routing_without_group_traffic() {
    let mut h = harness();
    h.bring_up().await;

    h.notifier.lost(UP);
    wait_until("routing stopped", || h.routes.stopped() == 1).await;
    // Only routing stops on a tunnel drop; the group stays up.
    assert_eq!(h.repeater.status(), RelayStatus::Active);

    h.notifier.available(UP);
    wait_until("routing restarted", || h.routes.started() == 2).await;
    assert_eq!(h.repeater.status(), RelayStatus::Active);

    // Same pair both times, no new group-control traffic.
    let pairs = h.routes.pairs.lock().unwrap().clone();
    assert_eq!(pairs[0], pairs[1]);
    assert_eq!(h.backend.queries(), 1);
    assert_eq!(h.backend.creates(), 1);
    assert_eq!(h.backend.removes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_teardown_cleans_up_silently() {
    let mut h = harness();
    h.bring_up().await;

    h.bus.publish(SystemEvent::ConnectionChanged {
        owner: Some(owner_addr()),
        group: Some(Group { is_owner: false, ..formed_group() }),
    });

    wait_status(&mut h.notices, RelayStatus::Idle).await;
    // Already gone externally: no removal request is issued.
    assert_eq!(h.backend.removes(), 0);
    wait_until("routing reverted", || h.routes.stopped() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adopts_a_leftover_owned_group() {
    let mut h = harness_with(|b| b.with_existing_group(formed_group()), |r| r);
    h.bring_up().await;

    assert_eq!(h.backend.creates(), 0, "owned leftover group is adopted, not re-created");
    assert_eq!(h.repeater.ssid().as_deref(), Some("DIRECT-xy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replaces_a_stale_foreign_group() {
    let stale = Group { is_owner: false, ..formed_group() };
    let mut h = harness_with(|b| b.with_existing_group(stale), |r| r);
    h.bring_up().await;

    assert_eq!(h.backend.removes(), 1, "stale group removed first");
    assert_eq!(h.backend.creates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_changes_update_the_snapshot() {
    let mut h = harness();
    h.bring_up().await;
    drain(&mut h.notices);

    let refreshed = Group { clients: vec![joined_client()], ..formed_group() };
    h.bus.publish(SystemEvent::ConnectionChanged {
        owner: Some(owner_addr()),
        group: Some(refreshed.clone()),
    });

    wait_until("snapshot refreshed", || {
        h.repeater.group().is_some_and(|g| g.client_count() == 1)
    })
    .await;
    assert_eq!(h.repeater.status(), RelayStatus::Active);

    let changed = drain(&mut h.notices)
        .into_iter()
        .any(|n| matches!(n, Notice::GroupChanged(g) if g == refreshed));
    assert!(changed, "metadata change notifies observers");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn radio_loss_ends_the_relay() {
    let mut h = harness();
    h.bring_up().await;

    h.bus.publish(SystemEvent::RadioState { enabled: false });
    wait_status(&mut h.notices, RelayStatus::Idle).await;
    wait_until("routing reverted", || h.routes.stopped() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_the_handle_tears_down() {
    let mut h = harness();
    h.bring_up().await;

    let backend = h.backend.clone();
    let routes = h.routes.clone();
    drop(h.repeater);

    wait_until("group removed", || backend.removes() == 1).await;
    wait_until("routing reverted", || routes.stopped() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_failure_surfaces_and_cleans_up() {
    let mut h = harness_with(|b| b.fail_create(ControlFailure::Unsupported), |r| r);
    h.repeater.start();
    wait_status(&mut h.notices, RelayStatus::Starting).await;
    h.notifier.available(UP);

    wait_status(&mut h.notices, RelayStatus::Idle).await;
    assert_eq!(h.backend.creates(), 1);
    assert_eq!(h.routes.started(), 0);

    let warned = drain(&mut h.notices)
        .into_iter()
        .any(|n| matches!(n, Notice::Warning(msg) if msg.contains("unsupported")));
    assert!(warned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_removal_keeps_the_relay_active() {
    let mut h = harness_with(|b| b.fail_remove(ControlFailure::Generic), |r| r);
    h.bring_up().await;
    drain(&mut h.notices);

    h.repeater.stop();
    wait_until("removal attempted", || h.backend.removes() == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The group is still up, so the relay stays active and only warns.
    assert_eq!(h.repeater.status(), RelayStatus::Active);
    let notices = drain(&mut h.notices);
    assert!(notices.iter().any(|n| matches!(n, Notice::Warning(_))));
    assert!(!notices.iter().any(|n| matches!(n, Notice::StatusChanged(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_from_idle_is_silent() {
    let mut h = harness();
    h.repeater.stop();
    h.repeater.stop();

    // Give the driver a moment to process both commands.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.repeater.status(), RelayStatus::Idle);
    assert!(drain(&mut h.notices).is_empty(), "no notices from idle stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_timeout_is_honored() {
    let _ = tracing_subscriber::fmt::try_init();
    let bus = EventBus::default();
    let notifier = TunnelNotifier::default();
    let backend = ScriptedBackend::new(bus.clone());
    let routes = MemRoutes::new();
    let mut repeater = Repeater::with_options(
        backend.clone(),
        routes,
        notifier,
        bus,
        RepeaterOptions::default().tunnel_timeout(std::time::Duration::from_millis(50)),
    );
    let mut notices = repeater.notices();

    repeater.start();
    wait_status(&mut notices, RelayStatus::Starting).await;
    wait_status(&mut notices, RelayStatus::Idle).await;
    assert_eq!(backend.queries(), 0);
}
