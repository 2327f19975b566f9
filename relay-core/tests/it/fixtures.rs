//! Test doubles: a scripted control backend and a recording routes provider.

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::broadcast, time::timeout};

use relay_core::{
    ControlFailure, EventBus, Group, GroupBackend, GroupClient, Notice, RelayStatus, SystemEvent,
};
use relay_routing::{Routes, Session};

pub const UP: &str = "tun0";
pub const DOWN: &str = "p2p-wlan0-0";

pub fn owner_addr() -> IpAddr {
    "192.168.49.1".parse().unwrap()
}

pub fn formed_group() -> Group {
    Group {
        network_name: "DIRECT-xy".to_string(),
        passphrase: Bytes::from_static(b"s3cretpw"),
        owner_addr: Some(owner_addr()),
        clients: Vec::new(),
        is_owner: true,
        interface: Some(DOWN.to_string()),
    }
}

pub fn joined_client() -> GroupClient {
    GroupClient {
        device_address: "aa:bb:cc:dd:ee:ff".to_string(),
        device_name: Some("phone".to_string()),
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub queries: AtomicUsize,
    pub creates: AtomicUsize,
    pub removes: AtomicUsize,
}

#[derive(Debug)]
struct BackendState {
    connected: bool,
    group: Option<Group>,
    create: Result<(), ControlFailure>,
    remove: Result<(), ControlFailure>,
}

/// A scripted wireless-direct service. Creation publishes the formation
/// broadcast on the bus the way the platform does; removal clears the group.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
    bus: EventBus,
    pub counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                connected: false,
                group: None,
                create: Ok(()),
                remove: Ok(()),
            })),
            bus,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Pre-seeds a leftover group, as if a previous run left one behind.
    pub fn with_existing_group(self, group: Group) -> Self {
        self.state.lock().unwrap().group = Some(group);
        self
    }

    pub fn fail_create(self, reason: ControlFailure) -> Self {
        self.state.lock().unwrap().create = Err(reason);
        self
    }

    pub fn fail_remove(self, reason: ControlFailure) -> Self {
        self.state.lock().unwrap().remove = Err(reason);
        self
    }

    pub fn queries(&self) -> usize {
        self.counters.queries.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.counters.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupBackend for ScriptedBackend {
    async fn open(&self) -> Result<(), ControlFailure> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn group_info(&self) -> Result<Option<Group>, ControlFailure> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().group.clone())
    }

    async fn create_group(&self) -> Result<(), ControlFailure> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.create.is_ok() {
                state.group = Some(formed_group());
            }
            state.create
        };
        if result.is_ok() {
            self.bus.publish(SystemEvent::ConnectionChanged {
                owner: Some(owner_addr()),
                group: Some(formed_group()),
            });
        }
        result
    }

    async fn remove_group(&self) -> Result<(), ControlFailure> {
        self.counters.removes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.remove.is_ok() {
            state.group = None;
        }
        state.remove
    }
}

/// A routes provider that records staged pairs and start/stop calls instead
/// of touching the kernel.
#[derive(Debug, Clone)]
pub struct MemRoutes {
    start_ok: Arc<AtomicBool>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub pairs: Arc<Mutex<Vec<(String, String, IpAddr)>>>,
}

impl MemRoutes {
    pub fn new() -> Self {
        Self {
            start_ok: Arc::new(AtomicBool::new(true)),
            starts: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            pairs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_start(self) -> Self {
        self.start_ok.store(false, Ordering::SeqCst);
        self
    }

    pub fn started(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MemSession {
    routes: MemRoutes,
}

impl Session for MemSession {
    fn start(&mut self) -> bool {
        self.routes.starts.fetch_add(1, Ordering::SeqCst);
        self.routes.start_ok.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> bool {
        self.routes.stops.fetch_add(1, Ordering::SeqCst);
        true
    }
}

impl Routes for MemRoutes {
    type Session = MemSession;

    fn stage(&self, upstream: &str, downstream: &str, owner: IpAddr) -> MemSession {
        self.pairs.lock().unwrap().push((upstream.to_string(), downstream.to_string(), owner));
        MemSession { routes: self.clone() }
    }
}

pub async fn wait_status(notices: &mut broadcast::Receiver<Notice>, want: RelayStatus) {
    timeout(Duration::from_secs(5), async {
        loop {
            match notices.recv().await {
                Ok(Notice::StatusChanged(status)) if status == want => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("notice stream ended: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

/// Drains buffered notices, returning them.
pub fn drain(notices: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}
