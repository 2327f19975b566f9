//! Dry-run demo: wires a repeater against an in-memory wireless-direct
//! backend and routes that only log what they would apply, then walks the
//! relay through start, active and teardown.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};

use relay::{
    ControlFailure, EventBus, Group, GroupBackend, Notice, RelayStatus, Repeater, Routes, Session,
    SystemEvent, TunnelNotifier,
};

const OWNER: &str = "192.168.49.1";
const DOWNSTREAM: &str = "p2p-wlan0-0";

struct DemoBackend {
    connected: AtomicBool,
    bus: EventBus,
}

fn demo_group() -> Group {
    let passphrase: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    Group {
        network_name: "DIRECT-demo".to_string(),
        passphrase: Bytes::from(passphrase),
        owner_addr: Some(OWNER.parse().unwrap()),
        clients: Vec::new(),
        is_owner: true,
        interface: Some(DOWNSTREAM.to_string()),
    }
}

#[async_trait]
impl GroupBackend for DemoBackend {
    async fn open(&self) -> Result<(), ControlFailure> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn group_info(&self) -> Result<Option<Group>, ControlFailure> {
        Ok(None)
    }

    async fn create_group(&self) -> Result<(), ControlFailure> {
        // The platform reports formation through the system bus.
        self.bus.publish(SystemEvent::ConnectionChanged {
            owner: Some(OWNER.parse().unwrap()),
            group: Some(demo_group()),
        });
        Ok(())
    }

    async fn remove_group(&self) -> Result<(), ControlFailure> {
        Ok(())
    }
}

struct DryRunRoutes;

struct DryRunSession {
    upstream: String,
    downstream: String,
}

impl Session for DryRunSession {
    fn start(&mut self) -> bool {
        println!("would route {} -> {}", self.downstream, self.upstream);
        true
    }

    fn stop(&mut self) -> bool {
        println!("would revert {} -> {}", self.downstream, self.upstream);
        true
    }
}

impl Routes for DryRunRoutes {
    type Session = DryRunSession;

    fn stage(&self, upstream: &str, downstream: &str, _owner: IpAddr) -> DryRunSession {
        DryRunSession { upstream: upstream.to_string(), downstream: downstream.to_string() }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let bus = EventBus::default();
    let notifier = TunnelNotifier::default();
    let backend = DemoBackend { connected: AtomicBool::new(false), bus: bus.clone() };

    let mut repeater = Repeater::new(backend, DryRunRoutes, notifier.clone(), bus);
    let mut notices = repeater.notices();

    repeater.start();

    while let Ok(notice) = notices.recv().await {
        match notice {
            Notice::StatusChanged(RelayStatus::Starting) => {
                println!("forming relay, announcing tunnel");
                notifier.available("tun0");
            }
            Notice::StatusChanged(RelayStatus::Active) => {
                println!(
                    "relay up: ssid={:?} passphrase={:?}",
                    repeater.ssid(),
                    repeater.passphrase()
                );
                repeater.stop();
            }
            Notice::StatusChanged(RelayStatus::Idle) => {
                println!("relay down");
                break;
            }
            Notice::GroupChanged(group) => {
                println!("{} client(s) connected", group.client_count());
            }
            Notice::Warning(message) => println!("warning: {message}"),
        }
    }
}
