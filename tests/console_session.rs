//! End-to-end console session scenarios against a scripted protocol engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::time::timeout;

use virtconsole::config::{ConsoleConfig, SshConfig};
use virtconsole::connection::{ConnectDescriptor, GraphicsDescriptor, GraphicsProtocol, Transport};
use virtconsole::console::{ConsoleEvent, ConsoleSessionController, ConsoleState};
use virtconsole::tunnel::scheduler::TunnelScheduler;
use virtconsole::viewer::engine::{CredentialKind, EngineEvent};
use virtconsole::viewer::mock::MockEngineFactory;
use virtconsole::vm::{VmHandle, VmRunState};

struct TestVm {
    state: Mutex<VmRunState>,
    graphics: Mutex<Option<GraphicsDescriptor>>,
}

impl TestVm {
    fn new(state: VmRunState, graphics: Option<GraphicsDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            graphics: Mutex::new(graphics),
        })
    }

    fn set_state(&self, state: VmRunState) {
        *self.state.lock().unwrap() = state;
    }
}

impl VmHandle for TestVm {
    fn run_state(&self) -> VmRunState {
        *self.state.lock().unwrap()
    }

    fn graphics(&self) -> Option<GraphicsDescriptor> {
        self.graphics.lock().unwrap().clone()
    }

    fn name(&self) -> String {
        "testvm".to_string()
    }
}

struct Session {
    ctl: ConsoleSessionController,
    events: UnboundedReceiver<ConsoleEvent>,
    factory: Arc<MockEngineFactory>,
    vm: Arc<TestVm>,
    vm_tx: watch::Sender<VmRunState>,
}

fn session(
    conn: ConnectDescriptor,
    vm_state: VmRunState,
    graphics: Option<GraphicsDescriptor>,
) -> Session {
    // A relay argv of "true" keeps tunnel spawns from invoking real ssh.
    session_with_ssh(conn, vm_state, graphics, "true")
}

fn session_with_ssh(
    conn: ConnectDescriptor,
    vm_state: VmRunState,
    graphics: Option<GraphicsDescriptor>,
    ssh_binary: &str,
) -> Session {
    let vm = TestVm::new(vm_state, graphics);
    let (vm_tx, vm_rx) = watch::channel(vm_state);
    let factory = MockEngineFactory::new();
    let config = ConsoleConfig {
        ssh: SshConfig {
            binary: ssh_binary.to_string(),
            extra_flags: Vec::new(),
        },
        autoconnect: false,
        ..Default::default()
    };
    let (ctl, events) = ConsoleSessionController::new(
        vm.clone(),
        conn,
        vm_rx,
        TunnelScheduler::new(),
        factory.clone(),
        config,
    );
    Session {
        ctl,
        events,
        factory,
        vm,
        vm_tx,
    }
}

fn direct_conn() -> ConnectDescriptor {
    ConnectDescriptor::default()
}

fn ssh_conn() -> ConnectDescriptor {
    ConnectDescriptor {
        transport: Transport::Ssh,
        host: "vmhost.example.com".to_string(),
        port: Some(22),
        username: Some("admin".to_string()),
    }
}

fn open_vnc() -> GraphicsDescriptor {
    GraphicsDescriptor {
        protocol: Some(GraphicsProtocol::Vnc),
        port: Some(5900),
        listen: Some("0.0.0.0".to_string()),
        ..Default::default()
    }
}

fn localhost_vnc() -> GraphicsDescriptor {
    GraphicsDescriptor {
        listen: Some("127.0.0.1".to_string()),
        ..open_vnc()
    }
}

fn open_spice() -> GraphicsDescriptor {
    GraphicsDescriptor {
        protocol: Some(GraphicsProtocol::Spice),
        ..open_vnc()
    }
}

/// Poll the controller loop for up to `ms` of (possibly auto-advanced) time.
async fn run(ctl: &mut ConsoleSessionController, ms: u64) {
    let _ = timeout(Duration::from_millis(ms), ctl.drive()).await;
}

fn drain(events: &mut UnboundedReceiver<ConsoleEvent>) -> Vec<ConsoleEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn last_reason(events: &[ConsoleEvent]) -> Option<String> {
    events.iter().rev().find_map(|event| match event {
        ConsoleEvent::StateChanged { reason, .. } => reason.clone(),
        _ => None,
    })
}

#[tokio::test]
async fn shutoff_guest_is_refused() {
    let mut s = session(direct_conn(), VmRunState::Shutoff, Some(open_vnc()));
    s.ctl.connect();
    let events = drain(&mut s.events);
    assert_eq!(last_reason(&events).as_deref(), Some("Guest is not running."));
    assert_eq!(s.ctl.state(), ConsoleState::Unavailable);
    assert_eq!(s.factory.engines_created(), 0);
}

#[tokio::test]
async fn crashed_guest_reports_the_crash() {
    let mut s = session(direct_conn(), VmRunState::Crashed, Some(open_vnc()));
    s.ctl.connect();
    let events = drain(&mut s.events);
    assert_eq!(last_reason(&events).as_deref(), Some("Guest has crashed."));
    assert_eq!(s.factory.engines_created(), 0);
}

#[tokio::test]
async fn missing_graphics_device_is_terminal() {
    let mut s = session(direct_conn(), VmRunState::Running, None);
    s.ctl.connect();
    let events = drain(&mut s.events);
    assert!(
        last_reason(&events)
            .unwrap()
            .contains("not configured for guest")
    );
    assert_eq!(s.factory.engines_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn fd_only_listen_on_remote_host_is_terminal() {
    let gdev = GraphicsDescriptor {
        protocol: Some(GraphicsProtocol::Vnc),
        listen_type: Some(virtconsole::connection::ListenType::None),
        ..Default::default()
    };
    let mut s = session(ssh_conn(), VmRunState::Running, Some(gdev));
    s.ctl.connect();
    let events = drain(&mut s.events);
    assert!(
        last_reason(&events)
            .unwrap()
            .contains("local file descriptor connections")
    );
    // Terminal: no retry timer, no engine ever built.
    run(&mut s.ctl, 10_000).await;
    assert_eq!(s.factory.engines_created(), 0);
}

#[tokio::test]
async fn direct_connection_dials_the_display_address() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    assert_eq!(
        s.factory.open_host_calls(),
        vec![("127.0.0.1".to_string(), Some(5900), None)]
    );
    assert_eq!(s.factory.stream_count(), 0);

    s.factory.emit(EngineEvent::Connected);
    run(&mut s.ctl, 10).await;
    assert_eq!(s.ctl.state(), ConsoleState::Viewer);
    assert!(s.ctl.is_open());
    let events = drain(&mut s.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ConsoleEvent::Connected))
    );
}

#[tokio::test]
async fn localhost_display_over_ssh_gets_a_tunnel() {
    let mut s = session(ssh_conn(), VmRunState::Running, Some(localhost_vnc()));
    s.ctl.connect();
    assert_eq!(s.factory.stream_count(), 1);
    assert!(s.factory.open_host_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn autoport_pending_retries_until_bound() {
    let gdev = GraphicsDescriptor {
        port: Some(-1),
        autoport: true,
        ..open_vnc()
    };
    let vm_graphics = gdev.clone();
    let mut s = session(direct_conn(), VmRunState::Running, Some(vm_graphics));
    s.ctl.connect();
    let events = drain(&mut s.events);
    assert!(last_reason(&events).unwrap().contains("not yet active"));
    assert_eq!(s.factory.engines_created(), 0);

    // The port shows up before the next attempt fires.
    *s.vm.graphics.lock().unwrap() = Some(GraphicsDescriptor {
        port: Some(5901),
        ..gdev
    });
    run(&mut s.ctl, 200).await;
    assert_eq!(s.factory.engines_created(), 1);
    assert_eq!(
        s.factory.open_host_calls(),
        vec![("127.0.0.1".to_string(), Some(5901), None)]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_running_reconnects_with_backoff() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::Connected);
    run(&mut s.ctl, 10).await;
    assert_eq!(s.ctl.state(), ConsoleState::Viewer);

    s.factory.emit(EngineEvent::Disconnected { detail: None });
    run(&mut s.ctl, 10).await;
    let events = drain(&mut s.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ConsoleEvent::Disconnected { .. }))
    );
    assert_eq!(s.ctl.state(), ConsoleState::Unavailable);
    assert_eq!(s.factory.engines_created(), 1);

    // First retry fires 125ms after the drop.
    run(&mut s.ctl, 200).await;
    assert_eq!(s.factory.engines_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn guest_shutdown_closes_the_session_without_retry() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::Connected);
    run(&mut s.ctl, 10).await;
    assert!(s.ctl.is_open());

    s.vm.set_state(VmRunState::Shutoff);
    s.vm_tx.send(VmRunState::Shutoff).unwrap();
    run(&mut s.ctl, 10).await;
    assert!(!s.ctl.is_open());
    assert!(s.factory.shutdowns() >= 1);
    let events = drain(&mut s.events);
    assert_eq!(last_reason(&events).as_deref(), Some("Guest is not running."));

    run(&mut s.ctl, 10_000).await;
    assert_eq!(s.factory.engines_created(), 1);
}

#[tokio::test]
async fn vnc_auth_failure_reprompts() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::AuthFailure {
        message: "VNC authentication failed".to_string(),
    });
    run(&mut s.ctl, 10).await;
    assert_eq!(s.ctl.state(), ConsoleState::Authenticate);
    let events = drain(&mut s.events);
    assert!(events.iter().any(|e| matches!(
        e,
        ConsoleEvent::AuthError { retryable: true, .. }
    )));
    assert!(
        last_reason(&events)
            .unwrap()
            .contains("authentication failed")
    );
}

#[tokio::test]
async fn spice_auth_failure_asks_for_a_password_first() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_spice()));
    s.ctl.connect();
    assert_eq!(s.factory.open_host_calls().len(), 1);

    s.factory.emit(EngineEvent::AuthFailure {
        message: "SPICE auth error".to_string(),
    });
    run(&mut s.ctl, 10).await;
    assert_eq!(s.ctl.state(), ConsoleState::Authenticate);
    let events = drain(&mut s.events);
    assert!(events.iter().any(|e| matches!(
        e,
        ConsoleEvent::NeedAuth {
            want_password: true,
            want_username: false,
        }
    )));

    // Supplying the password redials the display.
    s.ctl.set_password("sekrit");
    assert_eq!(
        s.factory.credentials(),
        vec![(CredentialKind::Password, "sekrit".to_string())]
    );
    assert_eq!(s.factory.open_host_calls().len(), 2);

    // A second failure now means the password was wrong.
    s.factory.emit(EngineEvent::AuthFailure {
        message: "SPICE auth error".to_string(),
    });
    run(&mut s.ctl, 10).await;
    let events = drain(&mut s.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ConsoleEvent::AuthRejected { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn spice_secondary_channel_gets_its_own_tunnel() {
    let gdev = GraphicsDescriptor {
        listen: Some("127.0.0.1".to_string()),
        ..open_spice()
    };
    let mut s = session(ssh_conn(), VmRunState::Running, Some(gdev));
    s.ctl.connect();
    assert_eq!(s.factory.stream_count(), 1);

    s.factory.emit(EngineEvent::Connected);
    s.factory.emit(EngineEvent::FdRequested { channel_id: 3 });
    run(&mut s.ctl, 10).await;
    assert_eq!(s.factory.channel_stream_ids(), vec![3]);
}

#[tokio::test]
async fn tunnel_spawn_failure_is_a_process_error() {
    let mut s = session_with_ssh(
        ssh_conn(),
        VmRunState::Running,
        Some(localhost_vnc()),
        "/nonexistent/virtconsole-test-ssh",
    );
    s.ctl.connect();
    assert_eq!(s.factory.stream_count(), 1);

    // Give the scheduler worker time to fail the spawn and write the error
    // text into the tunnel's stderr socket.
    tokio::time::sleep(Duration::from_millis(200)).await;
    s.factory.emit(EngineEvent::Disconnected { detail: None });
    run(&mut s.ctl, 10).await;

    let events = drain(&mut s.events);
    assert!(events.iter().any(|e| matches!(
        e,
        ConsoleEvent::Disconnected { ssh_stderr: Some(stderr), .. }
            if stderr.contains("failed to spawn")
    )));
    assert!(
        last_reason(&events)
            .unwrap()
            .contains("tunnel process failed")
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_opens_fresh_tunnels() {
    let mut s = session(ssh_conn(), VmRunState::Running, Some(localhost_vnc()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::Connected);
    run(&mut s.ctl, 10).await;
    assert_eq!(s.factory.stream_count(), 1);

    s.factory.emit(EngineEvent::Disconnected { detail: None });
    run(&mut s.ctl, 200).await;
    assert_eq!(s.factory.engines_created(), 2);
    assert_eq!(s.factory.stream_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_eventually_give_up() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    assert_eq!(s.factory.engines_created(), 1);

    for attempt in 1..=10u32 {
        s.factory.emit(EngineEvent::Disconnected { detail: None });
        // Delays are capped at 2s, so 3s always reaches the next attempt.
        run(&mut s.ctl, 3000).await;
        assert_eq!(s.factory.engines_created(), (attempt + 1) as usize);
    }

    s.factory.emit(EngineEvent::Disconnected { detail: None });
    run(&mut s.ctl, 5000).await;
    assert_eq!(s.factory.engines_created(), 11);
    let events = drain(&mut s.events);
    assert!(
        last_reason(&events)
            .unwrap()
            .contains("Cannot reconnect to the graphical console")
    );

    // An explicit reconnect resets the budget.
    s.ctl.connect();
    assert_eq!(s.factory.engines_created(), 12);
}

#[tokio::test]
async fn resolution_is_cached_from_resize_events() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_vnc()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::Connected);
    s.factory.emit(EngineEvent::DesktopResized {
        width: 1280,
        height: 800,
    });
    run(&mut s.ctl, 10).await;
    assert_eq!(s.ctl.desktop_resolution(), Some((1280, 800)));
}

#[tokio::test]
async fn agent_and_usb_events_are_forwarded() {
    let mut s = session(direct_conn(), VmRunState::Running, Some(open_spice()));
    s.ctl.connect();
    s.factory.emit(EngineEvent::Connected);
    s.factory.emit(EngineEvent::AgentConnected);
    s.factory.emit(EngineEvent::UsbRedirectError {
        message: "device busy".to_string(),
    });
    run(&mut s.ctl, 10).await;
    let events = drain(&mut s.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ConsoleEvent::AgentConnected))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ConsoleEvent::UsbRedirectError { .. }))
    );
}
