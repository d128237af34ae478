//! Uniform session API over the VNC and SPICE display engines.
//!
//! A viewer owns the protocol engine for one console session, the bundle of
//! SSH tunnels that session needed, and the pump task translating engine
//! events into the outward [`ViewerEvent`] vocabulary. The two variants
//! differ only in auth semantics and channel handling; everything else lives
//! in [`ViewerCore`].

pub mod engine;
pub mod mock;
pub mod spice;
pub mod vnc;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SshConfig;
use crate::connection::{ConnectionInfo, GraphicsProtocol};
use crate::error::ConsoleError;
use crate::tunnel::{SshTunnels, scheduler::TunnelScheduler};
use engine::{CredentialKind, EngineEvent, EngineFactory, ProtocolEngine};

/// Discriminant for the two viewer variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerKind {
    Vnc,
    Spice,
}

/// Events a viewer emits toward the console controller. Exactly one terminal
/// signal (`Disconnected`) covers every non-auth ending; auth problems keep
/// their own signals so the controller can reprompt instead of backing off.
#[derive(Clone, Debug)]
pub enum ViewerEvent {
    Connected,
    Disconnected {
        detail: Option<String>,
        ssh_stderr: Option<String>,
    },
    NeedAuth {
        want_password: bool,
        want_username: bool,
    },
    AuthError {
        message: String,
        retryable: bool,
    },
    AuthRejected {
        message: String,
    },
    AgentConnected,
    UsbRedirectError {
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Closed,
    Connecting,
    Open,
}

/// Capability surface shared by both variants. All passthroughs are no-ops
/// or return their "absent" value on an unopened session.
pub trait Viewer: Send {
    fn kind(&self) -> ViewerKind;

    /// Start the connection attempt. A second call while one is pending is a
    /// no-op. Tunnel-or-direct is decided by `ConnectionInfo::need_tunnel`.
    fn open(&mut self) -> Result<(), ConsoleError>;

    /// Tear down the engine and every tunnel. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn set_username(&mut self, username: &str);
    fn set_password(&mut self, password: &str);

    fn send_keys(&mut self, keys: &[String]);
    fn desktop_resolution(&self) -> Option<(u32, u32)>;

    fn scaling(&self) -> bool;
    fn set_scaling(&mut self, scaling: bool);
    fn resize_guest(&self) -> bool;
    fn set_resize_guest(&mut self, enabled: bool);
    fn has_usb_redirection(&self) -> bool;
    fn has_agent(&self) -> bool;
}

/// Build the right viewer variant for the connection's protocol.
pub fn create(
    info: ConnectionInfo,
    scheduler: Arc<TunnelScheduler>,
    ssh: &SshConfig,
    factory: &dyn EngineFactory,
    events: UnboundedSender<ViewerEvent>,
) -> Result<Box<dyn Viewer>, ConsoleError> {
    let protocol = info
        .protocol()
        .cloned()
        .unwrap_or(GraphicsProtocol::Other("none".to_string()));
    match protocol {
        GraphicsProtocol::Vnc => Ok(Box::new(vnc::VncViewer::new(
            info, scheduler, ssh, factory, events,
        )?)),
        GraphicsProtocol::Spice => Ok(Box::new(spice::SpiceViewer::new(
            info, scheduler, ssh, factory, events,
        )?)),
        GraphicsProtocol::Other(name) => Err(ConsoleError::Configuration(format!(
            "Cannot display graphical console type '{name}'"
        ))),
    }
}

/// State shared between a viewer and its event pump task.
#[derive(Clone)]
pub(crate) struct PumpShared {
    pub tunnels: Arc<SshTunnels>,
    pub engine: Arc<Mutex<Box<dyn ProtocolEngine>>>,
    pub events: UnboundedSender<ViewerEvent>,
    pub state: Arc<Mutex<ConnectState>>,
    pub resolution: Arc<Mutex<Option<(u32, u32)>>>,
}

impl PumpShared {
    pub(crate) fn emit(&self, event: ViewerEvent) {
        let _ = self.events.send(event);
    }

    /// Normalize any terminal engine condition into one `Disconnected`
    /// signal, with whatever the tunnels wrote to stderr attached. The gate
    /// must already be released by the caller.
    pub(crate) fn emit_disconnected(&self, detail: Option<String>) {
        let stderr = self.tunnels.err_output();
        let ssh_stderr = (!stderr.is_empty()).then_some(stderr);
        *self.state.lock().unwrap() = ConnectState::Closed;
        self.emit(ViewerEvent::Disconnected { detail, ssh_stderr });
    }
}

/// Everything both viewer variants have in common.
pub(crate) struct ViewerCore {
    info: ConnectionInfo,
    shared: PumpShared,
    engine_rx: Option<UnboundedReceiver<EngineEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl ViewerCore {
    pub(crate) fn new(
        info: ConnectionInfo,
        scheduler: Arc<TunnelScheduler>,
        ssh: &SshConfig,
        factory: &dyn EngineFactory,
        events: UnboundedSender<ViewerEvent>,
    ) -> Result<Self, ConsoleError> {
        let protocol = info
            .protocol()
            .cloned()
            .ok_or_else(|| ConsoleError::Configuration("no graphics protocol".to_string()))?;
        let tunnels = Arc::new(SshTunnels::new(scheduler, &info, ssh));
        let (engine_tx, engine_rx) = unbounded_channel();
        let engine = factory
            .create(&protocol, engine_tx)
            .map_err(|err| ConsoleError::Transient(err.to_string()))?;

        Ok(Self {
            info,
            shared: PumpShared {
                tunnels,
                engine: Arc::new(Mutex::new(engine)),
                events,
                state: Arc::new(Mutex::new(ConnectState::Closed)),
                resolution: Arc::new(Mutex::new(None)),
            },
            engine_rx: Some(engine_rx),
            pump: None,
        })
    }

    pub(crate) fn shared(&self) -> &PumpShared {
        &self.shared
    }

    pub(crate) fn state(&self) -> ConnectState {
        *self.shared.state.lock().unwrap()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ConnectState::Open
    }

    /// Take the engine event receiver for the pump task. `None` after the
    /// first open; a viewer is single-shot and a fresh session gets a fresh
    /// viewer (and fresh tunnels).
    pub(crate) fn take_engine_rx(&mut self) -> Option<UnboundedReceiver<EngineEvent>> {
        self.engine_rx.take()
    }

    pub(crate) fn set_pump(&mut self, pump: JoinHandle<()>) {
        self.pump = Some(pump);
    }

    /// Common open path: configuration check, then tunnel-or-direct dial.
    /// Returns false when an attempt is already in flight (or the viewer was
    /// already used up).
    pub(crate) fn begin_open(&mut self) -> Result<bool, ConsoleError> {
        {
            let state = self.shared.state.lock().unwrap();
            if *state != ConnectState::Closed {
                return Ok(false);
            }
        }
        if self.pump.is_some() {
            // Closed after an earlier open; sessions are not reusable.
            return Ok(false);
        }
        if let Some(reason) = self.info.bad_config() {
            return Err(ConsoleError::Configuration(reason));
        }

        *self.shared.state.lock().unwrap() = ConnectState::Connecting;
        match self.attach_engine() {
            Ok(()) => Ok(true),
            Err(err) => {
                *self.shared.state.lock().unwrap() = ConnectState::Closed;
                Err(err)
            }
        }
    }

    /// Point the engine at the right endpoint: a freshly queued tunnel fd,
    /// or the display server's own address.
    pub(crate) fn attach_engine(&self) -> Result<(), ConsoleError> {
        let mut engine = self.shared.engine.lock().unwrap();
        if self.info.need_tunnel() {
            let stream = self.shared.tunnels.open_new()?;
            engine
                .open_stream(stream)
                .map_err(|err| ConsoleError::Transient(err.to_string()))
        } else {
            let (host, port, tlsport) = self.info.get_conn_host();
            debug!(%host, ?port, ?tlsport, "connecting viewer directly");
            engine
                .open_host(&host, port, tlsport)
                .map_err(|err| ConsoleError::Transient(err.to_string()))
        }
    }

    pub(crate) fn set_credential(&self, kind: CredentialKind, value: &str) {
        if self.state() == ConnectState::Closed {
            return;
        }
        let _ = self
            .shared
            .engine
            .lock()
            .unwrap()
            .set_credential(kind, value);
    }

    pub(crate) fn send_keys(&self, keys: &[String]) {
        if !self.is_open() {
            return;
        }
        let _ = self.shared.engine.lock().unwrap().send_keys(keys);
    }

    /// Last resolution the engine reported, filtered for bogus 0x0 values.
    pub(crate) fn desktop_resolution(&self) -> Option<(u32, u32)> {
        if !self.is_open() {
            return None;
        }
        let cached = *self.shared.resolution.lock().unwrap();
        cached
            .or_else(|| self.shared.engine.lock().unwrap().desktop_resolution())
            .filter(|(w, h)| *w > 0 && *h > 0)
    }

    pub(crate) fn with_engine<R>(
        &self,
        default: R,
        f: impl FnOnce(&mut Box<dyn ProtocolEngine>) -> R,
    ) -> R {
        if self.state() == ConnectState::Closed {
            return default;
        }
        f(&mut self.shared.engine.lock().unwrap())
    }

    pub(crate) fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.shared.engine.lock().unwrap().shutdown();
        self.shared.tunnels.close_all();
        *self.shared.state.lock().unwrap() = ConnectState::Closed;
        debug!("viewer closed");
    }
}

impl Drop for ViewerCore {
    fn drop(&mut self) {
        self.close();
    }
}
