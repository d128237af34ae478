//! Console session lifecycle: guards, reconnect backoff, and the event
//! surface the embedding UI consumes.
//!
//! The controller owns at most one viewer at a time. Everything it learns
//! (state changes, auth prompts, disconnect details) goes out as
//! [`ConsoleEvent`]s; everything it reacts to comes in through the VM state
//! watch or the viewer's event channel, multiplexed in [`ConsoleSessionController::drive`].

pub mod retry;

use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::ConsoleConfig;
use crate::connection::{ConnectDescriptor, ConnectionInfo, GraphicsProtocol};
use crate::error::ConsoleError;
use crate::tunnel::scheduler::TunnelScheduler;
use crate::viewer::engine::EngineFactory;
use crate::viewer::{self, Viewer, ViewerEvent};
use crate::vm::{VmHandle, VmRunState};

use retry::RetryState;

/// What the console is showing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleState {
    /// No usable display; the reason travels with the state change.
    Unavailable,
    /// Waiting for credentials.
    Authenticate,
    /// Live display.
    Viewer,
}

/// Notifications to the embedder.
#[derive(Clone, Debug)]
pub enum ConsoleEvent {
    StateChanged {
        state: ConsoleState,
        reason: Option<String>,
    },
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

pub struct ConsoleSessionController {
    vm: Arc<dyn VmHandle>,
    conn: ConnectDescriptor,
    vm_states: watch::Receiver<VmRunState>,
    scheduler: Arc<TunnelScheduler>,
    engines: Arc<dyn EngineFactory>,
    config: ConsoleConfig,
    events: UnboundedSender<ConsoleEvent>,
    viewer: Option<Box<dyn Viewer>>,
    viewer_rx: Option<UnboundedReceiver<ViewerEvent>>,
    state: ConsoleState,
    retry: RetryState,
    retry_at: Option<Instant>,
    started: bool,
}

impl ConsoleSessionController {
    pub fn new(
        vm: Arc<dyn VmHandle>,
        conn: ConnectDescriptor,
        vm_states: watch::Receiver<VmRunState>,
        scheduler: Arc<TunnelScheduler>,
        engines: Arc<dyn EngineFactory>,
        config: ConsoleConfig,
    ) -> (Self, UnboundedReceiver<ConsoleEvent>) {
        let (events, events_rx) = unbounded_channel();
        let retry = RetryState::new(config.retry);
        (
            Self {
                vm,
                conn,
                vm_states,
                scheduler,
                engines,
                config,
                events,
                viewer: None,
                viewer_rx: None,
                state: ConsoleState::Unavailable,
                retry,
                retry_at: None,
                started: false,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.viewer.as_ref().is_some_and(|v| v.is_open())
    }

    /// User-initiated connect. Resets the backoff budget before trying.
    pub fn connect(&mut self) {
        self.retry.reset();
        self.retry_at = None;
        self.try_connect();
    }

    /// User-initiated disconnect. Cancels any pending retry.
    pub fn disconnect(&mut self) {
        self.retry_at = None;
        self.close_viewer();
        self.set_state(ConsoleState::Unavailable, None);
    }

    pub fn set_username(&mut self, username: &str) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_username(username);
        }
    }

    pub fn set_password(&mut self, password: &str) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_password(password);
        }
    }

    pub fn send_keys(&mut self, keys: &[String]) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.send_keys(keys);
        }
    }

    pub fn desktop_resolution(&self) -> Option<(u32, u32)> {
        self.viewer.as_ref().and_then(|v| v.desktop_resolution())
    }

    pub fn scaling(&self) -> bool {
        self.viewer.as_ref().is_some_and(|v| v.scaling())
    }

    pub fn set_scaling(&mut self, scaling: bool) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_scaling(scaling);
        }
    }

    pub fn resize_guest(&self) -> bool {
        self.viewer.as_ref().is_some_and(|v| v.resize_guest())
    }

    pub fn set_resize_guest(&mut self, enabled: bool) {
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_resize_guest(enabled);
        }
    }

    pub fn has_usb_redirection(&self) -> bool {
        self.viewer.as_ref().is_some_and(|v| v.has_usb_redirection())
    }

    pub fn has_agent(&self) -> bool {
        self.viewer.as_ref().is_some_and(|v| v.has_agent())
    }

    pub fn viewer(&self) -> Option<&dyn Viewer> {
        self.viewer.as_deref()
    }

    pub fn viewer_mut(&mut self) -> Option<&mut (dyn Viewer + 'static)> {
        self.viewer.as_deref_mut()
    }

    /// Run the session until the VM state channel closes. Multiplexes VM
    /// lifecycle changes, viewer events, and the retry timer.
    pub async fn drive(&mut self) {
        if !self.started {
            self.started = true;
            if self.config.autoconnect && self.vm.is_active() {
                self.connect();
            }
        }
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                changed = self.vm_states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.vm_states.borrow_and_update();
                    self.handle_vm_state(state);
                }
                event = recv_viewer(&mut self.viewer_rx) => {
                    match event {
                        Some(event) => self.handle_viewer_event(event),
                        // Pump ended without a terminal event; treat it as
                        // an unexplained drop.
                        None => {
                            self.viewer_rx = None;
                            self.handle_viewer_event(ViewerEvent::Disconnected {
                                detail: None,
                                ssh_stderr: None,
                            });
                        }
                    }
                }
                _ = wait_deadline(retry_at) => {
                    self.retry_at = None;
                    debug!(attempt = self.retry.attempts(), "retrying console connection");
                    self.try_connect();
                }
            }
        }
    }

    fn handle_vm_state(&mut self, state: VmRunState) {
        debug!(vm = %self.vm.name(), ?state, "vm lifecycle change");
        match state {
            VmRunState::Shutoff | VmRunState::Crashed => {
                // No timer survives a dead guest.
                self.retry_at = None;
                self.close_viewer();
                self.set_state(ConsoleState::Unavailable, Some(vm_down_reason(state)));
            }
            VmRunState::Running => {
                let idle = self.viewer.is_none() && self.retry_at.is_none();
                if self.config.autoconnect && idle {
                    self.connect();
                }
            }
            // A paused guest keeps its display server; leave the session be.
            VmRunState::Paused => {}
        }
    }

    fn handle_viewer_event(&mut self, event: ViewerEvent) {
        match event {
            ViewerEvent::Connected => {
                info!(vm = %self.vm.name(), "console connected");
                self.retry.reset();
                self.set_state(ConsoleState::Viewer, None);
                self.emit(ConsoleEvent::Connected);
            }
            ViewerEvent::Disconnected { detail, ssh_stderr } => {
                warn!(vm = %self.vm.name(), ?detail, "viewer disconnected");
                self.emit(ConsoleEvent::Disconnected {
                    detail: detail.clone(),
                    ssh_stderr: ssh_stderr.clone(),
                });
                self.close_viewer();
                if self.vm.is_active() {
                    // A drop with captured ssh stderr is a tunnel process
                    // failure; both classes are transient.
                    let err = match ssh_stderr {
                        Some(stderr) => ConsoleError::Process(stderr),
                        None => ConsoleError::Transient(
                            detail.unwrap_or_else(|| "Viewer was disconnected.".to_string()),
                        ),
                    };
                    self.fail_attempt(err);
                } else {
                    self.set_state(
                        ConsoleState::Unavailable,
                        Some(vm_down_reason(self.vm.run_state())),
                    );
                }
            }
            ViewerEvent::NeedAuth {
                want_password,
                want_username,
            } => {
                self.set_state(ConsoleState::Authenticate, None);
                self.emit(ConsoleEvent::NeedAuth {
                    want_password,
                    want_username,
                });
            }
            // Auth problems reprompt instead of burning retry attempts.
            ViewerEvent::AuthError { message, retryable } => {
                let err = ConsoleError::Auth {
                    message: message.clone(),
                    retryable,
                };
                self.set_state(ConsoleState::Authenticate, Some(err.to_string()));
                self.emit(ConsoleEvent::AuthError { message, retryable });
            }
            ViewerEvent::AuthRejected { message } => {
                self.set_state(ConsoleState::Authenticate, Some(message.clone()));
                self.emit(ConsoleEvent::AuthRejected { message });
            }
            ViewerEvent::AgentConnected => self.emit(ConsoleEvent::AgentConnected),
            ViewerEvent::UsbRedirectError { message } => {
                self.emit(ConsoleEvent::UsbRedirectError { message });
            }
        }
    }

    /// One connection attempt, guards first. Terminal problems land in
    /// `Unavailable` with a reason; transient ones schedule a retry.
    fn try_connect(&mut self) {
        if self.viewer.is_some() {
            return;
        }

        let vm_state = self.vm.run_state();
        if !vm_state.is_active() {
            self.set_state(ConsoleState::Unavailable, Some(vm_down_reason(vm_state)));
            return;
        }

        let Some(gdev) = self.vm.graphics() else {
            self.set_state(
                ConsoleState::Unavailable,
                Some("Graphical console not configured for guest".to_string()),
            );
            return;
        };

        if let Some(GraphicsProtocol::Other(name)) = &gdev.protocol {
            self.set_state(
                ConsoleState::Unavailable,
                Some(format!("Cannot display graphical console type '{name}'")),
            );
            return;
        }

        let info = ConnectionInfo::new(&self.conn, &gdev);
        debug!(connection = %info, "resolved console connection");

        if let Some(reason) = info.bad_config() {
            self.set_state(ConsoleState::Unavailable, Some(reason));
            return;
        }

        if !info.console_active() {
            // Display port not assigned yet (autoport still pending).
            self.schedule_retry("Graphical console is not yet active for guest".to_string());
            return;
        }

        let (viewer_tx, viewer_rx) = unbounded_channel();
        let built = viewer::create(
            info,
            self.scheduler.clone(),
            &self.config.ssh,
            self.engines.as_ref(),
            viewer_tx,
        );
        let mut viewer = match built {
            Ok(viewer) => viewer,
            Err(err) => {
                self.fail_attempt(err);
                return;
            }
        };

        match viewer.open() {
            Ok(()) => {
                self.viewer = Some(viewer);
                self.viewer_rx = Some(viewer_rx);
                self.set_state(
                    ConsoleState::Unavailable,
                    Some("Connecting to graphical console for guest".to_string()),
                );
            }
            Err(err) => self.fail_attempt(err),
        }
    }

    /// Route a failed attempt by the error taxonomy: transient errors go
    /// through the backoff machine, everything else is terminal.
    fn fail_attempt(&mut self, err: ConsoleError) {
        if err.is_transient() {
            self.schedule_retry(err.to_string());
        } else {
            self.set_state(ConsoleState::Unavailable, Some(err.to_string()));
        }
    }

    fn schedule_retry(&mut self, reason: String) {
        match self.retry.next_delay() {
            Some(delay) => {
                debug!(?delay, attempt = self.retry.attempts(), "scheduling reconnect");
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ConsoleState::Unavailable, Some(reason));
            }
            None => {
                warn!(vm = %self.vm.name(), "giving up on console reconnect");
                self.set_state(
                    ConsoleState::Unavailable,
                    Some("Cannot reconnect to the graphical console".to_string()),
                );
            }
        }
    }

    fn close_viewer(&mut self) {
        if let Some(mut viewer) = self.viewer.take() {
            viewer.close();
        }
        self.viewer_rx = None;
    }

    fn set_state(&mut self, state: ConsoleState, reason: Option<String>) {
        if self.state == state && reason.is_none() {
            return;
        }
        self.state = state;
        self.emit(ConsoleEvent::StateChanged { state, reason });
    }

    fn emit(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }
}

fn vm_down_reason(state: VmRunState) -> String {
    match state {
        VmRunState::Crashed => "Guest has crashed.".to_string(),
        _ => "Guest is not running.".to_string(),
    }
}

async fn recv_viewer(rx: &mut Option<UnboundedReceiver<ViewerEvent>>) -> Option<ViewerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
