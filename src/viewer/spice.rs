//! SPICE viewer variant.
//!
//! SPICE carries the richer half of the event contract: per-channel errors,
//! guest agent presence, USB redirection, and secondary channels that ask
//! for their own tunnel fd. Its auth failure signal is ambiguous, so it is
//! split on whether a password was ever supplied: before that it means
//! "this display wants a password", after it means "the password was wrong".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::connection::ConnectionInfo;
use crate::error::ConsoleError;
use crate::tunnel::scheduler::TunnelScheduler;

use super::engine::{CredentialKind, EngineEvent, EngineFactory};
use super::{ConnectState, PumpShared, Viewer, ViewerCore, ViewerEvent, ViewerKind};

pub struct SpiceViewer {
    core: ViewerCore,
    password_set: Arc<AtomicBool>,
}

impl SpiceViewer {
    pub fn new(
        info: ConnectionInfo,
        scheduler: Arc<TunnelScheduler>,
        ssh: &SshConfig,
        factory: &dyn EngineFactory,
        events: UnboundedSender<ViewerEvent>,
    ) -> Result<Self, ConsoleError> {
        Ok(Self {
            core: ViewerCore::new(info, scheduler, ssh, factory, events)?,
            password_set: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Viewer for SpiceViewer {
    fn kind(&self) -> ViewerKind {
        ViewerKind::Spice
    }

    fn open(&mut self) -> Result<(), ConsoleError> {
        if !self.core.begin_open()? {
            return Ok(());
        }
        let rx = self
            .core
            .take_engine_rx()
            .ok_or_else(|| ConsoleError::Transient("viewer already consumed".to_string()))?;
        let shared = self.core.shared().clone();
        let password_set = self.password_set.clone();
        self.core.set_pump(tokio::spawn(pump(rx, shared, password_set)));
        Ok(())
    }

    fn close(&mut self) {
        self.core.close();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn set_username(&mut self, username: &str) {
        self.core.set_credential(CredentialKind::Username, username);
    }

    /// Store the password and drive the connection again. The SPICE session
    /// only learns it needed a password by failing, so supplying one restarts
    /// the handshake.
    fn set_password(&mut self, password: &str) {
        if self.core.state() == ConnectState::Closed {
            return;
        }
        self.core.set_credential(CredentialKind::Password, password);
        self.password_set.store(true, Ordering::SeqCst);
        if let Err(err) = self.core.attach_engine() {
            warn!(error = %err, "reconnect after password failed");
            self.core.shared().emit_disconnected(Some(err.to_string()));
        }
    }

    fn send_keys(&mut self, keys: &[String]) {
        self.core.send_keys(keys);
    }

    fn desktop_resolution(&self) -> Option<(u32, u32)> {
        self.core.desktop_resolution()
    }

    fn scaling(&self) -> bool {
        self.core.with_engine(false, |e| e.scaling())
    }

    fn set_scaling(&mut self, scaling: bool) {
        self.core.with_engine((), |e| e.set_scaling(scaling));
    }

    fn resize_guest(&self) -> bool {
        self.core.with_engine(false, |e| e.resize_guest())
    }

    fn set_resize_guest(&mut self, enabled: bool) {
        self.core.with_engine((), |e| e.set_resize_guest(enabled));
    }

    fn has_usb_redirection(&self) -> bool {
        self.core.with_engine(false, |e| e.has_usb_redirection())
    }

    fn has_agent(&self) -> bool {
        self.core.with_engine(false, |e| e.has_agent())
    }
}

async fn pump(
    mut rx: UnboundedReceiver<EngineEvent>,
    shared: PumpShared,
    password_set: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        shared.tunnels.unlock();
        match event {
            EngineEvent::Connected => {
                *shared.state.lock().unwrap() = ConnectState::Open;
                shared.emit(ViewerEvent::Connected);
            }
            EngineEvent::Disconnected { detail } => {
                shared.emit_disconnected(detail);
                break;
            }
            EngineEvent::CredentialsRequested {
                want_password,
                want_username,
            } => {
                shared.emit(ViewerEvent::NeedAuth {
                    want_password,
                    want_username,
                });
            }
            EngineEvent::AuthFailure { message } => {
                if password_set.load(Ordering::SeqCst) {
                    shared.emit(ViewerEvent::AuthRejected { message });
                } else {
                    shared.emit(ViewerEvent::NeedAuth {
                        want_password: true,
                        want_username: false,
                    });
                }
            }
            EngineEvent::ChannelError { kind, message } => {
                let mut detail = format!("Encountered SPICE {} error", kind.as_str());
                if let Some(message) = message {
                    detail.push_str(&format!(": {message}"));
                }
                shared.emit_disconnected(Some(detail));
                break;
            }
            EngineEvent::FdRequested { channel_id } => {
                // Secondary channels each get their own tunnel over the
                // shared ssh gate.
                debug!(channel_id, "opening tunnel for secondary channel");
                let attached = shared.tunnels.open_new().and_then(|stream| {
                    shared
                        .engine
                        .lock()
                        .unwrap()
                        .open_channel_stream(channel_id, stream)
                        .map_err(std::io::Error::other)
                });
                if let Err(err) = attached {
                    shared.emit_disconnected(Some(format!(
                        "failed to open channel {channel_id}: {err}"
                    )));
                    break;
                }
            }
            EngineEvent::DesktopResized { width, height } => {
                *shared.resolution.lock().unwrap() = Some((width, height));
            }
            EngineEvent::AgentConnected => {
                shared.emit(ViewerEvent::AgentConnected);
            }
            EngineEvent::UsbRedirectError { message } => {
                shared.emit(ViewerEvent::UsbRedirectError { message });
            }
        }
    }
}
