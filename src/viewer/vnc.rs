//! VNC viewer variant.
//!
//! VNC keeps the simpler half of the event contract: auth failures are
//! always worth a reprompt, there is no guest agent, no USB redirection,
//! and no guest-driven resize. Desktop size arrives only through resize
//! events, so the last one seen is cached for `desktop_resolution`.

use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::connection::ConnectionInfo;
use crate::error::ConsoleError;
use crate::tunnel::scheduler::TunnelScheduler;

use super::engine::{CredentialKind, EngineEvent, EngineFactory};
use super::{ConnectState, PumpShared, Viewer, ViewerCore, ViewerEvent, ViewerKind};

pub struct VncViewer {
    core: ViewerCore,
}

impl VncViewer {
    pub fn new(
        info: ConnectionInfo,
        scheduler: Arc<TunnelScheduler>,
        ssh: &SshConfig,
        factory: &dyn EngineFactory,
        events: UnboundedSender<ViewerEvent>,
    ) -> Result<Self, ConsoleError> {
        Ok(Self {
            core: ViewerCore::new(info, scheduler, ssh, factory, events)?,
        })
    }
}

impl Viewer for VncViewer {
    fn kind(&self) -> ViewerKind {
        ViewerKind::Vnc
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
        self.core.set_pump(tokio::spawn(pump(rx, shared)));
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

    fn set_password(&mut self, password: &str) {
        self.core.set_credential(CredentialKind::Password, password);
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
        false
    }

    fn set_resize_guest(&mut self, _enabled: bool) {}

    fn has_usb_redirection(&self) -> bool {
        false
    }

    fn has_agent(&self) -> bool {
        false
    }
}

/// Translate engine events for the controller. The tunnel gate is released
/// on every event: any signal at all means the ssh child got far enough
/// that a queued prompt (if one is coming) is now safe to show.
async fn pump(mut rx: UnboundedReceiver<EngineEvent>, shared: PumpShared) {
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
                shared.emit(ViewerEvent::AuthError {
                    message,
                    retryable: true,
                });
            }
            EngineEvent::ChannelError { kind, message } => {
                let detail = message.unwrap_or_else(|| format!("{} error", kind.as_str()));
                shared.emit_disconnected(Some(detail));
                break;
            }
            EngineEvent::DesktopResized { width, height } => {
                debug!(width, height, "desktop resized");
                *shared.resolution.lock().unwrap() = Some((width, height));
            }
            EngineEvent::FdRequested { channel_id } => {
                warn!(channel_id, "unexpected fd request from vnc engine");
            }
            EngineEvent::AgentConnected | EngineEvent::UsbRedirectError { .. } => {
                debug!("ignoring spice-only engine event");
            }
        }
    }
}
