//! The seam to the actual VNC/SPICE protocol implementations.
//!
//! The wire protocols are out of scope here: engines are opaque objects the
//! embedder supplies, consuming either a dialable (host, port) pair or an
//! already-connected byte stream, and reporting progress through a channel of
//! [`EngineEvent`]s. The crate ships [`crate::viewer::mock`] for tests.

use anyhow::Result;
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::GraphicsProtocol;

/// Which credential an engine is being handed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    Username,
    Password,
}

/// SPICE channel error classes, normalized away from the engine's own enums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelErrorKind {
    Connect,
    Io,
    Link,
    Tls,
}

impl ChannelErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelErrorKind::Connect => "connect",
            ChannelErrorKind::Io => "io",
            ChannelErrorKind::Link => "link",
            ChannelErrorKind::Tls => "tls",
        }
    }
}

/// Asynchronous notifications from a protocol engine.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// Handshake complete, display usable.
    Connected,
    /// The engine's connection ended, cleanly or not.
    Disconnected { detail: Option<String> },
    /// The server wants credentials before continuing the handshake.
    CredentialsRequested {
        want_password: bool,
        want_username: bool,
    },
    /// The server rejected the credentials we supplied.
    AuthFailure { message: String },
    /// Transport-level channel failure (SPICE).
    ChannelError {
        kind: ChannelErrorKind,
        message: Option<String>,
    },
    /// A secondary channel wants its own connection fd (SPICE).
    FdRequested { channel_id: u64 },
    /// The guest desktop changed size.
    DesktopResized { width: u32, height: u32 },
    /// The in-guest agent channel came up (SPICE).
    AgentConnected,
    /// A USB redirection operation failed (SPICE).
    UsbRedirectError { message: String },
}

/// Uniform surface over the two display engines. All methods are
/// non-blocking; connection progress arrives as [`EngineEvent`]s on the
/// sender given to the factory.
pub trait ProtocolEngine: Send {
    /// Dial the display server directly.
    fn open_host(&mut self, host: &str, port: Option<u16>, tlsport: Option<u16>) -> Result<()>;

    /// Attach to an already-established byte stream (a tunnel fd).
    fn open_stream(&mut self, stream: UnixStream) -> Result<()>;

    /// Attach a secondary channel to its own byte stream (SPICE only; VNC
    /// engines may error).
    fn open_channel_stream(&mut self, channel_id: u64, stream: UnixStream) -> Result<()>;

    /// Store a credential and resume the handshake if the engine was waiting.
    fn set_credential(&mut self, kind: CredentialKind, value: &str) -> Result<()>;

    fn send_keys(&mut self, keys: &[String]) -> Result<()>;

    fn desktop_resolution(&self) -> Option<(u32, u32)>;

    fn scaling(&self) -> bool;
    fn set_scaling(&mut self, scaling: bool);

    fn resize_guest(&self) -> bool;
    fn set_resize_guest(&mut self, enabled: bool);

    fn has_usb_redirection(&self) -> bool;
    fn has_agent(&self) -> bool;

    /// Tear the engine down. Idempotent.
    fn shutdown(&mut self);
}

/// Builds engines for the viewer layer. The embedder registers one of these;
/// real implementations wrap gtk-vnc / spice-client style libraries.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        protocol: &GraphicsProtocol,
        events: UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn ProtocolEngine>>;
}
