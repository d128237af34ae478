//! Connection brokering for virtual machine graphical consoles.
//!
//! Given a hypervisor connection and a guest's graphics device, this crate
//! works out how to reach the display server (directly, or through SSH
//! tunnels spun up on demand), drives a VNC or SPICE engine through the
//! attempt, and keeps the session alive across guest restarts with capped
//! exponential backoff. The protocol engines themselves are supplied by the
//! embedder through [`viewer::engine::EngineFactory`].

pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod logging;
pub mod tunnel;
pub mod viewer;
pub mod vm;

pub use config::{ConsoleConfig, SshConfig};
pub use connection::{
    ConnectDescriptor, ConnectionInfo, GraphicsDescriptor, GraphicsProtocol, ListenType, Transport,
};
pub use console::{ConsoleEvent, ConsoleSessionController, ConsoleState, retry::RetryPolicy};
pub use error::ConsoleError;
pub use tunnel::{SshTunnels, scheduler::TunnelScheduler};
pub use viewer::{Viewer, ViewerEvent, ViewerKind};
pub use vm::{VmHandle, VmRunState};
