//! Connection-topology resolution for a guest's graphical console.
//!
//! [`ConnectionInfo`] is an immutable snapshot of "how do we reach this
//! guest's display server", built per connection attempt from the graphics
//! device descriptor and the hypervisor connection descriptor. Everything on
//! it is a pure decision function; no I/O happens here.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

/// Graphics protocol carried by a guest display device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphicsProtocol {
    Vnc,
    Spice,
    /// Anything else libvirt can configure (sdl, egl-headless, ...). The
    /// controller cannot render these and reports them as unsupported.
    Other(String),
}

impl GraphicsProtocol {
    pub fn as_str(&self) -> &str {
        match self {
            GraphicsProtocol::Vnc => "vnc",
            GraphicsProtocol::Spice => "spice",
            GraphicsProtocol::Other(name) => name,
        }
    }

    /// True for the protocols a viewer implementation exists for.
    pub fn is_renderable(&self) -> bool {
        matches!(self, GraphicsProtocol::Vnc | GraphicsProtocol::Spice)
    }
}

impl fmt::Display for GraphicsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the hypervisor connection itself is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Plain local or TCP connection.
    Direct,
    /// TLS-authenticated remote connection. Cannot carry a forwarded stream.
    Tls,
    /// SSH login transport; can relay arbitrary byte streams.
    Ssh,
    /// External command transport (qemu+ext://); login-capable like ssh.
    Ext,
}

impl Transport {
    /// Whether this transport can carry a forwarded console stream.
    pub fn can_tunnel(self) -> bool {
        matches!(self, Transport::Ssh | Transport::Ext)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Direct => "direct",
            Transport::Tls => "tls",
            Transport::Ssh => "ssh",
            Transport::Ext => "ext",
        }
    }
}

/// The `listen` type configured on the graphics device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenType {
    Address,
    Network,
    Socket,
    /// Explicitly fd-only: the server never binds an address or socket path.
    None,
}

/// Graphics device descriptor, as supplied by the device/XML layer.
///
/// Port values follow libvirt semantics: `Some(-1)` means autoport is still
/// pending assignment and counts as "not bound yet".
#[derive(Clone, Debug, Default)]
pub struct GraphicsDescriptor {
    pub protocol: Option<GraphicsProtocol>,
    pub port: Option<i32>,
    pub tlsport: Option<i32>,
    pub listen: Option<String>,
    pub socket: Option<PathBuf>,
    pub autoport: bool,
    pub listen_type: Option<ListenType>,
}

/// Hypervisor connection descriptor, as supplied by the connection layer.
#[derive(Clone, Debug)]
pub struct ConnectDescriptor {
    pub transport: Transport,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
}

impl Default for ConnectDescriptor {
    fn default() -> Self {
        Self {
            transport: Transport::Direct,
            host: "127.0.0.1".to_string(),
            port: None,
            username: None,
        }
    }
}

/// Everything needed to decide how to reach one graphical console.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    protocol: Option<GraphicsProtocol>,
    port: Option<i32>,
    tlsport: Option<i32>,
    listen: String,
    socket: Option<PathBuf>,
    listen_type: Option<ListenType>,
    transport: Transport,
    conn_host: String,
    conn_port: Option<u16>,
    conn_username: Option<String>,
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.parse().ok()
}

fn is_loopback_addr(value: &str) -> bool {
    parse_ip(value).is_some_and(|ip| ip.is_loopback())
}

fn is_unspecified_addr(value: &str) -> bool {
    parse_ip(value).is_some_and(|ip| ip.is_unspecified())
}

/// A port value that the display server has actually bound. Autoport leaves
/// `-1` in place until libvirt assigns a real port.
fn port_bound(port: Option<i32>) -> bool {
    port.is_some_and(|p| p > 0)
}

impl ConnectionInfo {
    pub fn new(conn: &ConnectDescriptor, gdev: &GraphicsDescriptor) -> Self {
        let mut conn_host = if conn.host.is_empty() {
            "localhost".to_string()
        } else {
            conn.host.clone()
        };
        if conn_host == "localhost" {
            conn_host = "127.0.0.1".to_string();
        }

        Self {
            protocol: gdev.protocol.clone(),
            port: gdev.port,
            tlsport: gdev.tlsport,
            listen: gdev
                .listen
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            socket: gdev.socket.clone(),
            listen_type: gdev.listen_type,
            transport: conn.transport,
            conn_host,
            conn_port: conn.port,
            conn_username: conn.username.clone(),
        }
    }

    pub fn protocol(&self) -> Option<&GraphicsProtocol> {
        self.protocol.as_ref()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn username(&self) -> Option<&str> {
        self.conn_username.as_deref()
    }

    pub fn socket(&self) -> Option<&PathBuf> {
        self.socket.as_ref()
    }

    fn is_listen_localhost(&self) -> bool {
        is_loopback_addr(&self.listen)
    }

    fn is_listen_any(&self) -> bool {
        is_unspecified_addr(&self.listen)
    }

    fn is_listen_none(&self) -> bool {
        if self.listen_type == Some(ListenType::None) {
            return true;
        }
        self.socket.is_none() && self.port.is_none() && self.tlsport.is_none()
    }

    fn is_conn_host_local(&self) -> bool {
        is_loopback_addr(&self.conn_host)
    }

    fn is_remote_transport(&self) -> bool {
        !self.is_conn_host_local() || matches!(self.transport, Transport::Ssh | Transport::Tls)
    }

    /// True iff the display server is only reachable through a forwarded
    /// stream: it listens on the remote host's loopback and the transport is
    /// login-capable.
    pub fn need_tunnel(&self) -> bool {
        self.is_listen_localhost() && self.transport.can_tunnel()
    }

    /// True iff the display server is provably unreachable: loopback-only
    /// listen, a transport that cannot relay (direct/tls), and a connection
    /// host that is not this machine.
    pub fn is_bad_localhost(&self) -> bool {
        !self.transport.can_tunnel() && self.is_listen_localhost() && !self.is_conn_host_local()
    }

    /// Configuration errors that no amount of retrying will fix. Returns a
    /// human-readable reason, or `None` when the configuration is viable.
    pub fn bad_config(&self) -> Option<String> {
        if self.is_remote_transport() && self.is_listen_none() {
            return Some(
                "Guest is on a remote host, but is only configured to allow \
                 local file descriptor connections."
                    .to_string(),
            );
        }

        if self.need_tunnel() && self.tlsport.is_some() && self.port.is_none() {
            return Some(
                "Guest is configured for TLS only, which does not work over an \
                 SSH tunnel."
                    .to_string(),
            );
        }

        if self.is_bad_localhost() {
            return Some(format!(
                "Guest is on a remote host with transport '{}' but is only \
                 configured to listen locally. To connect remotely you will \
                 need to change the guest's listen address.",
                self.transport.as_str()
            ));
        }

        None
    }

    /// Host/port/tlsport for a direct connection to the display server. When
    /// the server listens on "any", the hypervisor connection host is the
    /// address that actually reaches it.
    pub fn get_conn_host(&self) -> (String, Option<u16>, Option<u16>) {
        let host = if self.is_listen_any() {
            self.conn_host.clone()
        } else {
            self.listen.clone()
        };
        (host, to_dial_port(self.port), to_dial_port(self.tlsport))
    }

    /// Physical host/port the SSH relay logs into.
    pub fn tunnel_host(&self) -> (String, Option<u16>) {
        (self.conn_host.clone(), self.conn_port)
    }

    /// Whether the display server has bound a socket yet. False during early
    /// boot while autoport is still pending; that means "retry later", not
    /// "error".
    pub fn console_active(&self) -> bool {
        if self.socket.is_some() {
            return true;
        }
        port_bound(self.port) || port_bound(self.tlsport)
    }

    /// Graphics-side target for the remote relay command.
    pub(crate) fn relay_target(&self) -> (String, Option<i32>) {
        (self.listen.clone(), self.port)
    }
}

fn to_dial_port(port: Option<i32>) -> Option<u16> {
    port.filter(|p| *p > 0).and_then(|p| u16::try_from(p).ok())
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto={} trans={} connhost={} connuser={} connport={} \
             listen={} port={} tlsport={} socket={}",
            self.protocol.as_ref().map_or("-", |p| p.as_str()),
            self.transport.as_str(),
            self.conn_host,
            self.conn_username.as_deref().unwrap_or("-"),
            self.conn_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            self.listen,
            self.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            self.tlsport
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            self.socket
                .as_ref()
                .map_or_else(|| "-".to_string(), |s| s.display().to_string()),
        )
    }
}
