//! SSH tunnel process management.
//!
//! A [`Tunnel`] is one forwarded byte pipe: an external ssh client running a
//! small `nc` relay on the remote host, its stdin/stdout wired to one half of
//! a socketpair. The other half is handed to the display engine immediately,
//! before the child is even up; early bytes queue in the kernel socket
//! buffer. A [`SshTunnels`] bundle owns every tunnel one viewer session
//! creates, plus the session's ticket on the process-wide prompt gate.

pub mod scheduler;

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::connection::ConnectionInfo;
use scheduler::{GateTicket, SpawnRequest, TunnelScheduler};

/// Build the ssh argv for a tunneled connection, or `None` when the
/// connection does not need (or cannot build) one.
///
/// The remote command probes whether the host's `nc` understands `-q`:
/// Debian and SUSE need `-q 0` so the relay exits on EOF, otherwise stale
/// relays make later connection attempts hang. Fedora's `nc` lacks the flag
/// and already behaves that way.
pub(crate) fn make_ssh_command(info: &ConnectionInfo, cfg: &SshConfig) -> Option<Vec<String>> {
    if !info.need_tunnel() {
        return None;
    }

    let (host, port) = info.tunnel_host();

    let mut argv = vec![cfg.binary.clone()];
    argv.extend(cfg.extra_flags.iter().cloned());
    if let Some(port) = port {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }
    if let Some(user) = info.username() {
        argv.push("-l".to_string());
        argv.push(user.to_string());
    }
    argv.push(host);

    let nc_params = match info.socket() {
        Some(path) => format!("-U {}", path.display()),
        None => {
            let (addr, port) = info.relay_target();
            let port = port.filter(|p| *p > 0)?;
            format!("{addr} {port}")
        }
    };
    let nc_cmd = format!(
        r#"nc -q 2>&1 | grep "requires an argument" >/dev/null; if [ $? -eq 0 ] ; then CMD="nc -q 0 {nc_params}"; else CMD="nc {nc_params}"; fi; eval "$CMD";"#
    );
    argv.push("sh -c".to_string());
    argv.push(format!("'{nc_cmd}'"));

    debug!(command = %argv.join(" "), "generated ssh tunnel command");
    Some(argv)
}

#[derive(Default)]
struct TunnelInner {
    child: Option<Child>,
    errfd: Option<StdUnixStream>,
    closed: bool,
}

/// One spawned (or about-to-be-spawned) relay process.
#[derive(Clone, Default)]
pub struct Tunnel {
    inner: Arc<Mutex<TunnelInner>>,
}

impl Tunnel {
    fn new(errfd: StdUnixStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TunnelInner {
                child: None,
                errfd: Some(errfd),
                closed: false,
            })),
        }
    }

    /// Runs on the scheduler worker thread, with the prompt gate held. The
    /// remote socket halves are consumed here either way; if the spawn fails
    /// the engine sees EOF on the data fd and the failure text shows up in
    /// [`Tunnel::err_output`].
    pub(crate) fn spawn(&self, argv: &[String], ssh_half: StdUnixStream, err_half: StdUnixStream) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let result = ssh_half
            .try_clone()
            .and_then(|stdin| Ok((stdin, err_half.try_clone()?)))
            .and_then(|(stdin, stderr)| {
                Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::from(OwnedFd::from(stdin)))
                    .stdout(Stdio::from(OwnedFd::from(ssh_half)))
                    .stderr(Stdio::from(OwnedFd::from(stderr)))
                    .spawn()
            });

        match result {
            Ok(child) => {
                debug!(pid = child.id(), "opened tunnel");
                inner.child = Some(child);
            }
            Err(err) => {
                warn!(binary = %argv[0], error = %err, "tunnel spawn failed");
                let mut err_half = err_half;
                let _ = err_half.write_all(format!("failed to spawn {}: {err}", argv[0]).as_bytes());
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Idempotent: kill the child, reap it, drop the local fds.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.errfd = None;
        if let Some(mut child) = inner.child.take() {
            debug!(pid = child.id(), "closing tunnel");
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Non-blocking drain of whatever the relay wrote to stderr so far.
    pub fn err_output(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        let mut out = String::new();
        let Some(errfd) = inner.errfd.as_mut() else {
            return out;
        };
        let mut buf = [0u8; 1024];
        loop {
            match errfd.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}

/// The tunnel bundle for one viewer session: every channel that needed a
/// forwarded fd gets its own [`Tunnel`], all sharing one gate ticket.
pub struct SshTunnels {
    scheduler: Arc<TunnelScheduler>,
    ticket: Arc<GateTicket>,
    command: Option<Vec<String>>,
    tunnels: Mutex<Vec<Tunnel>>,
}

impl SshTunnels {
    pub fn new(scheduler: Arc<TunnelScheduler>, info: &ConnectionInfo, ssh: &SshConfig) -> Self {
        let command = make_ssh_command(info, ssh);
        Self {
            ticket: scheduler.ticket(),
            scheduler,
            command,
            tunnels: Mutex::new(Vec::new()),
        }
    }

    /// Bundle with an arbitrary relay argv, bypassing ssh command generation.
    #[cfg(test)]
    pub(crate) fn from_command(scheduler: Arc<TunnelScheduler>, command: Vec<String>) -> Self {
        Self {
            ticket: scheduler.ticket(),
            scheduler,
            command: Some(command),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    /// Queue a new tunnel spawn and hand back the viewer half of the data
    /// socketpair immediately. The caller may read/write right away; bytes
    /// queue until the relay is up.
    pub fn open_new(&self) -> io::Result<UnixStream> {
        let argv = self.command.clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "no tunnel command available for this connection",
            )
        })?;

        let (viewer_half, ssh_half) = StdUnixStream::pair()?;
        let (err_local, err_remote) = StdUnixStream::pair()?;
        err_local.set_nonblocking(true)?;

        let tunnel = Tunnel::new(err_local);
        self.tunnels.lock().unwrap().push(tunnel.clone());
        self.scheduler.enqueue(SpawnRequest {
            tunnel,
            ticket: self.ticket.clone(),
            argv,
            ssh_half,
            err_half: err_remote,
        });

        viewer_half.set_nonblocking(true)?;
        UnixStream::from_std(viewer_half)
    }

    /// Release the session's hold on the prompt gate. Safe to call any
    /// number of times; only the first call after an acquire does anything.
    pub fn unlock(&self) {
        self.ticket.release();
    }

    /// Close every tunnel and release the gate.
    pub fn close_all(&self) {
        let tunnels = std::mem::take(&mut *self.tunnels.lock().unwrap());
        for tunnel in tunnels {
            tunnel.close();
        }
        self.unlock();
    }

    /// De-duplicated stderr from every tunnel, for disconnect reports.
    pub fn err_output(&self) -> String {
        let mut outputs: Vec<String> = Vec::new();
        for tunnel in self.tunnels.lock().unwrap().iter() {
            let text = tunnel.err_output().trim().to_string();
            if !text.is_empty() && !outputs.contains(&text) {
                outputs.push(text);
            }
        }
        outputs.join("\n")
    }
}

impl Drop for SshTunnels {
    fn drop(&mut self) {
        self.close_all();
    }
}
