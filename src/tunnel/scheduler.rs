//! Process-wide serialization of tunnel spawns.
//!
//! Opening an SSH tunnel may pop an interactive password prompt. If several
//! console sessions open concurrently, racing prompts confuse both the user
//! and ssh-askpass, so every spawn in the process funnels through one FIFO
//! queue, one worker thread, and one gate. The gate is acquired by the worker
//! just before fork/exec and is released only when the owning viewer sees the
//! first engine activity (or a terminal error) on that tunnel — not when the
//! spawn call returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use tracing::debug;

use super::Tunnel;

/// The single prompt gate. Acquired and released on different threads, so it
/// cannot be a plain `Mutex` guard.
pub(crate) struct PromptGate {
    held: Mutex<bool>,
    cv: Condvar,
}

impl PromptGate {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap();
        *held = false;
        self.cv.notify_one();
    }
}

/// One viewer-side handle on the gate. `release` is idempotent; the worker
/// marks the ticket held when it acquires on the bundle's behalf.
pub(crate) struct GateTicket {
    gate: Arc<PromptGate>,
    held: AtomicBool,
}

impl GateTicket {
    pub(crate) fn acquire(&self) {
        self.gate.acquire();
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.gate.release();
        }
    }
}

pub(crate) struct SpawnRequest {
    pub tunnel: Tunnel,
    pub ticket: Arc<GateTicket>,
    pub argv: Vec<String>,
    pub ssh_half: std::os::unix::net::UnixStream,
    pub err_half: std::os::unix::net::UnixStream,
}

/// Queue + worker thread + gate. Construct one per process and pass it by
/// `Arc` to every viewer; every session is meant to contend on the same
/// instance.
pub struct TunnelScheduler {
    tx: Sender<SpawnRequest>,
    gate: Arc<PromptGate>,
}

impl TunnelScheduler {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded::<SpawnRequest>();
        let gate = Arc::new(PromptGate::new());

        thread::Builder::new()
            .name("tunnel-scheduler".to_string())
            .spawn(move || {
                // Strict FIFO: one request at a time, gate held across the
                // whole spawn.
                for req in rx.iter() {
                    req.ticket.acquire();
                    if req.tunnel.is_closed() {
                        // The session closed while this request was queued.
                        // No viewer will ever observe the tunnel, so the
                        // gate must be released here or every later spawn
                        // starves behind it.
                        debug!("dropping spawn request for closed tunnel");
                        req.ticket.release();
                        continue;
                    }
                    req.tunnel.spawn(&req.argv, req.ssh_half, req.err_half);
                }
                debug!("tunnel scheduler worker exiting");
            })
            .expect("failed to spawn tunnel scheduler thread");

        Arc::new(Self { tx, gate })
    }

    pub(crate) fn ticket(&self) -> Arc<GateTicket> {
        Arc::new(GateTicket {
            gate: self.gate.clone(),
            held: AtomicBool::new(false),
        })
    }

    pub(crate) fn enqueue(&self, request: SpawnRequest) {
        // The worker lives as long as this scheduler, so the send can only
        // fail during teardown; the tunnel then just reads EOF.
        let _ = self.tx.send(request);
    }
}
