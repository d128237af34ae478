use std::env;
#[cfg(test)]
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::console::retry::RetryPolicy;

static DEFAULT_SSH_BINARY: Lazy<String> =
    Lazy::new(|| env::var("VIRTCONSOLE_SSH").unwrap_or_else(|_| "ssh".to_string()));

/// How the external ssh client is invoked for tunnels.
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// The ssh binary name or path (default "ssh", override `VIRTCONSOLE_SSH`).
    pub binary: String,
    /// Extra flags inserted before the target host, e.g. `-o BatchMode=yes`.
    pub extra_flags: Vec<String>,
}

impl SshConfig {
    pub fn from_env() -> Self {
        let extra_flags = env::var("VIRTCONSOLE_SSH_FLAGS")
            .map(|raw| {
                raw.split_whitespace()
                    .map(|flag| flag.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            binary: DEFAULT_SSH_BINARY.clone(),
            extra_flags,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            extra_flags: Vec::new(),
        }
    }
}

/// Per-session knobs for the console controller.
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub ssh: SshConfig,
    pub retry: RetryPolicy,
    /// Connect automatically when the guest starts running. When false the
    /// UI must call `connect()` explicitly.
    pub autoconnect: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            retry: RetryPolicy::default(),
            autoconnect: true,
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Self {
        Self {
            ssh: SshConfig::from_env(),
            retry: RetryPolicy::default(),
            autoconnect: true,
        }
    }
}
