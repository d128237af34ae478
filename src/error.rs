use std::io;
use thiserror::Error;

/// Error taxonomy for console connection handling.
///
/// The controller only cares about one bit per variant: is this worth
/// retrying. Configuration problems are shown immediately and never retried;
/// transient problems go through the backoff machine; auth problems reprompt
/// without consuming a retry slot.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Bad guest/connection configuration (loopback-only listen on a remote
    /// host, unsupported protocol, ...). Fatal, never retried.
    #[error("{0}")]
    Configuration(String),

    /// The display server is not reachable right now but may become so
    /// (not listening yet, transport hiccup, tunnel died).
    #[error("{0}")]
    Transient(String),

    /// The display server rejected our credentials.
    #[error("authentication failed: {message}")]
    Auth { message: String, retryable: bool },

    /// The tunnel subprocess failed to spawn or crashed. Treated like a
    /// transient connect error, with captured stderr attached.
    #[error("tunnel process failed: {0}")]
    Process(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ConsoleError {
    /// Whether the retry/backoff machine should handle this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsoleError::Transient(_) | ConsoleError::Process(_) | ConsoleError::Io(_)
        )
    }
}
