//! Session validation against an external single-sign-on authority.
//!
//! The gateway only needs two things from the authority: a verdict for a
//! session identifier, and a way to release the connection at shutdown.

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Duration;

/// Errors that can occur while talking to the session authority.
///
/// Every variant means "no verdict could be produced"; an invalid session is
/// reported as `Ok(false)`, never as an error.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// The daemon could not be reached.
    #[error("unable to connect to session daemon at {addr}: {reason}")]
    Connect { addr: String, reason: String },
    /// The connection failed mid-exchange.
    #[error("session daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The daemon did not answer within the configured budget.
    #[error("session daemon did not respond within {0:?}")]
    Timeout(Duration),
    /// The daemon sent something that is not a valid reply line.
    #[error("unexpected reply from session daemon: {0}")]
    Protocol(String),
    /// The daemon answered with a server-side failure.
    #[error("session daemon reported an error: {0}")]
    Daemon(String),
    /// The connection was released and can no longer be used.
    #[error("session validator has been closed")]
    Closed,
}

/// Connection to the authority that decides whether a session is valid.
///
/// Implementations must tolerate concurrent `validate` calls. `close` is called
/// exactly once, by whoever owns the process lifecycle.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Ask the authority whether `session_id` is currently valid. Results are
    /// never cached.
    async fn validate(&self, session_id: &str) -> Result<bool, ValidatorError>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), ValidatorError>;
}

#[cfg(feature = "cosign")]
mod cosign;

#[cfg(feature = "cosign")]
pub use cosign::{CosignClient, CosignConfig};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::MockValidator;
