//! Error taxonomy for the transport core.
//!
//! Mirrors the failure taxonomy table: transient network, protocol
//! violation, authentication, resource exhaustion, media decode, file
//! transfer, and fatal errors each carry distinct recovery policy at the
//! call site (retry, drop-and-continue, close-with-code, abort-transfer).

use thiserror::Error;

/// Errors surfaced by the core transport and media pipelines.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A network operation (STUN probe, WebSocket, UDP send) timed out or
    /// was refused. Recoverable by local retry/backoff.
    #[error("transient network error: {0}")]
    Network(String),

    /// A received message violated the wire protocol (bad magic, unknown
    /// type, malformed JSON). The offending message should be dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Authentication against the directory service or a session handshake
    /// failed. Callers close the session with code 4001 and must re-login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A resource limit was hit (e.g. `ws_max_connections`).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A decode error in the media pipeline. Counted per-decoder; never
    /// propagated to session close.
    #[error("media decode error: {0}")]
    Decode(String),

    /// A file transfer failed (size mismatch, disk full). Aborts the
    /// current transfer only; the session stays alive.
    #[error("file transfer error: {0}")]
    FileTransfer(String),

    /// Unrecoverable condition (capture source gone, encoder pool empty).
    /// Closes the affected session(s); agent-wide only when capture cannot
    /// be re-initialized.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the core crate.
pub type CoreResult<T> = Result<T, CoreError>;
