//! Error types for the FTP engine.
//!
//! Per-command errors map to the nearest three-digit reply and leave the
//! session intact; only control-channel I/O failures tear a session down.

use skua_core::StoreError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error kinds.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command or command issued in the wrong session state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// ACL evaluation denied the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A path escaped the site root after normalization.
    #[error("path escapes site root: {0}")]
    PathEscape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Credits or disk exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transfer cancelled by ABOR or connection loss.
    #[error("transfer aborted after {bytes_done} bytes")]
    TransferAborted { bytes_done: u64 },

    /// Data-connection peer did not match and FXP is not allowed.
    #[error("possible FXP denied: peer {0}")]
    PeerMismatch(String),

    /// The data channel could not be established (no plan, port range
    /// exhausted, accept window elapsed).
    #[error("can't open data connection: {0}")]
    DataChannel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Load-time configuration failure.
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Nearest FTP reply code for this error when it fails a command.
    pub fn reply_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 500,
            Error::PermissionDenied(_) => 550,
            Error::PathEscape(_) => 550,
            Error::NotFound(_) => 550,
            Error::AlreadyExists(_) => 553,
            Error::QuotaExceeded(_) => 552,
            Error::TransferAborted { .. } => 426,
            Error::PeerMismatch(_) => 425,
            Error::DataChannel(_) => 425,
            Error::Io(_) => 451,
            Error::Config(_) => 421,
            Error::Store(_) => 451,
        }
    }

    /// Message safe to put on the wire. Path-escape details stay in the log.
    pub fn client_message(&self) -> String {
        match self {
            Error::PathEscape(_) => "Permission denied.".to_string(),
            Error::PermissionDenied(_) => "Permission denied.".to_string(),
            Error::NotFound(p) => format!("{}: No such file or directory.", p),
            Error::AlreadyExists(p) => format!("{}: File exists.", p),
            Error::QuotaExceeded(_) => "Insufficient credits.".to_string(),
            Error::TransferAborted { .. } => "Transfer aborted.".to_string(),
            Error::PeerMismatch(_) => "Possible FXP denied.".to_string(),
            Error::DataChannel(msg) => format!("Can't open data connection: {}.", msg),
            Error::Io(_) | Error::Store(_) => "Local error in processing.".to_string(),
            other => other.to_string(),
        }
    }

    /// True when the session can continue after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}
