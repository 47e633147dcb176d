//! Structured session events.
//!
//! Every security- or accounting-relevant event becomes a typed record
//! logged through `tracing` so downstream sinks can filter on fields.
//! Secret material never appears here.

use chrono::{DateTime, Utc};
use skua_core::TransferDirection;
use std::net::IpAddr;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum AuditEvent {
    ConnectionEstablished {
        session_id: Uuid,
        client_ip: IpAddr,
        timestamp: DateTime<Utc>,
    },
    ConnectionClosed {
        session_id: Uuid,
        username: Option<String>,
        duration_secs: i64,
    },
    AuthAttempt {
        session_id: Uuid,
        client_ip: IpAddr,
        username: String,
        success: bool,
        reason: Option<String>,
    },
    TransferStart {
        session_id: Uuid,
        username: String,
        direction: TransferDirection,
        path: String,
        offset: u64,
    },
    TransferEnd {
        session_id: Uuid,
        username: String,
        direction: TransferDirection,
        path: String,
        bytes: u64,
        duration_ms: u128,
        success: bool,
        error: Option<String>,
    },
    SiteCommand {
        session_id: Uuid,
        username: String,
        command: String,
        success: bool,
    },
    CommandError {
        session_id: Uuid,
        username: Option<String>,
        command: String,
        path: Option<String>,
        error: String,
    },
}

impl AuditEvent {
    pub fn log(&self) {
        match self {
            AuditEvent::ConnectionEstablished {
                session_id,
                client_ip,
                ..
            } => {
                info!(event = "connect", session = %session_id, client_ip = %client_ip,
                      "connection established");
            }
            AuditEvent::ConnectionClosed {
                session_id,
                username,
                duration_secs,
            } => {
                info!(event = "disconnect", session = %session_id, username = ?username,
                      duration_secs, "connection closed");
            }
            AuditEvent::AuthAttempt {
                session_id,
                client_ip,
                username,
                success,
                reason,
            } => {
                if *success {
                    info!(event = "auth_success", session = %session_id,
                          client_ip = %client_ip, username, "login");
                } else {
                    warn!(event = "auth_failure", session = %session_id,
                          client_ip = %client_ip, username, reason = ?reason, "login refused");
                }
            }
            AuditEvent::TransferStart {
                session_id,
                username,
                direction,
                path,
                offset,
            } => {
                info!(event = "transfer_start", session = %session_id, username,
                      direction = %direction, path, offset, "transfer opened");
            }
            AuditEvent::TransferEnd {
                session_id,
                username,
                direction,
                path,
                bytes,
                duration_ms,
                success,
                error,
            } => {
                if *success {
                    info!(event = "transfer_end", session = %session_id, username,
                          direction = %direction, path, bytes, duration_ms, "transfer complete");
                } else {
                    warn!(event = "transfer_failed", session = %session_id, username,
                          direction = %direction, path, bytes, duration_ms, error = ?error,
                          "transfer failed");
                }
            }
            AuditEvent::SiteCommand {
                session_id,
                username,
                command,
                success,
            } => {
                info!(event = "site_command", session = %session_id, username, command,
                      success, "site command");
            }
            AuditEvent::CommandError {
                session_id,
                username,
                command,
                path,
                error,
            } => {
                warn!(event = "command_error", session = %session_id, username = ?username,
                      command, path = ?path, error, "command failed");
            }
        }
    }
}
