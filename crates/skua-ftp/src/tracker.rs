//! Session tracking.
//!
//! One record per live control connection, used for SITE WHO, per-user
//! login limits, and simultaneous-transfer caps.

use chrono::{DateTime, Utc};
use skua_core::UserId;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub peer_ip: IpAddr,
    pub connected_at: DateTime<Utc>,
    pub uid: Option<UserId>,
    pub username: Option<String>,
    pub current_command: String,
    pub transferring: Option<skua_core::TransferDirection>,
}

/// Registry of live sessions behind one lock.
#[derive(Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<Uuid, SessionInfo>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: Uuid, peer_ip: IpAddr) {
        self.sessions.lock().unwrap().insert(
            session_id,
            SessionInfo {
                session_id,
                peer_ip,
                connected_at: Utc::now(),
                uid: None,
                username: None,
                current_command: "IDLE".to_string(),
                transferring: None,
            },
        );
    }

    pub fn unregister(&self, session_id: &Uuid) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn set_user(&self, session_id: &Uuid, uid: UserId, username: &str) {
        if let Some(info) = self.sessions.lock().unwrap().get_mut(session_id) {
            info.uid = Some(uid);
            info.username = Some(username.to_string());
        }
    }

    pub fn set_command(&self, session_id: &Uuid, command: &str) {
        if let Some(info) = self.sessions.lock().unwrap().get_mut(session_id) {
            info.current_command = command.to_string();
        }
    }

    pub fn set_transferring(
        &self,
        session_id: &Uuid,
        direction: Option<skua_core::TransferDirection>,
    ) {
        if let Some(info) = self.sessions.lock().unwrap().get_mut(session_id) {
            info.transferring = direction;
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub fn logins_for(&self, uid: UserId) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.uid == Some(uid))
            .count()
    }

    /// Concurrent transfers in one direction across all of a user's
    /// sessions, for `sim_xfers` enforcement.
    pub fn transfers_for(&self, uid: UserId, direction: skua_core::TransferDirection) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.uid == Some(uid) && s.transferring == Some(direction))
            .count()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
