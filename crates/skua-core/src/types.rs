use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Monotonic integer user id, allocated by the repository.
pub type UserId = i32;

/// Integer group id, allocated by the repository.
pub type GroupId = i32;

/// Name reported for ids that no longer resolve.
pub const UNKNOWN_NAME: &str = "unknown";

/// Name of the implicit section that catches paths no configured section
/// claims.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Single-character capability flags carried in a user's flag string.
pub mod flag {
    /// Site operator: full administrative access.
    pub const SITEOP: char = '1';
    /// Group administrator: may manage users within own groups.
    pub const GADMIN: char = '2';
    /// Ordinary user.
    pub const USER: char = '3';
}

/// A user account.
///
/// Credits are kept in kilobyte units as signed 64-bit integers; a negative
/// balance means the user is indebted. `section_ratios` holds per-section
/// overrides where `-1` means "inherit" and `0` means leech.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: UserId,
    pub name: String,
    pub primary_gid: GroupId,
    pub secondary_gids: Vec<GroupId>,
    pub flags: String,
    pub default_ratio: i32,
    pub section_ratios: HashMap<String, i32>,
    /// Per-section credit balances in kilobytes, keyed by section name.
    /// Sections without separate credits share the [`DEFAULT_SECTION`] entry.
    pub credits_kb: HashMap<String, i64>,
    pub weekly_allotment_kb: i64,
    /// Virtual home directory.
    pub home_dir: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub tagline: String,
    pub uploaded_files: i64,
    pub uploaded_kb: i64,
    pub downloaded_files: i64,
    pub downloaded_kb: i64,
    pub password_salt: String,
    pub password_hash: String,
    pub requires_tls: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn has_flag(&self, f: char) -> bool {
        self.flags.contains(f)
    }

    pub fn is_siteop(&self) -> bool {
        self.has_flag(flag::SITEOP)
    }

    /// The principal context used for every ACL evaluation on this user's
    /// behalf.
    pub fn principal(&self) -> Principal {
        Principal {
            uid: self.uid,
            name: self.name.clone(),
            primary_gid: self.primary_gid,
            gids: std::iter::once(self.primary_gid)
                .chain(self.secondary_gids.iter().copied())
                .collect(),
            flags: self.flags.clone(),
        }
    }

    /// Effective ratio for a section: per-section override unless it says
    /// inherit, otherwise the caller-supplied section ratio, otherwise the
    /// user default. `0` is leech.
    pub fn effective_ratio(&self, section: &str, section_ratio: Option<i32>) -> i32 {
        match self.section_ratios.get(section) {
            Some(r) if *r >= 0 => *r,
            _ => section_ratio.unwrap_or(self.default_ratio),
        }
    }
}

/// A user group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub gid: GroupId,
    pub name: String,
    pub description: String,
    pub comment: String,
    /// Total seats in the group.
    pub slots: i32,
    pub leech_slots: i32,
    pub allotment_slots: i32,
    pub max_allotment_kb: i64,
    pub max_logins: i32,
}

/// Derived per-request identity: the input to every ACL evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: UserId,
    pub name: String,
    pub primary_gid: GroupId,
    /// Primary gid first, then secondaries.
    pub gids: Vec<GroupId>,
    pub flags: String,
}

impl Principal {
    pub fn has_flag(&self, f: char) -> bool {
        self.flags.contains(f)
    }

    pub fn is_siteop(&self) -> bool {
        self.has_flag(flag::SITEOP)
    }

    pub fn in_group(&self, gid: GroupId) -> bool {
        self.gids.contains(&gid)
    }
}

/// Ownership record attached to a filesystem entry via the per-directory
/// sidecar. Missing entries resolve to [`Owner::unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: UserId,
    pub gid: GroupId,
}

impl Owner {
    pub fn new(uid: UserId, gid: GroupId) -> Self {
        Self { uid, gid }
    }

    pub fn unknown() -> Self {
        Self { uid: -1, gid: -1 }
    }

    pub fn is_unknown(&self) -> bool {
        self.uid < 0
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Direction of a data transfer, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Client to server (STOR, STOU, APPE).
    Upload,
    /// Server to client (RETR).
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}
