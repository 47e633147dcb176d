//! Repository traits for user and group persistence.
//!
//! The FTP engine depends on these seams, not on a concrete backend. The
//! production implementation lives in `skua-db`; tests supply an in-memory
//! store.

use crate::error::Result;
use crate::types::{Group, GroupId, TransferDirection, User, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Template for creating a new user account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub primary_gid: GroupId,
    pub flags: String,
    pub default_ratio: i32,
    pub home_dir: String,
    pub password_salt: String,
    pub password_hash: String,
}

/// A single-field update, persisted atomically.
#[derive(Debug, Clone)]
pub enum UserField {
    Flags(String),
    Tagline(String),
    HomeDir(String),
    DefaultRatio(i32),
    SectionRatio(String, i32),
    WeeklyAllotmentKb(i64),
    Password { salt: String, hash: String },
    RequiresTls(bool),
    ExpiresAt(Option<DateTime<Utc>>),
    PrimaryGid(GroupId),
    AddSecondaryGid(GroupId),
    RemoveSecondaryGid(GroupId),
}

/// User persistence operations.
///
/// `name_of` and `id_of` are served from name↔id caches and must stay
/// consistent with each other for every live principal; an unknown id
/// resolves to the sentinel name rather than an error.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, new: NewUser) -> Result<User>;
    async fn user_by_id(&self, uid: UserId) -> Result<Option<User>>;
    async fn user_by_name(&self, name: &str) -> Result<Option<User>>;
    async fn delete_user(&self, uid: UserId) -> Result<()>;
    /// Users whose names match a shell glob (`*`, `?`).
    async fn users_matching(&self, glob: &str) -> Result<Vec<User>>;
    async fn save_field(&self, uid: UserId, field: UserField) -> Result<()>;

    /// Adjust a per-section credit balance by `delta_kb` and return the new
    /// balance. The adjustment is atomic in the backend.
    async fn adjust_credits(&self, uid: UserId, section: &str, delta_kb: i64) -> Result<i64>;
    async fn credits(&self, uid: UserId, section: &str) -> Result<i64>;

    async fn record_login(&self, uid: UserId, when: DateTime<Utc>) -> Result<()>;
    async fn add_transfer_stats(
        &self,
        uid: UserId,
        direction: TransferDirection,
        files: i64,
        kb: i64,
    ) -> Result<()>;

    /// Upload-history lookup for dupe checking. Returns the uploader name
    /// and time if `filename` was seen before.
    async fn dupe_lookup(&self, filename: &str) -> Result<Option<(String, DateTime<Utc>)>>;
    async fn dupe_record(&self, filename: &str, uploader: &str) -> Result<()>;

    /// Cached uid → name; sentinel "unknown" for ids that do not resolve.
    fn name_of(&self, uid: UserId) -> String;
    /// Cached name → uid.
    fn id_of(&self, name: &str) -> Option<UserId>;
}

/// Group persistence operations.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(&self, name: &str, description: &str) -> Result<Group>;
    async fn group_by_id(&self, gid: GroupId) -> Result<Option<Group>>;
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>>;
    async fn delete_group(&self, gid: GroupId) -> Result<()>;
    async fn list_groups(&self) -> Result<Vec<Group>>;
    /// Number of users with `gid` as primary / as a secondary group.
    async fn member_counts(&self, gid: GroupId) -> Result<(i64, i64)>;

    /// Cached gid → name; sentinel "unknown" for ids that do not resolve.
    fn group_name_of(&self, gid: GroupId) -> String;
    fn group_id_of(&self, name: &str) -> Option<GroupId>;
}
