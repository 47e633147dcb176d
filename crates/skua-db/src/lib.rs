//! PostgreSQL-backed user and group repository.
//!
//! Implements the `skua_core` store traits over a connection pool, with
//! name↔id caches kept behind per-map locks. Multi-map updates always take
//! the id-keyed lock before the name-keyed lock so concurrent refreshes
//! cannot deadlock. Caches converge across distributed daemons by periodic
//! polling (`spawn_cache_refresh`).

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skua_core::{
    Group, GroupId, GroupStore, NewUser, StoreError, TransferDirection, User, UserField, UserId,
    UserStore, UNKNOWN_NAME,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, StoreError>;

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Repository over a PostgreSQL pool.
pub struct Database {
    pool: PgPool,
    users_by_id: RwLock<HashMap<UserId, String>>,
    users_by_name: RwLock<HashMap<String, UserId>>,
    groups_by_id: RwLock<HashMap<GroupId, String>>,
    groups_by_name: RwLock<HashMap<String, GroupId>>,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(backend)?;

        let db = Arc::new(Self {
            pool,
            users_by_id: RwLock::new(HashMap::new()),
            users_by_name: RwLock::new(HashMap::new()),
            groups_by_id: RwLock::new(HashMap::new()),
            groups_by_name: RwLock::new(HashMap::new()),
        });
        db.run_migrations().await?;
        db.refresh_caches().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS id_sequences (
                kind TEXT PRIMARY KEY,
                next INT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "INSERT INTO id_sequences (kind, next) VALUES ('uid', 1), ('gid', 1)
             ON CONFLICT (kind) DO NOTHING",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uid INT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                primary_gid INT NOT NULL,
                secondary_gids INT[] NOT NULL DEFAULT '{}',
                flags TEXT NOT NULL,
                default_ratio INT NOT NULL,
                weekly_allotment_kb BIGINT NOT NULL DEFAULT 0,
                home_dir TEXT NOT NULL,
                expires_at TIMESTAMPTZ,
                tagline TEXT NOT NULL DEFAULT '',
                uploaded_files BIGINT NOT NULL DEFAULT 0,
                uploaded_kb BIGINT NOT NULL DEFAULT 0,
                downloaded_files BIGINT NOT NULL DEFAULT 0,
                downloaded_kb BIGINT NOT NULL DEFAULT 0,
                password_salt TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                requires_tls BOOLEAN NOT NULL DEFAULT FALSE,
                last_login TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        // Per-(user, section) ratio overrides and credit balances. Ratio -1
        // means inherit.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sections (
                uid INT NOT NULL REFERENCES users(uid) ON DELETE CASCADE,
                section TEXT NOT NULL,
                ratio INT NOT NULL DEFAULT -1,
                credits_kb BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (uid, section)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                gid INT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                slots INT NOT NULL DEFAULT 0,
                leech_slots INT NOT NULL DEFAULT 0,
                allotment_slots INT NOT NULL DEFAULT 0,
                max_allotment_kb BIGINT NOT NULL DEFAULT 0,
                max_logins INT NOT NULL DEFAULT -1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dupe_log (
                filename TEXT PRIMARY KEY,
                uploader TEXT NOT NULL,
                uploaded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn next_id(&self, kind: &str) -> Result<i32> {
        let (id,): (i32,) =
            sqlx::query_as("UPDATE id_sequences SET next = next + 1 WHERE kind = $1 RETURNING next - 1")
                .bind(kind)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok(id)
    }

    /// Rebuild both name↔id caches from the backing store.
    pub async fn refresh_caches(&self) -> Result<()> {
        let users: Vec<(i32, String)> = sqlx::query_as("SELECT uid, name FROM users")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let groups: Vec<(i32, String)> = sqlx::query_as("SELECT gid, name FROM groups")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        {
            let mut by_id = self.users_by_id.write().unwrap();
            let mut by_name = self.users_by_name.write().unwrap();
            by_id.clear();
            by_name.clear();
            for (uid, name) in users {
                by_id.insert(uid, name.clone());
                by_name.insert(name, uid);
            }
        }
        {
            let mut by_id = self.groups_by_id.write().unwrap();
            let mut by_name = self.groups_by_name.write().unwrap();
            by_id.clear();
            by_name.clear();
            for (gid, name) in groups {
                by_id.insert(gid, name.clone());
                by_name.insert(name, gid);
            }
        }
        debug!("name/id caches refreshed");
        Ok(())
    }

    /// Poll the store so caches converge when other daemons mutate it.
    pub fn spawn_cache_refresh(self: &Arc<Self>, interval: Duration) {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if let Err(e) = db.refresh_caches().await {
                    warn!("cache refresh failed: {}", e);
                }
            }
        });
    }

    fn cache_user(&self, uid: UserId, name: &str) {
        let mut by_id = self.users_by_id.write().unwrap();
        let mut by_name = self.users_by_name.write().unwrap();
        by_id.insert(uid, name.to_string());
        by_name.insert(name.to_string(), uid);
    }

    fn uncache_user(&self, uid: UserId) {
        let mut by_id = self.users_by_id.write().unwrap();
        let mut by_name = self.users_by_name.write().unwrap();
        if let Some(name) = by_id.remove(&uid) {
            by_name.remove(&name);
        }
    }

    fn cache_group(&self, gid: GroupId, name: &str) {
        let mut by_id = self.groups_by_id.write().unwrap();
        let mut by_name = self.groups_by_name.write().unwrap();
        by_id.insert(gid, name.to_string());
        by_name.insert(name.to_string(), gid);
    }

    fn uncache_group(&self, gid: GroupId) {
        let mut by_id = self.groups_by_id.write().unwrap();
        let mut by_name = self.groups_by_name.write().unwrap();
        if let Some(name) = by_id.remove(&gid) {
            by_name.remove(&name);
        }
    }

    async fn load_sections(&self, uid: UserId) -> Result<(HashMap<String, i32>, HashMap<String, i64>)> {
        let rows: Vec<(String, i32, i64)> =
            sqlx::query_as("SELECT section, ratio, credits_kb FROM user_sections WHERE uid = $1")
                .bind(uid)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut ratios = HashMap::new();
        let mut credits = HashMap::new();
        for (section, ratio, kb) in rows {
            if ratio >= 0 {
                ratios.insert(section.clone(), ratio);
            }
            credits.insert(section, kb);
        }
        Ok((ratios, credits))
    }

    async fn hydrate(&self, row: UserRow) -> Result<User> {
        let (section_ratios, credits_kb) = self.load_sections(row.uid).await?;
        Ok(User {
            uid: row.uid,
            name: row.name,
            primary_gid: row.primary_gid,
            secondary_gids: row.secondary_gids,
            flags: row.flags,
            default_ratio: row.default_ratio,
            section_ratios,
            credits_kb,
            weekly_allotment_kb: row.weekly_allotment_kb,
            home_dir: row.home_dir,
            expires_at: row.expires_at,
            tagline: row.tagline,
            uploaded_files: row.uploaded_files,
            uploaded_kb: row.uploaded_kb,
            downloaded_files: row.downloaded_files,
            downloaded_kb: row.downloaded_kb,
            password_salt: row.password_salt,
            password_hash: row.password_hash,
            requires_tls: row.requires_tls,
            last_login: row.last_login,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl UserStore for Database {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        if self.user_by_name(&new.name).await?.is_some() {
            return Err(StoreError::AlreadyExists(new.name));
        }
        let uid = self.next_id("uid").await?;
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO users
                (uid, name, primary_gid, flags, default_ratio, home_dir,
                 password_salt, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(uid)
        .bind(&new.name)
        .bind(new.primary_gid)
        .bind(&new.flags)
        .bind(new.default_ratio)
        .bind(&new.home_dir)
        .bind(&new.password_salt)
        .bind(&new.password_hash)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.cache_user(uid, &new.name);
        self.user_by_id(uid)
            .await?
            .ok_or_else(|| StoreError::UserNotFound(uid.to_string()))
    }

    async fn user_by_id(&self, uid: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn delete_user(&self, uid: UserId) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.uncache_user(uid);
        Ok(())
    }

    async fn users_matching(&self, glob: &str) -> Result<Vec<User>> {
        let like = glob
            .replace('%', "\\%")
            .replace('_', "\\_")
            .replace('*', "%")
            .replace('?', "_");
        let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE name LIKE $1 ORDER BY uid")
            .bind(like)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(self.hydrate(row).await?);
        }
        Ok(users)
    }

    async fn save_field(&self, uid: UserId, field: UserField) -> Result<()> {
        match field {
            UserField::Flags(v) => {
                sqlx::query("UPDATE users SET flags = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::Tagline(v) => {
                sqlx::query("UPDATE users SET tagline = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::HomeDir(v) => {
                sqlx::query("UPDATE users SET home_dir = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::DefaultRatio(v) => {
                sqlx::query("UPDATE users SET default_ratio = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::SectionRatio(section, ratio) => {
                sqlx::query(
                    "INSERT INTO user_sections (uid, section, ratio) VALUES ($1, $2, $3)
                     ON CONFLICT (uid, section) DO UPDATE SET ratio = EXCLUDED.ratio",
                )
                .bind(uid)
                .bind(section)
                .bind(ratio)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            }
            UserField::WeeklyAllotmentKb(v) => {
                sqlx::query("UPDATE users SET weekly_allotment_kb = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::Password { salt, hash } => {
                sqlx::query("UPDATE users SET password_salt = $1, password_hash = $2 WHERE uid = $3")
                    .bind(salt)
                    .bind(hash)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::RequiresTls(v) => {
                sqlx::query("UPDATE users SET requires_tls = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::ExpiresAt(v) => {
                sqlx::query("UPDATE users SET expires_at = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::PrimaryGid(v) => {
                sqlx::query("UPDATE users SET primary_gid = $1 WHERE uid = $2")
                    .bind(v)
                    .bind(uid)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            UserField::AddSecondaryGid(gid) => {
                sqlx::query(
                    "UPDATE users SET secondary_gids = array_append(secondary_gids, $1)
                     WHERE uid = $2 AND NOT ($1 = ANY(secondary_gids))",
                )
                .bind(gid)
                .bind(uid)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            }
            UserField::RemoveSecondaryGid(gid) => {
                sqlx::query(
                    "UPDATE users SET secondary_gids = array_remove(secondary_gids, $1) WHERE uid = $2",
                )
                .bind(gid)
                .bind(uid)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            }
        }
        Ok(())
    }

    async fn adjust_credits(&self, uid: UserId, section: &str, delta_kb: i64) -> Result<i64> {
        let (kb,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO user_sections (uid, section, credits_kb) VALUES ($1, $2, $3)
            ON CONFLICT (uid, section)
            DO UPDATE SET credits_kb = user_sections.credits_kb + EXCLUDED.credits_kb
            RETURNING credits_kb
            "#,
        )
        .bind(uid)
        .bind(section)
        .bind(delta_kb)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(kb)
    }

    async fn credits(&self, uid: UserId, section: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT credits_kb FROM user_sections WHERE uid = $1 AND section = $2")
                .bind(uid)
                .bind(section)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(|(kb,)| kb).unwrap_or(0))
    }

    async fn record_login(&self, uid: UserId, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = $1 WHERE uid = $2")
            .bind(when)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn add_transfer_stats(
        &self,
        uid: UserId,
        direction: TransferDirection,
        files: i64,
        kb: i64,
    ) -> Result<()> {
        let sql = match direction {
            TransferDirection::Upload => {
                "UPDATE users SET uploaded_files = uploaded_files + $1,
                                  uploaded_kb = uploaded_kb + $2 WHERE uid = $3"
            }
            TransferDirection::Download => {
                "UPDATE users SET downloaded_files = downloaded_files + $1,
                                  downloaded_kb = downloaded_kb + $2 WHERE uid = $3"
            }
        };
        sqlx::query(sql)
            .bind(files)
            .bind(kb)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn dupe_lookup(&self, filename: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT uploader, uploaded_at FROM dupe_log WHERE filename = $1")
                .bind(filename)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row)
    }

    async fn dupe_record(&self, filename: &str, uploader: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO dupe_log (filename, uploader, uploaded_at) VALUES ($1, $2, $3)
             ON CONFLICT (filename) DO NOTHING",
        )
        .bind(filename)
        .bind(uploader)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    fn name_of(&self, uid: UserId) -> String {
        self.users_by_id
            .read()
            .unwrap()
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    fn id_of(&self, name: &str) -> Option<UserId> {
        self.users_by_name.read().unwrap().get(name).copied()
    }
}

#[async_trait]
impl GroupStore for Database {
    async fn create_group(&self, name: &str, description: &str) -> Result<Group> {
        if self.group_by_name(name).await?.is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let gid = self.next_id("gid").await?;
        sqlx::query("INSERT INTO groups (gid, name, description) VALUES ($1, $2, $3)")
            .bind(gid)
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.cache_group(gid, name);
        self.group_by_id(gid)
            .await?
            .ok_or_else(|| StoreError::GroupNotFound(gid.to_string()))
    }

    async fn group_by_id(&self, gid: GroupId) -> Result<Option<Group>> {
        let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE gid = $1")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(Group::from))
    }

    async fn group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(Group::from))
    }

    async fn delete_group(&self, gid: GroupId) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE gid = $1")
            .bind(gid)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.uncache_group(gid);
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups ORDER BY gid")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    async fn member_counts(&self, gid: GroupId) -> Result<(i64, i64)> {
        let (primary,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE primary_gid = $1")
                .bind(gid)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        let (secondary,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE $1 = ANY(secondary_gids)")
                .bind(gid)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok((primary, secondary))
    }

    fn group_name_of(&self, gid: GroupId) -> String {
        self.groups_by_id
            .read()
            .unwrap()
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    fn group_id_of(&self, name: &str) -> Option<GroupId> {
        self.groups_by_name.read().unwrap().get(name).copied()
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    uid: i32,
    name: String,
    primary_gid: i32,
    secondary_gids: Vec<i32>,
    flags: String,
    default_ratio: i32,
    weekly_allotment_kb: i64,
    home_dir: String,
    expires_at: Option<DateTime<Utc>>,
    tagline: String,
    uploaded_files: i64,
    uploaded_kb: i64,
    downloaded_files: i64,
    downloaded_kb: i64,
    password_salt: String,
    password_hash: String,
    requires_tls: bool,
    last_login: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    gid: i32,
    name: String,
    description: String,
    comment: String,
    slots: i32,
    leech_slots: i32,
    allotment_slots: i32,
    max_allotment_kb: i64,
    max_logins: i32,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Group {
            gid: row.gid,
            name: row.name,
            description: row.description,
            comment: row.comment,
            slots: row.slots,
            leech_slots: row.leech_slots,
            allotment_slots: row.allotment_slots,
            max_allotment_kb: row.max_allotment_kb,
            max_logins: row.max_logins,
        }
    }
}
