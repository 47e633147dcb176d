//! In-memory store.
//!
//! Backs `--no-database` trial runs and the engine's test suites. Same
//! semantics as the PostgreSQL repository, minus durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skua_core::{
    Group, GroupId, GroupStore, NewUser, StoreError, TransferDirection, User, UserField, UserId,
    UserStore, UNKNOWN_NAME,
};
use std::collections::HashMap;
use std::sync::Mutex;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, Group>,
    dupes: HashMap<String, (String, DateTime<Utc>)>,
    next_uid: UserId,
    next_gid: GroupId,
}

/// Ephemeral store keeping everything behind one mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_uid: 1,
                next_gid: 1,
                ..Inner::default()
            }),
        }
    }

    /// Seed a fully formed user, assigning the next free uid if the given
    /// one is taken.
    pub fn insert_user(&self, mut user: User) -> User {
        let mut inner = self.inner.lock().unwrap();
        if user.uid <= 0 || inner.users.contains_key(&user.uid) {
            user.uid = inner.next_uid;
        }
        inner.next_uid = inner.next_uid.max(user.uid + 1);
        inner.users.insert(user.uid, user.clone());
        user
    }

    pub fn insert_group(&self, mut group: Group) -> Group {
        let mut inner = self.inner.lock().unwrap();
        if group.gid <= 0 || inner.groups.contains_key(&group.gid) {
            group.gid = inner.next_gid;
        }
        inner.next_gid = inner.next_gid.max(group.gid + 1);
        inner.groups.insert(group.gid, group.clone());
        group
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    // Shell-style * and ? over plain names.
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.values().any(|u| u.name == new.name) {
            return Err(StoreError::AlreadyExists(new.name));
        }
        let uid = inner.next_uid;
        inner.next_uid += 1;
        let user = User {
            uid,
            name: new.name,
            primary_gid: new.primary_gid,
            secondary_gids: Vec::new(),
            flags: new.flags,
            default_ratio: new.default_ratio,
            section_ratios: HashMap::new(),
            credits_kb: HashMap::new(),
            weekly_allotment_kb: 0,
            home_dir: new.home_dir,
            expires_at: None,
            tagline: String::new(),
            uploaded_files: 0,
            uploaded_kb: 0,
            downloaded_files: 0,
            downloaded_kb: 0,
            password_salt: new.password_salt,
            password_hash: new.password_hash,
            requires_tls: false,
            last_login: None,
            created_at: Utc::now(),
        };
        inner.users.insert(uid, user.clone());
        Ok(user)
    }

    async fn user_by_id(&self, uid: UserId) -> Result<Option<User>> {
        Ok(self.inner.lock().unwrap().users.get(&uid).cloned())
    }

    async fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.name == name)
            .cloned())
    }

    async fn delete_user(&self, uid: UserId) -> Result<()> {
        self.inner.lock().unwrap().users.remove(&uid);
        Ok(())
    }

    async fn users_matching(&self, glob: &str) -> Result<Vec<User>> {
        let inner = self.inner.lock().unwrap();
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| glob_match(glob, &u.name))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.uid);
        Ok(users)
    }

    async fn save_field(&self, uid: UserId, field: UserField) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .get_mut(&uid)
            .ok_or_else(|| StoreError::UserNotFound(uid.to_string()))?;
        match field {
            UserField::Flags(v) => user.flags = v,
            UserField::Tagline(v) => user.tagline = v,
            UserField::HomeDir(v) => user.home_dir = v,
            UserField::DefaultRatio(v) => user.default_ratio = v,
            UserField::SectionRatio(section, ratio) => {
                if ratio < 0 {
                    user.section_ratios.remove(&section);
                } else {
                    user.section_ratios.insert(section, ratio);
                }
            }
            UserField::WeeklyAllotmentKb(v) => user.weekly_allotment_kb = v,
            UserField::Password { salt, hash } => {
                user.password_salt = salt;
                user.password_hash = hash;
            }
            UserField::RequiresTls(v) => user.requires_tls = v,
            UserField::ExpiresAt(v) => user.expires_at = v,
            UserField::PrimaryGid(v) => user.primary_gid = v,
            UserField::AddSecondaryGid(gid) => {
                if !user.secondary_gids.contains(&gid) {
                    user.secondary_gids.push(gid);
                }
            }
            UserField::RemoveSecondaryGid(gid) => {
                user.secondary_gids.retain(|g| *g != gid);
            }
        }
        Ok(())
    }

    async fn adjust_credits(&self, uid: UserId, section: &str, delta_kb: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .get_mut(&uid)
            .ok_or_else(|| StoreError::UserNotFound(uid.to_string()))?;
        let balance = user.credits_kb.entry(section.to_string()).or_insert(0);
        *balance += delta_kb;
        Ok(*balance)
    }

    async fn credits(&self, uid: UserId, section: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .get(&uid)
            .and_then(|u| u.credits_kb.get(section).copied())
            .unwrap_or(0))
    }

    async fn record_login(&self, uid: UserId, when: DateTime<Utc>) -> Result<()> {
        if let Some(user) = self.inner.lock().unwrap().users.get_mut(&uid) {
            user.last_login = Some(when);
        }
        Ok(())
    }

    async fn add_transfer_stats(
        &self,
        uid: UserId,
        direction: TransferDirection,
        files: i64,
        kb: i64,
    ) -> Result<()> {
        if let Some(user) = self.inner.lock().unwrap().users.get_mut(&uid) {
            match direction {
                TransferDirection::Upload => {
                    user.uploaded_files += files;
                    user.uploaded_kb += kb;
                }
                TransferDirection::Download => {
                    user.downloaded_files += files;
                    user.downloaded_kb += kb;
                }
            }
        }
        Ok(())
    }

    async fn dupe_lookup(&self, filename: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        Ok(self.inner.lock().unwrap().dupes.get(filename).cloned())
    }

    async fn dupe_record(&self, filename: &str, uploader: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .dupes
            .entry(filename.to_string())
            .or_insert_with(|| (uploader.to_string(), Utc::now()));
        Ok(())
    }

    fn name_of(&self, uid: UserId) -> String {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(&uid)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    fn id_of(&self, name: &str) -> Option<UserId> {
        self.inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.name == name)
            .map(|u| u.uid)
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn create_group(&self, name: &str, description: &str) -> Result<Group> {
        let mut inner = self.inner.lock().unwrap();
        if inner.groups.values().any(|g| g.name == name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let gid = inner.next_gid;
        inner.next_gid += 1;
        let group = Group {
            gid,
            name: name.to_string(),
            description: description.to_string(),
            comment: String::new(),
            slots: 0,
            leech_slots: 0,
            allotment_slots: 0,
            max_allotment_kb: 0,
            max_logins: -1,
        };
        inner.groups.insert(gid, group.clone());
        Ok(group)
    }

    async fn group_by_id(&self, gid: GroupId) -> Result<Option<Group>> {
        Ok(self.inner.lock().unwrap().groups.get(&gid).cloned())
    }

    async fn group_by_name(&self, name: &str) -> Result<Option<Group>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn delete_group(&self, gid: GroupId) -> Result<()> {
        self.inner.lock().unwrap().groups.remove(&gid);
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = self.inner.lock().unwrap().groups.values().cloned().collect();
        groups.sort_by_key(|g| g.gid);
        Ok(groups)
    }

    async fn member_counts(&self, gid: GroupId) -> Result<(i64, i64)> {
        let inner = self.inner.lock().unwrap();
        let primary = inner.users.values().filter(|u| u.primary_gid == gid).count() as i64;
        let secondary = inner
            .users
            .values()
            .filter(|u| u.secondary_gids.contains(&gid))
            .count() as i64;
        Ok((primary, secondary))
    }

    fn group_name_of(&self, gid: GroupId) -> String {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&gid)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    fn group_id_of(&self, name: &str) -> Option<GroupId> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .values()
            .find(|g| g.name == name)
            .map(|g| g.gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let store = MemoryStore::new();
        let a = store
            .create_user(NewUser {
                name: "a".into(),
                primary_gid: 1,
                flags: "3".into(),
                default_ratio: 3,
                home_dir: "/".into(),
                password_salt: String::new(),
                password_hash: String::new(),
            })
            .await
            .unwrap();
        let b = store
            .create_user(NewUser {
                name: "b".into(),
                primary_gid: 1,
                flags: "3".into(),
                default_ratio: 3,
                home_dir: "/".into(),
                password_salt: String::new(),
                password_hash: String::new(),
            })
            .await
            .unwrap();
        assert!(b.uid > a.uid);
    }

    #[tokio::test]
    async fn unknown_id_resolves_to_sentinel() {
        let store = MemoryStore::new();
        assert_eq!(store.name_of(99), UNKNOWN_NAME);
        assert_eq!(store.id_of("nobody"), None);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("al*", "alice"));
        assert!(glob_match("a?ice", "alice"));
        assert!(!glob_match("bob", "alice"));
    }
}
