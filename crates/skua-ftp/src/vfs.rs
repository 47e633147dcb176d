//! Path translation and the virtual filesystem.
//!
//! Virtual paths are absolute, UNIX style, and normalized; the real path is
//! always `sitepath + virtual`, so nothing outside the site root is
//! addressable. Ownership of entries is tracked in a per-directory sidecar
//! file written only by the daemon: a versioned JSON document replaced by
//! atomic rename under an adjacent advisory lock file. Readers without the
//! lock may observe a stale sidecar but never a torn one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use skua_core::Owner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed sidecar filename, one per directory.
pub const OWNER_FILE_NAME: &str = ".skua-owners";
const OWNER_LOCK_NAME: &str = ".skua-owners.lock";
const OWNER_FILE_VERSION: u32 = 1;

/// Locks older than this are considered abandoned and broken.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_MAX_RETRIES: u32 = 100;

/// Normalize an absolute virtual path: collapse `//`, resolve `.` and `..`,
/// strip any trailing slash. Fails with `PathEscape` when `..` would climb
/// above the root.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::Protocol(format!("not an absolute path: {}", path)));
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::PathEscape(path.to_string()));
                }
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Join client input onto the working directory and normalize. Relative
/// input is resolved against `cwd`; absolute input stands alone.
pub fn join(cwd: &str, input: &str) -> Result<String> {
    if input.starts_with('/') {
        normalize(input)
    } else if cwd.ends_with('/') {
        normalize(&format!("{}{}", cwd, input))
    } else {
        normalize(&format!("{}/{}", cwd, input))
    }
}

/// Parent directory and final component of a normalized virtual path.
pub fn split(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(pos) => (path[..pos].to_string(), path[pos + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

/// One directory entry with its resolved ownership.
#[derive(Debug)]
pub struct VfsEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: std::time::SystemTime,
    pub owner: Owner,
}

/// The virtual filesystem rooted at `sitepath`.
#[derive(Debug, Clone)]
pub struct Vfs {
    root: PathBuf,
}

impl Vfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Translate a virtual path to the real one. The result always has the
    /// site root as prefix.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        let normalized = normalize(virtual_path)?;
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }

    pub async fn metadata(&self, virtual_path: &str) -> Result<std::fs::Metadata> {
        let real = self.resolve(virtual_path)?;
        fs::metadata(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))
    }

    pub async fn exists(&self, virtual_path: &str) -> bool {
        match self.resolve(virtual_path) {
            Ok(real) => fs::metadata(real).await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn is_dir(&self, virtual_path: &str) -> bool {
        match self.resolve(virtual_path) {
            Ok(real) => fs::metadata(real)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Create a new file for writing; refuses to clobber.
    pub async fn create_file(&self, virtual_path: &str) -> Result<fs::File> {
        let real = self.resolve(virtual_path)?;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(virtual_path.to_string()),
                _ => Error::Io(e),
            })
    }

    /// Open an existing file for writing from `offset`, truncating what
    /// follows. Backs STOR-with-REST and overwrite.
    pub async fn open_write_at(&self, virtual_path: &str, offset: u64) -> Result<fs::File> {
        let real = self.resolve(virtual_path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    pub async fn open_append(&self, virtual_path: &str) -> Result<fs::File> {
        let real = self.resolve(virtual_path)?;
        fs::OpenOptions::new()
            .append(true)
            .open(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))
    }

    /// Open for reading, positioned at `offset`.
    pub async fn open_read(&self, virtual_path: &str, offset: u64) -> Result<fs::File> {
        let real = self.resolve(virtual_path)?;
        let mut file = fs::File::open(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(file)
    }

    pub async fn delete_file(&self, virtual_path: &str) -> Result<()> {
        let real = self.resolve(virtual_path)?;
        fs::remove_file(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))?;
        let (dir, name) = split(virtual_path);
        self.owner_delete(&dir, &name).await?;
        Ok(())
    }

    pub async fn make_dir(&self, virtual_path: &str, owner: Owner) -> Result<()> {
        let real = self.resolve(virtual_path)?;
        fs::create_dir(&real).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(virtual_path.to_string()),
            _ => Error::Io(e),
        })?;
        let (dir, name) = split(virtual_path);
        self.owner_set(&dir, &name, owner).await?;
        Ok(())
    }

    pub async fn remove_dir(&self, virtual_path: &str) -> Result<()> {
        let real = self.resolve(virtual_path)?;
        // The sidecar and its lock do not count against emptiness.
        for housekeeping in [OWNER_FILE_NAME, OWNER_LOCK_NAME] {
            let _ = fs::remove_file(real.join(housekeeping)).await;
        }
        fs::remove_dir(&real).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(virtual_path.to_string()),
            _ => Error::Io(e),
        })?;
        let (dir, name) = split(virtual_path);
        self.owner_delete(&dir, &name).await?;
        Ok(())
    }

    /// Rename, atomically on the same filesystem, otherwise by staged
    /// copy-then-delete. Ownership follows the entry into the target
    /// directory's sidecar.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let real_from = self.resolve(from)?;
        let real_to = self.resolve(to)?;
        if fs::metadata(&real_from).await.is_err() {
            return Err(Error::NotFound(from.to_string()));
        }
        if fs::metadata(&real_to).await.is_ok() {
            return Err(Error::AlreadyExists(to.to_string()));
        }

        match fs::rename(&real_from, &real_to).await {
            Ok(()) => {}
            // EXDEV: fall back to copy into a staging name, rename into
            // place, then drop the source.
            Err(e) if e.raw_os_error() == Some(18) => {
                let staging = real_to.with_file_name(format!(
                    ".tmp-{}",
                    Uuid::new_v4().simple()
                ));
                if let Err(copy_err) = fs::copy(&real_from, &staging).await {
                    let _ = fs::remove_file(&staging).await;
                    return Err(Error::Io(copy_err));
                }
                if let Err(rename_err) = fs::rename(&staging, &real_to).await {
                    let _ = fs::remove_file(&staging).await;
                    return Err(Error::Io(rename_err));
                }
                fs::remove_file(&real_from).await?;
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let (from_dir, from_name) = split(from);
        let (to_dir, to_name) = split(to);
        let owner = self.owner_take(&from_dir, &from_name).await?;
        self.owner_set(&to_dir, &to_name, owner).await?;
        Ok(())
    }

    /// List a directory with ownership resolved from the sidecar.
    /// Housekeeping files never appear.
    pub async fn list(&self, virtual_path: &str) -> Result<Vec<VfsEntry>> {
        let real = self.resolve(virtual_path)?;
        let owners = self.read_owner_file(&real).await;
        let mut reader = fs::read_dir(&real)
            .await
            .map_err(|_| Error::NotFound(virtual_path.to_string()))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_housekeeping(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(VfsEntry {
                owner: owners
                    .entries
                    .get(&name)
                    .copied()
                    .unwrap_or_else(Owner::unknown),
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Ownership of one entry; unknown when no record exists. Never fails a
    /// transfer.
    pub async fn owner_of(&self, virtual_path: &str) -> Owner {
        let (dir, name) = split(virtual_path);
        let real_dir = match self.resolve(&dir) {
            Ok(p) => p,
            Err(_) => return Owner::unknown(),
        };
        self.read_owner_file(&real_dir)
            .await
            .entries
            .get(&name)
            .copied()
            .unwrap_or_else(Owner::unknown)
    }

    /// Record ownership of `name` inside virtual directory `dir`.
    pub async fn owner_set(&self, dir: &str, name: &str, owner: Owner) -> Result<()> {
        let real_dir = self.resolve(dir)?;
        self.modify_owner_file(&real_dir, |of| {
            of.entries.insert(name.to_string(), owner);
        })
        .await
    }

    async fn owner_delete(&self, dir: &str, name: &str) -> Result<()> {
        let real_dir = self.resolve(dir)?;
        self.modify_owner_file(&real_dir, |of| {
            of.entries.remove(name);
        })
        .await
    }

    async fn owner_take(&self, dir: &str, name: &str) -> Result<Owner> {
        let real_dir = self.resolve(dir)?;
        let mut taken = Owner::unknown();
        self.modify_owner_file(&real_dir, |of| {
            if let Some(owner) = of.entries.remove(name) {
                taken = owner;
            }
        })
        .await?;
        Ok(taken)
    }

    async fn read_owner_file(&self, real_dir: &Path) -> OwnerFileData {
        OwnerFileData::load(&real_dir.join(OWNER_FILE_NAME)).await
    }

    /// Read-modify-write of a sidecar under its advisory lock. The lock is
    /// held for the smallest scope that covers the cycle.
    async fn modify_owner_file<F>(&self, real_dir: &Path, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut OwnerFileData),
    {
        let _lock = DirLock::acquire(real_dir).await?;
        let path = real_dir.join(OWNER_FILE_NAME);
        let mut data = OwnerFileData::load(&path).await;
        mutate(&mut data);
        data.save(&path).await
    }
}

fn is_housekeeping(name: &str) -> bool {
    name == OWNER_FILE_NAME || name == OWNER_LOCK_NAME || name.starts_with(".tmp-")
}

/// On-disk sidecar document. The version field lets future formats evolve
/// while old readers keep working on what they understand.
#[derive(Debug, Default, Serialize, Deserialize)]
struct OwnerFileData {
    version: u32,
    entries: HashMap<String, Owner>,
}

impl OwnerFileData {
    async fn load(path: &Path) -> Self {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<OwnerFileData>(&bytes) {
                Ok(data) if data.version <= OWNER_FILE_VERSION => data,
                Ok(data) => {
                    warn!(path = %path.display(), version = data.version,
                          "owner sidecar written by a newer daemon; using readable entries");
                    data
                }
                Err(e) => {
                    warn!(path = %path.display(), "unreadable owner sidecar: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write-to-temp then rename so concurrent readers never see a torn
    /// document.
    async fn save(&self, path: &Path) -> Result<()> {
        let data = OwnerFileData {
            version: OWNER_FILE_VERSION,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec(&data)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let tmp = path.with_file_name(format!(".tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }
}

/// Advisory per-directory lock: exclusive creation of an adjacent lock
/// file. Stale locks beyond [`STALE_LOCK_AGE`] are broken.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(real_dir: &Path) -> Result<Self> {
        let path = real_dir.join(OWNER_LOCK_NAME);
        for _ in 0..LOCK_MAX_RETRIES {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = fs::metadata(&path).await {
                        let age = meta
                            .modified()
                            .ok()
                            .and_then(|m| m.elapsed().ok())
                            .unwrap_or_default();
                        if age > STALE_LOCK_AGE {
                            debug!(path = %path.display(), "breaking stale sidecar lock");
                            let _ = fs::remove_file(&path).await;
                            continue;
                        }
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("sidecar lock busy: {}", path.display()),
        )))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn normalize_collapses_and_rejects_escape() {
        assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("//a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/a/./b").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/a/..").unwrap(), "/");
        assert!(matches!(normalize("/.."), Err(Error::PathEscape(_))));
        assert!(matches!(normalize("/a/../../b"), Err(Error::PathEscape(_))));
    }

    #[test]
    fn join_relative_and_absolute() {
        assert_eq!(join("/pub", "file.txt").unwrap(), "/pub/file.txt");
        assert_eq!(join("/pub", "/other").unwrap(), "/other");
        assert_eq!(join("/", "x").unwrap(), "/x");
        assert_eq!(join("/pub/sub", "../x").unwrap(), "/pub/x");
        assert!(join("/pub", "../../x").is_err());
    }

    #[test]
    fn split_parent_and_name() {
        assert_eq!(split("/a/b/c"), ("/a/b".to_string(), "c".to_string()));
        assert_eq!(split("/top"), ("/".to_string(), "top".to_string()));
    }

    #[test]
    fn resolve_always_stays_under_root() {
        let vfs = Vfs::new("/site");
        assert_eq!(vfs.resolve("/a/b").unwrap(), PathBuf::from("/site/a/b"));
        assert_eq!(vfs.resolve("/").unwrap(), PathBuf::from("/site"));
        assert!(vfs.resolve("/a/../../etc").is_err());
    }

    #[tokio::test]
    async fn create_and_list_with_owner() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        let mut f = vfs.create_file("/hello.bin").await.unwrap();
        f.write_all(b"abc").await.unwrap();
        drop(f);
        vfs.owner_set("/", "hello.bin", Owner::new(7, 3)).await.unwrap();

        let entries = vfs.list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.bin");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].owner, Owner::new(7, 3));
    }

    #[tokio::test]
    async fn create_refuses_existing() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        vfs.create_file("/x").await.unwrap();
        assert!(matches!(
            vfs.create_file("/x").await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn missing_owner_entry_is_unknown_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        vfs.create_file("/orphan").await.unwrap();
        assert!(vfs.owner_of("/orphan").await.is_unknown());
    }

    #[tokio::test]
    async fn rename_moves_owner_record_across_directories() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        vfs.make_dir("/sub", Owner::new(1, 1)).await.unwrap();
        vfs.create_file("/a.txt").await.unwrap();
        vfs.owner_set("/", "a.txt", Owner::new(7, 3)).await.unwrap();

        vfs.rename("/a.txt", "/sub/a.txt").await.unwrap();

        assert!(!vfs.exists("/a.txt").await);
        assert!(vfs.exists("/sub/a.txt").await);
        assert_eq!(vfs.owner_of("/sub/a.txt").await, Owner::new(7, 3));
        assert!(vfs.owner_of("/a.txt").await.is_unknown());
    }

    #[tokio::test]
    async fn rename_refuses_existing_target() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        vfs.create_file("/a").await.unwrap();
        vfs.create_file("/b").await.unwrap();
        assert!(matches!(
            vfs.rename("/a", "/b").await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn remove_dir_ignores_sidecar_files() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        vfs.make_dir("/d", Owner::new(1, 1)).await.unwrap();
        vfs.owner_set("/d", "ghost", Owner::new(2, 2)).await.unwrap();
        vfs.remove_dir("/d").await.unwrap();
        assert!(!vfs.exists("/d").await);
    }

    #[tokio::test]
    async fn sidecar_round_trips_and_tolerates_old_versions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(OWNER_FILE_NAME);
        let mut data = OwnerFileData::default();
        data.entries.insert("f".into(), Owner::new(4, 5));
        data.save(&path).await.unwrap();

        let loaded = OwnerFileData::load(&path).await;
        assert_eq!(loaded.version, OWNER_FILE_VERSION);
        assert_eq!(loaded.entries.get("f"), Some(&Owner::new(4, 5)));

        // A version-0 document still reads.
        fs::write(&path, br#"{"version":0,"entries":{"g":{"uid":1,"gid":2}}}"#)
            .await
            .unwrap();
        let loaded = OwnerFileData::load(&path).await;
        assert_eq!(loaded.entries.get("g"), Some(&Owner::new(1, 2)));
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join(OWNER_LOCK_NAME);
        std::fs::write(&lock_path, b"").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(600);
        let file = std::fs::OpenOptions::new().write(true).open(&lock_path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let lock = DirLock::acquire(tmp.path()).await;
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let _lock = DirLock::acquire(tmp.path()).await.unwrap();
            assert!(tmp.path().join(OWNER_LOCK_NAME).exists());
        }
        assert!(!tmp.path().join(OWNER_LOCK_NAME).exists());
    }
}
