//! The transfer pipeline: pre-flight policy, streaming with pacing, and
//! byte/credit accounting.
//!
//! Download debits are taken before the first byte moves and refunded
//! pro-rata for bytes never delivered. ABOR and control-channel loss are
//! observed between chunks through a watch channel, so cancellation lands
//! within one chunk of I/O.

use crate::config::{Config, SpeedCaps};
use crate::credits::{self, Charge};
use crate::data::{ascii_to_wire_cont, wire_to_ascii, DataStream};
use crate::error::{Error, Result};
use crate::vfs::Vfs;
use skua_core::{Owner, Principal, TransferDirection, User, UserStore};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

const CHUNK: usize = 64 * 1024;
/// Minimum-speed enforcement only kicks in after this warm-up.
const MIN_SPEED_WARMUP: Duration = Duration::from_secs(5);

/// Everything a transfer needs from the session, passed explicitly.
pub struct TransferCtx<'a> {
    pub config: &'a Config,
    pub vfs: &'a Vfs,
    pub users: &'a dyn UserStore,
    pub user: &'a User,
    pub principal: &'a Principal,
    pub groups: &'a [String],
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub bytes: u64,
    /// Kilobytes credited (uploads) or debited net of refund (downloads).
    pub credit_delta_kb: i64,
}

/// Resolved download: size known, any charge already taken.
#[derive(Debug)]
pub struct DownloadPlan {
    pub size: u64,
    pub charge: Option<Charge>,
}

/// How an upload will open its sink, decided by pre-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Create,
    Overwrite,
    Resume(u64),
    Append,
}

/// Policy checks and the up-front debit for RETR. Only the bytes beyond
/// `offset` are charged, so a resumed download never pays twice.
pub async fn preflight_download(
    ctx: &TransferCtx<'_>,
    vpath: &str,
    offset: u64,
) -> Result<DownloadPlan> {
    let (_, name) = crate::vfs::split(vpath);
    if ctx.config.noretrieve.iter().any(|g| g.matches(&name)) {
        return Err(Error::PermissionDenied(format!("noretrieve: {}", name)));
    }
    if !ctx
        .config
        .path_op_allowed(&ctx.config.privpath, vpath, ctx.principal, ctx.groups, true)
    {
        return Err(Error::NotFound(vpath.to_string()));
    }
    if !ctx
        .config
        .path_op_allowed(&ctx.config.download, vpath, ctx.principal, ctx.groups, true)
    {
        return Err(Error::PermissionDenied(vpath.to_string()));
    }

    let meta = ctx.vfs.metadata(vpath).await?;
    if meta.is_dir() {
        return Err(Error::NotFound(vpath.to_string()));
    }

    let owner = ctx.vfs.owner_of(vpath).await;
    let own_file = owner.uid == ctx.principal.uid;
    let free = own_file
        || ctx
            .config
            .path_op_allowed(&ctx.config.freefile, vpath, ctx.principal, ctx.groups, false);

    let charge = if free {
        None
    } else {
        credits::transfer_debit(
            ctx.users,
            ctx.config,
            ctx.user,
            ctx.principal,
            ctx.groups,
            vpath,
            meta.len().saturating_sub(offset),
        )
        .await?
    };

    Ok(DownloadPlan {
        size: meta.len(),
        charge,
    })
}

/// Policy checks for STOR/APPE, resolving how the sink opens.
pub async fn preflight_upload(
    ctx: &TransferCtx<'_>,
    vpath: &str,
    rest_offset: u64,
    append: bool,
) -> Result<UploadMode> {
    if !ctx
        .config
        .path_op_allowed(&ctx.config.privpath, vpath, ctx.principal, ctx.groups, true)
    {
        return Err(Error::NotFound(vpath.to_string()));
    }
    if !ctx
        .config
        .path_op_allowed(&ctx.config.upload, vpath, ctx.principal, ctx.groups, true)
    {
        return Err(Error::PermissionDenied(vpath.to_string()));
    }

    let (_, name) = crate::vfs::split(vpath);
    for filter in ctx.config.path_filters_for(ctx.groups) {
        if !filter.patterns.iter().any(|re| re.is_match(&name)) {
            return Err(Error::PermissionDenied(format!(
                "{} (see {})",
                name,
                filter.message_file.display()
            )));
        }
    }

    if let Some(dupe) = ctx.config.dupe_check {
        if dupe.enabled {
            if let Some((uploader, when)) = ctx.users.dupe_lookup(&name).await? {
                let age = chrono::Utc::now() - when;
                if age.num_days() < dupe.days as i64 {
                    return Err(Error::AlreadyExists(format!(
                        "{} (dupe, first by {})",
                        name, uploader
                    )));
                }
            }
        }
    }

    if append {
        return Ok(if ctx.vfs.exists(vpath).await {
            UploadMode::Append
        } else {
            UploadMode::Create
        });
    }

    if ctx.vfs.exists(vpath).await {
        if rest_offset > 0 {
            if !ctx
                .config
                .path_op_allowed(&ctx.config.resume, vpath, ctx.principal, ctx.groups, true)
            {
                return Err(Error::PermissionDenied(format!("resume: {}", vpath)));
            }
            Ok(UploadMode::Resume(rest_offset))
        } else {
            if !ctx
                .config
                .path_op_allowed(&ctx.config.overwrite, vpath, ctx.principal, ctx.groups, true)
            {
                return Err(Error::AlreadyExists(vpath.to_string()));
            }
            Ok(UploadMode::Overwrite)
        }
    } else {
        Ok(UploadMode::Create)
    }
}

struct Pacer {
    started: Instant,
    cap_kbps: Option<u64>,
    floor_kbps: Option<u64>,
}

impl Pacer {
    fn new(caps: SpeedCaps, direction: TransferDirection) -> Self {
        let (cap_kbps, floor_kbps) = match direction {
            TransferDirection::Download => (caps.max_down_kbps, caps.min_down_kbps),
            TransferDirection::Upload => (caps.max_up_kbps, caps.min_up_kbps),
        };
        Self {
            started: Instant::now(),
            cap_kbps,
            floor_kbps,
        }
    }

    /// Sleep long enough that `bytes_done` stays at or under the ceiling,
    /// then verify the floor once the warm-up has passed.
    async fn pace(&self, bytes_done: u64) -> Result<()> {
        if let Some(cap) = self.cap_kbps {
            let target = Duration::from_secs_f64(bytes_done as f64 / (cap as f64 * 1024.0));
            let elapsed = self.started.elapsed();
            if target > elapsed {
                tokio::time::sleep(target - elapsed).await;
            }
        }
        if let Some(floor) = self.floor_kbps {
            let elapsed = self.started.elapsed();
            if elapsed > MIN_SPEED_WARMUP {
                let rate_kbps = bytes_done as f64 / 1024.0 / elapsed.as_secs_f64();
                if rate_kbps < floor as f64 {
                    return Err(Error::TransferAborted { bytes_done });
                }
            }
        }
        Ok(())
    }
}

fn aborted(bytes_done: u64) -> Error {
    Error::TransferAborted { bytes_done }
}

/// Stream a file to the data connection. The plan's charge is reconciled on
/// every exit path.
pub async fn download(
    ctx: &TransferCtx<'_>,
    data: &mut DataStream,
    vpath: &str,
    offset: u64,
    ascii: bool,
    plan: DownloadPlan,
    abort: &mut watch::Receiver<bool>,
) -> Result<TransferOutcome> {
    let result = download_inner(ctx, data, vpath, offset, ascii, abort).await;
    let expected = plan.size.saturating_sub(offset);

    match result {
        Ok(bytes) => {
            let debited = plan.charge.as_ref().map(|c| c.kb).unwrap_or(0);
            if !ctx
                .config
                .path_op_allowed(&ctx.config.nostats, vpath, ctx.principal, ctx.groups, false)
            {
                ctx.users
                    .add_transfer_stats(
                        ctx.user.uid,
                        TransferDirection::Download,
                        1,
                        credits::kb_for_bytes(bytes),
                    )
                    .await?;
            }
            Ok(TransferOutcome {
                bytes,
                credit_delta_kb: -debited,
            })
        }
        Err(err) => {
            let bytes_done = match &err {
                Error::TransferAborted { bytes_done } => *bytes_done,
                _ => 0,
            };
            if let Some(charge) = &plan.charge {
                let refund = charge.refund_kb(bytes_done, expected);
                if refund > 0 {
                    credits::credit(ctx.users, ctx.user.uid, &charge.key, refund).await?;
                    debug!(user = %ctx.user.name, refund, "refunded undelivered kilobytes");
                }
            }
            Err(err)
        }
    }
}

async fn download_inner(
    ctx: &TransferCtx<'_>,
    data: &mut DataStream,
    vpath: &str,
    offset: u64,
    ascii: bool,
    abort: &mut watch::Receiver<bool>,
) -> Result<u64> {
    let mut file = ctx.vfs.open_read(vpath, offset).await?;
    let caps = ctx.config.speed_caps(vpath, ctx.principal, ctx.groups);
    let pacer = Pacer::new(caps, TransferDirection::Download);
    let mut buf = vec![0u8; CHUNK];
    let mut bytes_done: u64 = 0;
    let mut prev_byte = 0u8;

    loop {
        if *abort.borrow() {
            return Err(aborted(bytes_done));
        }
        let n = tokio::select! {
            r = file.read(&mut buf) => r?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        };
        if n == 0 {
            break;
        }
        let wire;
        let out: &[u8] = if ascii {
            wire = ascii_to_wire_cont(&buf[..n], prev_byte);
            prev_byte = buf[n - 1];
            &wire
        } else {
            &buf[..n]
        };
        tokio::select! {
            r = data.write_all(out) => r.map_err(|_| aborted(bytes_done))?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        }
        bytes_done += n as u64;
        tokio::select! {
            r = pacer.pace(bytes_done) => r?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        }
    }
    data.shutdown().await.ok();
    Ok(bytes_done)
}

/// Receive a file from the data connection, recording ownership and posting
/// ratio-multiplied credit on success. A failed upload keeps its partial
/// file only when `dl_incomplete` allows.
pub async fn upload(
    ctx: &TransferCtx<'_>,
    data: &mut DataStream,
    vpath: &str,
    mode: UploadMode,
    ascii: bool,
    abort: &mut watch::Receiver<bool>,
) -> Result<TransferOutcome> {
    let created = mode == UploadMode::Create;
    let result = upload_inner(ctx, data, vpath, mode, ascii, abort).await;

    match result {
        Ok(bytes) => {
            let (dir, name) = crate::vfs::split(vpath);
            ctx.vfs
                .owner_set(&dir, &name, Owner::new(ctx.principal.uid, ctx.principal.primary_gid))
                .await?;
            ctx.users.dupe_record(&name, &ctx.user.name).await?;

            let nostats = ctx
                .config
                .path_op_allowed(&ctx.config.nostats, vpath, ctx.principal, ctx.groups, false);
            let mut earned = 0;
            if !nostats {
                earned = credits::upload_credit(
                    ctx.users,
                    ctx.config,
                    ctx.user,
                    ctx.principal,
                    ctx.groups,
                    vpath,
                    bytes,
                )
                .await?;
                ctx.users
                    .add_transfer_stats(
                        ctx.user.uid,
                        TransferDirection::Upload,
                        1,
                        credits::kb_for_bytes(bytes),
                    )
                    .await?;
            }
            Ok(TransferOutcome {
                bytes,
                credit_delta_kb: earned,
            })
        }
        Err(err) => {
            if created && !ctx.config.dl_incomplete {
                let _ = ctx.vfs.delete_file(vpath).await;
            }
            Err(err)
        }
    }
}

async fn upload_inner(
    ctx: &TransferCtx<'_>,
    data: &mut DataStream,
    vpath: &str,
    mode: UploadMode,
    ascii: bool,
    abort: &mut watch::Receiver<bool>,
) -> Result<u64> {
    let mut file = match mode {
        UploadMode::Create => ctx.vfs.create_file(vpath).await?,
        UploadMode::Overwrite => ctx.vfs.open_write_at(vpath, 0).await?,
        UploadMode::Resume(offset) => ctx.vfs.open_write_at(vpath, offset).await?,
        UploadMode::Append => ctx.vfs.open_append(vpath).await?,
    };
    let caps = ctx.config.speed_caps(vpath, ctx.principal, ctx.groups);
    let pacer = Pacer::new(caps, TransferDirection::Upload);
    let mut buf = vec![0u8; CHUNK];
    let mut bytes_done: u64 = 0;

    loop {
        if *abort.borrow() {
            return Err(aborted(bytes_done));
        }
        let n = tokio::select! {
            r = data.read_chunk(&mut buf) => r.map_err(|_| aborted(bytes_done))?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        };
        if n == 0 {
            break;
        }
        let canonical;
        let chunk: &[u8] = if ascii {
            canonical = wire_to_ascii(&buf[..n]);
            &canonical
        } else {
            &buf[..n]
        };
        tokio::select! {
            r = file.write_all(chunk) => r?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        }
        bytes_done += n as u64;
        tokio::select! {
            r = pacer.pace(bytes_done) => r?,
            _ = abort.changed() => return Err(aborted(bytes_done)),
        }
    }
    file.flush().await?;
    Ok(bytes_done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use skua_db::MemoryStore;
    use skua_core::User;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn make_user(store: &MemoryStore, ratio: i32) -> User {
        store.insert_user(User {
            uid: 0,
            name: "alice".into(),
            primary_gid: 1,
            secondary_gids: vec![],
            flags: "3".into(),
            default_ratio: ratio,
            section_ratios: HashMap::new(),
            credits_kb: HashMap::new(),
            weekly_allotment_kb: 0,
            home_dir: "/".into(),
            expires_at: None,
            tagline: String::new(),
            uploaded_files: 0,
            uploaded_kb: 0,
            downloaded_files: 0,
            downloaded_kb: 0,
            password_salt: String::new(),
            password_hash: String::new(),
            requires_tls: false,
            last_login: None,
            created_at: chrono::Utc::now(),
        })
    }

    fn config(extra: &str) -> Config {
        Config::parse(&format!(
            "sitepath /site\ndatapath /data\nport 2121\nvalid_ip 0.0.0.0\n{}",
            extra
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn download_preflight_denies_without_acl() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        std::fs::create_dir(tmp.path().join("priv")).unwrap();
        std::fs::write(tmp.path().join("priv/x"), b"data").unwrap();
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        let cfg = config("download /priv* !*\n");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        let err = preflight_download(&ctx, "/priv/x", 0).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn download_preflight_charges_nonowned_files() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        std::fs::write(tmp.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        store
            .adjust_credits(user.uid, skua_core::DEFAULT_SECTION, 10)
            .await
            .unwrap();
        let cfg = config("");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        let plan = preflight_download(&ctx, "/big.bin", 0).await.unwrap();
        assert_eq!(plan.size, 2048);
        assert_eq!(plan.charge.as_ref().unwrap().kb, 2);
        assert_eq!(
            store.credits(user.uid, skua_core::DEFAULT_SECTION).await.unwrap(),
            8
        );
    }

    #[tokio::test]
    async fn own_files_download_free() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        std::fs::write(tmp.path().join("mine.bin"), vec![0u8; 2048]).unwrap();
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        vfs.owner_set("/", "mine.bin", Owner::new(user.uid, 1))
            .await
            .unwrap();
        let cfg = config("");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        let plan = preflight_download(&ctx, "/mine.bin", 0).await.unwrap();
        assert!(plan.charge.is_none());
    }

    #[tokio::test]
    async fn upload_preflight_resolves_modes() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        let cfg = config("");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        assert_eq!(
            preflight_upload(&ctx, "/new.bin", 0, false).await.unwrap(),
            UploadMode::Create
        );
        std::fs::write(tmp.path().join("new.bin"), b"x").unwrap();
        assert_eq!(
            preflight_upload(&ctx, "/new.bin", 0, false).await.unwrap(),
            UploadMode::Overwrite
        );
        assert_eq!(
            preflight_upload(&ctx, "/new.bin", 1, false).await.unwrap(),
            UploadMode::Resume(1)
        );
        assert_eq!(
            preflight_upload(&ctx, "/new.bin", 0, true).await.unwrap(),
            UploadMode::Append
        );
    }

    #[tokio::test]
    async fn upload_preflight_overwrite_denied_by_acl() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        std::fs::write(tmp.path().join("keep.bin"), b"x").unwrap();
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        let cfg = config("overwrite /* !*\n");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        assert!(matches!(
            preflight_upload(&ctx, "/keep.bin", 0, false).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn path_filter_blocks_nonmatching_names() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        let cfg = config("path-filter * /ftp-data/msgs/badname.msg ^[A-Za-z0-9._-]+$\n");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        assert!(preflight_upload(&ctx, "/ok_name.bin", 0, false).await.is_ok());
        assert!(matches!(
            preflight_upload(&ctx, "/bad name!", 0, false).await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn dupe_check_refuses_recent_names() {
        let tmp = TempDir::new().unwrap();
        let vfs = Vfs::new(tmp.path());
        let store = MemoryStore::new();
        let user = make_user(&store, 3);
        store.dupe_record("release.zip", "bob").await.unwrap();
        let cfg = config("dupe_check 7 true\n");
        let principal = user.principal();
        let ctx = TransferCtx {
            config: &cfg,
            vfs: &vfs,
            users: &store,
            user: &user,
            principal: &principal,
            groups: &[],
        };
        assert!(matches!(
            preflight_upload(&ctx, "/release.zip", 0, false).await,
            Err(Error::AlreadyExists(_))
        ));
    }
}
