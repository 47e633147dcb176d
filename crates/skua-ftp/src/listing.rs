//! Directory listings for LIST, NLST, MLSD and MLST.
//!
//! Owner columns come from the per-directory sidecar resolved through the
//! repository's name caches. `hidden_files`, `privpath` and `hideowner`
//! policy are applied per viewing principal.

use crate::config::Config;
use crate::error::Result;
use crate::vfs::{Vfs, VfsEntry};
use chrono::{DateTime, Utc};
use skua_core::{GroupStore, Principal, UserStore, UNKNOWN_NAME};

/// A long-form `ls -l` style line.
pub fn format_list_line(entry: &VfsEntry, owner: &str, group: &str) -> String {
    let modified: DateTime<Utc> = entry.modified.into();
    format!(
        "{}{} {:>3} {:>8} {:>8} {:>13} {} {}",
        if entry.is_dir { "d" } else { "-" },
        if entry.is_dir { "rwxrwxr-x" } else { "rw-rw-r--" },
        1,
        owner,
        group,
        entry.size,
        modified.format("%b %d %H:%M"),
        entry.name
    )
}

/// One MLSD/MLST fact line (RFC 3659).
pub fn format_mlsx_line(entry: &VfsEntry, owner: &str, group: &str) -> String {
    let modified: DateTime<Utc> = entry.modified.into();
    let kind = if entry.is_dir { "dir" } else { "file" };
    format!(
        "type={};size={};modify={};unix.owner={};unix.group={}; {}",
        kind,
        entry.size,
        modified.format("%Y%m%d%H%M%S"),
        owner,
        group,
        entry.name
    )
}

/// `YYYYMMDDHHMMSS` for MDTM.
pub fn format_mdtm(modified: std::time::SystemTime) -> String {
    let dt: DateTime<Utc> = modified.into();
    dt.format("%Y%m%d%H%M%S").to_string()
}

/// The flavors of listing a session can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    Long,
    NamesOnly,
    MachineReadable,
}

/// Build the listing lines for `dir` as seen by `principal`.
pub async fn build_listing(
    vfs: &Vfs,
    config: &Config,
    users: &dyn UserStore,
    groups_store: &dyn GroupStore,
    dir: &str,
    principal: &Principal,
    groups: &[String],
    kind: ListingKind,
) -> Result<Vec<String>> {
    let entries = vfs.list(dir).await?;
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        if config.is_hidden_file(dir, &entry.name) {
            continue;
        }
        let child = if dir == "/" {
            format!("/{}", entry.name)
        } else {
            format!("{}/{}", dir, entry.name)
        };
        // Private paths vanish from listings for principals their ACL
        // does not admit.
        if let Some(priv_entry) = config.first_matching(&config.privpath, &child) {
            if !priv_entry.acl.check(principal, groups) {
                continue;
            }
        }
        let hide_owner = config
            .first_matching(&config.hideowner, &child)
            .map(|e| e.acl.check(principal, groups))
            .unwrap_or(false);
        let (owner, group) = if hide_owner || entry.owner.is_unknown() {
            (UNKNOWN_NAME.to_string(), UNKNOWN_NAME.to_string())
        } else {
            (
                users.name_of(entry.owner.uid),
                groups_store.group_name_of(entry.owner.gid),
            )
        };
        lines.push(match kind {
            ListingKind::Long => format_list_line(&entry, &owner, &group),
            ListingKind::NamesOnly => entry.name.clone(),
            ListingKind::MachineReadable => format_mlsx_line(&entry, &owner, &group),
        });
    }
    Ok(lines)
}

/// MLST for a single path.
pub async fn build_mlst(
    vfs: &Vfs,
    users: &dyn UserStore,
    groups_store: &dyn GroupStore,
    path: &str,
) -> Result<String> {
    let meta = vfs.metadata(path).await?;
    let owner = vfs.owner_of(path).await;
    let (_, name) = crate::vfs::split(path);
    let entry = VfsEntry {
        name,
        is_dir: meta.is_dir(),
        size: meta.len(),
        modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        owner,
    };
    let (owner_name, group_name) = if owner.is_unknown() {
        (UNKNOWN_NAME.to_string(), UNKNOWN_NAME.to_string())
    } else {
        (users.name_of(owner.uid), groups_store.group_name_of(owner.gid))
    };
    Ok(format_mlsx_line(&entry, &owner_name, &group_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skua_core::Owner;
    use std::time::{Duration, UNIX_EPOCH};

    fn entry(name: &str, is_dir: bool, size: u64) -> VfsEntry {
        VfsEntry {
            name: name.to_string(),
            is_dir,
            size,
            modified: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            owner: Owner::new(7, 3),
        }
    }

    #[test]
    fn long_line_shape() {
        let line = format_list_line(&entry("hello.bin", false, 345), "alice", "staff");
        assert!(line.starts_with("-rw-rw-r--"));
        assert!(line.contains("alice"));
        assert!(line.contains("staff"));
        assert!(line.contains("345"));
        assert!(line.ends_with("hello.bin"));

        let line = format_list_line(&entry("sub", true, 0), "alice", "staff");
        assert!(line.starts_with("drwxrwxr-x"));
    }

    #[test]
    fn mlsx_facts() {
        let line = format_mlsx_line(&entry("f", false, 9), "alice", "staff");
        assert!(line.starts_with("type=file;size=9;modify=2023"));
        assert!(line.contains("unix.owner=alice"));
        assert!(line.ends_with("; f"));
    }

    #[test]
    fn mdtm_format() {
        let t = UNIX_EPOCH + Duration::from_secs(0);
        assert_eq!(format_mdtm(t), "19700101000000");
    }
}
