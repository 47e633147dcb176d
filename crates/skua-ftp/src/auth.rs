//! Authentication helpers: salted password hashes and per-connection
//! admission checks.

use crate::config::Config;
use sha2::{Digest, Sha256};
use skua_core::User;
use std::net::IpAddr;
use uuid::Uuid;

/// Fresh random salt for a new password.
pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Hex SHA-256 over salt plus password.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

pub fn verify_password(user: &User, password: &str) -> bool {
    hash_password(&user.password_salt, password) == user.password_hash
}

/// Why a login was refused before or at PASS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDenied {
    Banned,
    Expired,
    BadPassword,
    TlsRequired,
    InsecureAddress,
    BouncerOnly,
}

impl std::fmt::Display for LoginDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginDenied::Banned => write!(f, "banned user"),
            LoginDenied::Expired => write!(f, "account expired"),
            LoginDenied::BadPassword => write!(f, "bad password"),
            LoginDenied::TlsRequired => write!(f, "TLS required"),
            LoginDenied::InsecureAddress => write!(f, "insecure address"),
            LoginDenied::BouncerOnly => write!(f, "direct connections refused"),
        }
    }
}

/// `secure_ip` admission: the first entry whose ACL matches the user
/// decides. Hostname-only masks are refused when `allow_hostnames` is off;
/// addresses with fewer known fields than `min_fields` are refused.
pub fn secure_ip_ok(config: &Config, user: &User, groups: &[String], peer: IpAddr) -> bool {
    let principal = user.principal();
    for entry in &config.secure_ip {
        if !entry.acl.check(&principal, groups) {
            continue;
        }
        let fields = match peer {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 8,
        };
        // Numeric peers always satisfy the hostname rule; ident lookups are
        // the frontend's concern.
        return fields >= entry.min_fields;
    }
    true
}

/// Full admission check at PASS time. `control_tls` is the state of the
/// control channel at the moment of the check.
pub fn check_login(
    config: &Config,
    user: &User,
    groups: &[String],
    password: &str,
    peer: IpAddr,
    control_tls: bool,
) -> Result<(), LoginDenied> {
    if config.banned_users.iter().any(|b| *b == user.name) {
        return Err(LoginDenied::Banned);
    }
    if let Some(expiry) = user.expires_at {
        if expiry < chrono::Utc::now() {
            return Err(LoginDenied::Expired);
        }
    }
    if config.bouncer_only && !config.is_bouncer(&peer.to_string()) {
        return Err(LoginDenied::BouncerOnly);
    }
    if !secure_ip_ok(config, user, groups, peer) {
        return Err(LoginDenied::InsecureAddress);
    }
    let principal = user.principal();
    let needs_tls = user.requires_tls
        || config.tls_required_for(crate::config::TlsChannel::Control, &principal, groups);
    if needs_tls && !control_tls {
        return Err(LoginDenied::TlsRequired);
    }
    if !verify_password(user, password) {
        return Err(LoginDenied::BadPassword);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn user(password: &str) -> User {
        let salt = new_salt();
        User {
            uid: 1,
            name: "alice".into(),
            primary_gid: 1,
            secondary_gids: vec![],
            flags: "3".into(),
            default_ratio: 3,
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
            password_hash: hash_password(&salt, password),
            password_salt: salt,
            requires_tls: false,
            last_login: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn config(extra: &str) -> Config {
        Config::parse(&format!(
            "sitepath /site\ndatapath /data\nport 21\nvalid_ip 0.0.0.0\ntls_control !*\n{}",
            extra
        ))
        .unwrap()
    }

    #[test]
    fn password_round_trip() {
        let u = user("hunter2");
        assert!(verify_password(&u, "hunter2"));
        assert!(!verify_password(&u, "hunter3"));
    }

    #[test]
    fn salts_differ_between_accounts() {
        assert_ne!(new_salt(), new_salt());
    }

    #[test]
    fn banned_and_expired_refused() {
        let cfg = config("banned_users alice\n");
        let u = user("pw");
        let peer: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            check_login(&cfg, &u, &[], "pw", peer, false),
            Err(LoginDenied::Banned)
        );

        let cfg = config("");
        let mut u = user("pw");
        u.expires_at = Some(chrono::Utc::now() - chrono::Duration::days(1));
        assert_eq!(
            check_login(&cfg, &u, &[], "pw", peer, false),
            Err(LoginDenied::Expired)
        );
    }

    #[test]
    fn tls_flag_on_user_forces_tls() {
        let cfg = config("");
        let mut u = user("pw");
        u.requires_tls = true;
        let peer: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            check_login(&cfg, &u, &[], "pw", peer, false),
            Err(LoginDenied::TlsRequired)
        );
        assert_eq!(check_login(&cfg, &u, &[], "pw", peer, true), Ok(()));
    }

    #[test]
    fn bouncer_only_rejects_direct_peers() {
        let cfg = config("bouncer_only true\nbouncer_ip 10.1.1.1\n");
        let u = user("pw");
        let direct: IpAddr = "10.0.0.2".parse().unwrap();
        let bounced: IpAddr = "10.1.1.1".parse().unwrap();
        assert_eq!(
            check_login(&cfg, &u, &[], "pw", direct, false),
            Err(LoginDenied::BouncerOnly)
        );
        assert_eq!(check_login(&cfg, &u, &[], "pw", bounced, false), Ok(()));
    }
}
