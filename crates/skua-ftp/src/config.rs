//! Configuration snapshot.
//!
//! The daemon's option file is line based: one option per line, whitespace
//! separated arguments, `#` comments, and `section NAME … endsection`
//! blocks. Parsing happens once; the engine only ever reads typed fields
//! from an immutable [`Config`] snapshot. Reloads build a fresh snapshot
//! with a bumped version and swap it into the shared [`ConfigHandle`];
//! in-flight sessions pick the new snapshot up at their next command
//! boundary.

use crate::acl::Acl;
use crate::error::{Error, Result};
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use skua_core::Principal;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

static LATEST_VERSION: AtomicU64 = AtomicU64::new(0);

/// Options the original daemon recognizes but never implemented. They parse
/// as no-ops so existing config files keep loading.
const NOT_IMPLEMENTED: &[&str] = &[
    "reload_config",
    "mmap_amount",
    "dl_send_file",
    "ul_buffered_force",
    "ignore_size",
    "file_dl_count",
    "use_dir_size",
    "pwd_path",
    "grp_path",
];

/// Keywords accepted for `-<keyword>` per-command ACL overrides.
const ACL_KEYWORDS: &[&str] = &[
    // control-channel verbs
    "user", "pass", "auth", "pbsz", "prot", "quit", "rein", "type", "mode", "stru", "pwd", "cwd",
    "cdup", "port", "eprt", "pasv", "epsv", "rest", "stor", "stou", "appe", "retr", "rnfr", "rnto",
    "dele", "rmd", "mkd", "size", "mdtm", "stat", "noop", "allo", "syst", "feat", "opts", "help",
    "list", "nlst", "mlsd", "mlst", "abor", "site",
    // site subcommands
    "adduser", "deluser", "change", "chown", "give", "giveown", "take", "nuke", "unnuke", "who",
    "stats", "sections", "addgroup", "delgroup", "passwd", "tagline",
];

/// A virtual-path glob compiled once at load.
#[derive(Debug, Clone)]
pub struct PathGlob {
    pattern: String,
    matcher: GlobMatcher,
}

impl PathGlob {
    pub fn new(pattern: &str) -> Result<Self> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| Error::Config(format!("bad path glob {}: {}", pattern, e)))?
            .compile_matcher();
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Longer patterns are considered more specific.
    pub fn specificity(&self) -> usize {
        self.pattern.len()
    }
}

/// A path glob guarded by an ACL: the shape of most permission options.
#[derive(Debug, Clone)]
pub struct AclWithPath {
    pub path: PathGlob,
    pub acl: Acl,
}

/// A message file guarded by an ACL (`welcome_msg`, `goodbye_msg`).
#[derive(Debug, Clone)]
pub struct MsgFile {
    pub file: PathBuf,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct HiddenFiles {
    pub path: PathGlob,
    pub masks: Vec<PathGlob>,
}

#[derive(Debug, Clone)]
pub struct SecureIp {
    pub min_fields: u32,
    pub allow_hostnames: bool,
    pub need_ident: bool,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct AllowFxp {
    pub downloads: bool,
    pub uploads: bool,
    pub logging: bool,
    pub acl: Acl,
}

impl Default for AllowFxp {
    fn default() -> Self {
        Self {
            downloads: false,
            uploads: false,
            logging: true,
            acl: Acl::allow_all(),
        }
    }
}

/// `speed_limit` / `maximum_speed` / `minimum_speed` record. Speeds are in
/// kilobytes per second; 0 means unlimited (or no floor).
#[derive(Debug, Clone)]
pub struct SpeedLimit {
    pub path: PathGlob,
    pub up_kbps: u64,
    pub down_kbps: u64,
    pub acl: Acl,
}

/// Effective caps for one transfer, after policy resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedCaps {
    pub max_up_kbps: Option<u64>,
    pub max_down_kbps: Option<u64>,
    pub min_up_kbps: Option<u64>,
    pub min_down_kbps: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CreditCheck {
    pub path: PathGlob,
    pub ratio: i32,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct CreditLoss {
    pub multiplier: i64,
    pub leechers: bool,
    pub path: PathGlob,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct PathFilter {
    pub group: String,
    pub message_file: PathBuf,
    pub patterns: Vec<Regex>,
}

#[derive(Debug, Clone)]
pub struct StatSection {
    pub keyword: String,
    pub path: PathGlob,
    pub separate_credits: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteCmdMethod {
    Exec,
    Text,
    Is,
}

/// A config-defined SITE command.
#[derive(Debug, Clone)]
pub struct SiteCmd {
    pub command: String,
    pub method: SiteCmdMethod,
    pub target: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CscriptHook {
    Pre,
    Post,
}

#[derive(Debug, Clone)]
pub struct Cscript {
    pub command: String,
    pub hook: CscriptHook,
    pub script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Requests {
    pub file: PathBuf,
    pub max: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    pub min: Duration,
    pub max: Duration,
    pub default: Duration,
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(60),
            max: Duration::from_secs(7200),
            default: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NukedirStyle {
    pub format: String,
    pub action: u32,
    pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct MsgPath {
    pub path: PathGlob,
    pub filename: PathBuf,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct PasvAddr {
    pub addr: String,
    pub primary: bool,
}

/// Inclusive port ranges, e.g. `pasv_ports 30000-30100 31000`.
#[derive(Debug, Clone, Default)]
pub struct Ports {
    pub ranges: Vec<(u16, u16)>,
}

impl Ports {
    fn parse(toks: &[String]) -> Result<Self> {
        let mut ranges = Vec::new();
        for tok in toks {
            let (lo, hi) = match tok.split_once('-') {
                Some((a, b)) => (parse_num::<u16>(a, "port")?, parse_num::<u16>(b, "port")?),
                None => {
                    let p = parse_num::<u16>(tok, "port")?;
                    (p, p)
                }
            };
            if lo > hi {
                return Err(Error::Config(format!("invalid port range {}", tok)));
            }
            ranges.push((lo, hi));
        }
        Ok(Self { ranges })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|(lo, hi)| (*hi as usize) - (*lo as usize) + 1)
            .sum()
    }

    /// Port at `index` into the flattened range list, wrapping around.
    pub fn port_at(&self, index: usize) -> Option<u16> {
        let total = self.len();
        if total == 0 {
            return None;
        }
        let mut idx = index % total;
        for (lo, hi) in &self.ranges {
            let span = (*hi as usize) - (*lo as usize) + 1;
            if idx < span {
                return Some(lo + idx as u16);
            }
            idx -= span;
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimXfers {
    pub max_downloads: u32,
    pub max_uploads: u32,
}

impl Default for SimXfers {
    fn default() -> Self {
        Self {
            max_downloads: 0,
            max_uploads: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alias {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct AsciiDownloads {
    pub max_kb: i64,
    pub masks: Vec<PathGlob>,
}

#[derive(Debug, Clone, Copy)]
pub struct DupeCheck {
    pub days: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpsvFxp {
    Allow,
    Deny,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekStart {
    Sunday,
    Monday,
}

/// A named grouping of virtual paths with optional independent credits and
/// ratio. A path belongs to the first section that matches, in declaration
/// order.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub paths: Vec<PathGlob>,
    pub separate_credits: bool,
    pub ratio: Option<i32>,
}

impl Section {
    fn new(name: String) -> Self {
        Self {
            name,
            paths: Vec::new(),
            separate_credits: false,
            ratio: None,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.paths.iter().any(|g| g.matches(path))
    }
}

/// Which channel a TLS requirement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsChannel {
    Control,
    Listing,
    Data,
    Fxp,
}

/// Immutable, versioned bundle of every option the engine consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub version: u64,

    // Required.
    pub sitepath: PathBuf,
    pub datapath: PathBuf,
    pub port: u16,
    pub valid_ip: Vec<String>,

    // Scalars.
    pub timezone: i32,
    pub free_space: u64,
    pub total_users: u32,
    pub empty_nuke: u64,
    pub multiplier_max: i32,
    pub max_sitecmd_lines: Option<u32>,
    pub maximum_ratio: i32,
    pub dir_size_depth: u32,
    pub dl_incomplete: bool,
    pub bouncer_only: bool,
    pub epsv_fxp: EpsvFxp,
    pub week_start: WeekStart,
    pub default_flags: String,
    pub sitename_long: String,
    pub sitename_short: String,
    pub login_prompt: String,
    pub email: String,

    // Simple lists.
    pub master: Vec<String>,
    pub bouncer_ip: Vec<String>,
    pub banned_users: Vec<String>,
    pub noretrieve: Vec<PathGlob>,
    pub xdupe: Vec<String>,
    pub calc_crc: Vec<String>,
    pub ignore_type: Vec<String>,
    pub idle_commands: Vec<String>,
    pub active_addr: Vec<String>,
    pub cdpath: Vec<String>,
    pub alias: Vec<Alias>,
    pub dupe_check: Option<DupeCheck>,
    pub ascii_downloads: Option<AsciiDownloads>,

    // Paths.
    pub banner: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub tls_certificate: Option<PathBuf>,

    // ACL-valued.
    pub hideuser: Acl,
    pub tls_control: Acl,
    pub tls_listing: Acl,
    pub tls_data: Acl,
    pub tls_fxp: Acl,
    /// `-<keyword>` and `custom-<cmd>` overrides.
    pub command_acls: HashMap<String, Acl>,

    // Path + ACL lists.
    pub delete: Vec<AclWithPath>,
    pub deleteown: Vec<AclWithPath>,
    pub overwrite: Vec<AclWithPath>,
    pub resume: Vec<AclWithPath>,
    pub rename: Vec<AclWithPath>,
    pub renameown: Vec<AclWithPath>,
    pub filemove: Vec<AclWithPath>,
    pub makedir: Vec<AclWithPath>,
    pub upload: Vec<AclWithPath>,
    pub download: Vec<AclWithPath>,
    pub nuke: Vec<AclWithPath>,
    pub hideinwho: Vec<AclWithPath>,
    pub freefile: Vec<AclWithPath>,
    pub nostats: Vec<AclWithPath>,
    pub hideowner: Vec<AclWithPath>,
    pub show_diz: Vec<AclWithPath>,
    pub pre_check: Vec<AclWithPath>,
    pub pre_dir_check: Vec<AclWithPath>,
    pub post_check: Vec<AclWithPath>,
    pub privpath: Vec<AclWithPath>,
    pub indexed: Vec<AclWithPath>,
    pub hidden_files: Vec<HiddenFiles>,
    pub welcome_msg: Vec<MsgFile>,
    pub goodbye_msg: Vec<MsgFile>,

    // Structured records.
    pub secure_ip: Vec<SecureIp>,
    pub allow_fxp: Vec<AllowFxp>,
    pub speed_limit: Vec<SpeedLimit>,
    pub maximum_speed: Vec<SpeedLimit>,
    pub minimum_speed: Vec<SpeedLimit>,
    pub creditcheck: Vec<CreditCheck>,
    pub creditloss: Vec<CreditLoss>,
    pub path_filter: Vec<PathFilter>,
    pub stat_section: Vec<StatSection>,
    pub site_cmd: Vec<SiteCmd>,
    pub cscript: Vec<Cscript>,
    pub requests: Option<Requests>,
    pub idle_timeout: IdleTimeout,
    pub nukedir_style: Option<NukedirStyle>,
    pub msg_path: Vec<MsgPath>,
    pub pasv_addr: Vec<PasvAddr>,
    pub pasv_ports: Ports,
    pub active_ports: Ports,
    pub sim_xfers: SimXfers,

    pub sections: Vec<Section>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 0,
            sitepath: PathBuf::new(),
            datapath: PathBuf::from("data"),
            port: 0,
            valid_ip: Vec::new(),
            timezone: 0,
            free_space: 100,
            total_users: 20,
            empty_nuke: 102400,
            multiplier_max: 10,
            max_sitecmd_lines: None,
            maximum_ratio: 10,
            dir_size_depth: 2,
            dl_incomplete: true,
            bouncer_only: false,
            epsv_fxp: EpsvFxp::Allow,
            week_start: WeekStart::Sunday,
            default_flags: "3".to_string(),
            sitename_long: "SITE NAME".to_string(),
            sitename_short: "SN".to_string(),
            login_prompt: String::new(),
            email: String::new(),
            master: Vec::new(),
            bouncer_ip: Vec::new(),
            banned_users: Vec::new(),
            noretrieve: Vec::new(),
            xdupe: Vec::new(),
            calc_crc: Vec::new(),
            ignore_type: Vec::new(),
            idle_commands: Vec::new(),
            active_addr: Vec::new(),
            cdpath: Vec::new(),
            alias: Vec::new(),
            dupe_check: None,
            ascii_downloads: None,
            banner: None,
            pidfile: None,
            tls_certificate: None,
            hideuser: Acl::deny_all(),
            tls_control: Acl::allow_all(),
            tls_listing: Acl::allow_all(),
            tls_data: Acl::deny_all(),
            tls_fxp: Acl::deny_all(),
            command_acls: HashMap::new(),
            delete: Vec::new(),
            deleteown: Vec::new(),
            overwrite: Vec::new(),
            resume: Vec::new(),
            rename: Vec::new(),
            renameown: Vec::new(),
            filemove: Vec::new(),
            makedir: Vec::new(),
            upload: Vec::new(),
            download: Vec::new(),
            nuke: Vec::new(),
            hideinwho: Vec::new(),
            freefile: Vec::new(),
            nostats: Vec::new(),
            hideowner: Vec::new(),
            show_diz: Vec::new(),
            pre_check: Vec::new(),
            pre_dir_check: Vec::new(),
            post_check: Vec::new(),
            privpath: Vec::new(),
            indexed: Vec::new(),
            hidden_files: Vec::new(),
            welcome_msg: Vec::new(),
            goodbye_msg: Vec::new(),
            secure_ip: Vec::new(),
            allow_fxp: Vec::new(),
            speed_limit: Vec::new(),
            maximum_speed: Vec::new(),
            minimum_speed: Vec::new(),
            creditcheck: Vec::new(),
            creditloss: Vec::new(),
            path_filter: Vec::new(),
            stat_section: Vec::new(),
            site_cmd: Vec::new(),
            cscript: Vec::new(),
            requests: None,
            idle_timeout: IdleTimeout::default(),
            nukedir_style: None,
            msg_path: Vec::new(),
            pasv_addr: Vec::new(),
            pasv_ports: Ports::default(),
            active_ports: Ports::default(),
            sim_xfers: SimXfers::default(),
            sections: Vec::new(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(tok: &str, what: &str) -> Result<T> {
    tok.parse::<T>()
        .map_err(|_| Error::Config(format!("invalid {}: {}", what, tok)))
}

fn parse_bool(tok: &str) -> Result<bool> {
    match tok.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(Error::Config(format!("invalid boolean: {}", other))),
    }
}

fn arity(opt: &str, toks: &[String], min: usize, max: Option<usize>) -> Result<()> {
    if toks.len() < min || max.map(|m| toks.len() > m).unwrap_or(false) {
        return Err(Error::Config(format!(
            "wrong number of parameters for {}",
            opt
        )));
    }
    Ok(())
}

fn acl_of(toks: &[String]) -> Acl {
    Acl::from_string(&toks.join(" "))
}

fn acl_with_path(opt: &str, toks: &[String]) -> Result<AclWithPath> {
    arity(opt, toks, 2, None)?;
    Ok(AclWithPath {
        path: PathGlob::new(&toks[0])?,
        acl: acl_of(&toks[1..]),
    })
}

struct Parser {
    cfg: Config,
    current_section: Option<Section>,
    seen: HashSet<String>,
    alais_warned: bool,
}

impl Parser {
    fn new() -> Self {
        Self {
            cfg: Config::default(),
            current_section: None,
            seen: HashSet::new(),
            alais_warned: false,
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut toks: Vec<String> = line
            .split_whitespace()
            .map(|t| t.replace("[:space:]", " "))
            .collect();
        if toks.is_empty() {
            return Ok(());
        }
        let opt = toks.remove(0).to_ascii_lowercase();
        self.seen.insert(opt.clone());

        if self.current_section.is_some() {
            self.parse_section_opt(&opt, &toks)
        } else {
            self.parse_global_opt(&opt, &toks)
        }
    }

    fn parse_section_opt(&mut self, opt: &str, toks: &[String]) -> Result<()> {
        let section = self
            .current_section
            .as_mut()
            .ok_or_else(|| Error::Config("not inside a section".into()))?;
        match opt {
            "path" => {
                arity(opt, toks, 1, Some(1))?;
                section.paths.push(PathGlob::new(&toks[0])?);
            }
            "separate_credits" => {
                arity(opt, toks, 1, Some(1))?;
                section.separate_credits = parse_bool(&toks[0])?;
            }
            "ratio" => {
                arity(opt, toks, 1, Some(1))?;
                let ratio: i32 = parse_num(&toks[0], "ratio")?;
                if ratio < 0 {
                    return Err(Error::Config("ratio must be zero or larger".into()));
                }
                section.ratio = Some(ratio);
            }
            "endsection" => {
                let done = self.current_section.take().unwrap();
                self.cfg.sections.push(done);
            }
            other => {
                return Err(Error::Config(format!(
                    "invalid section config option: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn parse_global_opt(&mut self, opt: &str, toks: &[String]) -> Result<()> {
        if NOT_IMPLEMENTED.contains(&opt) {
            warn!("ignoring not implemented config option: {}", opt);
            return Ok(());
        }

        if let Some(keyword) = opt.strip_prefix('-') {
            arity(opt, toks, 1, None)?;
            if !ACL_KEYWORDS.contains(&keyword) {
                return Err(Error::Config(format!("invalid command acl keyword: {}", keyword)));
            }
            self.cfg
                .command_acls
                .insert(keyword.to_string(), acl_of(toks));
            return Ok(());
        }
        if let Some(cmd) = opt.strip_prefix("custom-") {
            arity(opt, toks, 1, None)?;
            let command = cmd.to_ascii_uppercase();
            if !self.cfg.site_cmd.iter().any(|sc| sc.command == command) {
                return Err(Error::Config(format!(
                    "invalid custom command acl keyword: {}",
                    command
                )));
            }
            self.cfg.command_acls.insert(opt.to_string(), acl_of(toks));
            return Ok(());
        }

        match opt {
            "sitepath" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.sitepath = PathBuf::from(&toks[0]);
            }
            "datapath" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.datapath = PathBuf::from(&toks[0]);
            }
            "port" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.port = parse_num(&toks[0], "port")?;
            }
            "valid_ip" => {
                arity(opt, toks, 1, None)?;
                self.cfg.valid_ip.extend(toks.iter().cloned());
            }
            "timezone" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.timezone = parse_num(&toks[0], "timezone")?;
            }
            "free_space" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.free_space = parse_num(&toks[0], "free_space")?;
            }
            "total_users" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.total_users = parse_num(&toks[0], "total_users")?;
            }
            "empty_nuke" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.empty_nuke = parse_num(&toks[0], "empty_nuke")?;
            }
            "multiplier_max" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.multiplier_max = parse_num(&toks[0], "multiplier_max")?;
            }
            "max_sitecmd_lines" => {
                arity(opt, toks, 1, Some(1))?;
                let n: i64 = parse_num(&toks[0], "max_sitecmd_lines")?;
                self.cfg.max_sitecmd_lines = if n < 0 { None } else { Some(n as u32) };
            }
            "maximum_ratio" => {
                arity(opt, toks, 1, Some(1))?;
                let n: i32 = parse_num(&toks[0], "maximum_ratio")?;
                if n < 0 {
                    return Err(Error::Config("maximum_ratio must be zero or larger".into()));
                }
                self.cfg.maximum_ratio = n;
            }
            "dir_size_depth" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.dir_size_depth = parse_num(&toks[0], "dir_size_depth")?;
            }
            "dl_incomplete" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.dl_incomplete = parse_bool(&toks[0])?;
            }
            "bouncer_only" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.bouncer_only = parse_bool(&toks[0])?;
            }
            "epsv_fxp" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.epsv_fxp = match toks[0].to_ascii_lowercase().as_str() {
                    "allow" => EpsvFxp::Allow,
                    "deny" => EpsvFxp::Deny,
                    "force" => EpsvFxp::Force,
                    _ => return Err(Error::Config("epsv_fxp must be allow, deny or force".into())),
                };
            }
            "week_start" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.week_start = match toks[0].to_ascii_lowercase().as_str() {
                    "sunday" => WeekStart::Sunday,
                    "monday" => WeekStart::Monday,
                    _ => {
                        return Err(Error::Config(
                            "week_start must be either sunday or monday".into(),
                        ))
                    }
                };
            }
            "default_flags" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.default_flags = toks[0].clone();
            }
            "sitename_long" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.sitename_long = toks[0].clone();
            }
            "sitename_short" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.sitename_short = toks[0].clone();
            }
            "login_prompt" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.login_prompt = toks[0].clone();
            }
            "email" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.email = toks[0].clone();
            }
            "master" => {
                arity(opt, toks, 1, None)?;
                self.cfg.master.extend(toks.iter().cloned());
            }
            "bouncer_ip" => {
                arity(opt, toks, 1, None)?;
                self.cfg.bouncer_ip.extend(toks.iter().cloned());
            }
            "banned_users" => {
                arity(opt, toks, 1, None)?;
                self.cfg.banned_users.extend(toks.iter().cloned());
            }
            "noretrieve" => {
                arity(opt, toks, 1, None)?;
                for tok in toks {
                    self.cfg.noretrieve.push(PathGlob::new(tok)?);
                }
            }
            "xdupe" => {
                arity(opt, toks, 1, None)?;
                self.cfg.xdupe.extend(toks.iter().cloned());
            }
            "calc_crc" => {
                arity(opt, toks, 1, None)?;
                self.cfg.calc_crc.extend(toks.iter().cloned());
            }
            "ignore_type" => {
                arity(opt, toks, 1, None)?;
                self.cfg.ignore_type.extend(toks.iter().cloned());
            }
            "idle_commands" => {
                arity(opt, toks, 1, None)?;
                self.cfg
                    .idle_commands
                    .extend(toks.iter().map(|t| t.to_ascii_uppercase()));
            }
            "active_addr" => {
                arity(opt, toks, 1, None)?;
                self.cfg.active_addr.extend(toks.iter().cloned());
            }
            "cdpath" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.cdpath.push(toks[0].clone());
            }
            "alias" | "alais" => {
                arity(opt, toks, 2, Some(2))?;
                if opt == "alais" && !self.alais_warned {
                    warn!("config option 'alais' is deprecated; use 'alias'");
                    self.alais_warned = true;
                }
                self.cfg.alias.push(Alias {
                    name: toks[0].clone(),
                    target: toks[1].clone(),
                });
            }
            "dupe_check" => {
                arity(opt, toks, 2, Some(2))?;
                self.cfg.dupe_check = Some(DupeCheck {
                    days: parse_num(&toks[0], "dupe_check days")?,
                    enabled: parse_bool(&toks[1])?,
                });
            }
            "ascii_downloads" => {
                arity(opt, toks, 1, None)?;
                let max_kb = if toks[0] == "*" {
                    -1
                } else {
                    parse_num(&toks[0], "ascii_downloads size")?
                };
                let mut masks = Vec::new();
                for tok in &toks[1..] {
                    masks.push(PathGlob::new(tok)?);
                }
                self.cfg.ascii_downloads = Some(AsciiDownloads { max_kb, masks });
            }
            "banner" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.banner = Some(PathBuf::from(&toks[0]));
            }
            "pidfile" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.pidfile = Some(PathBuf::from(&toks[0]));
            }
            "tls_certificate" => {
                arity(opt, toks, 1, Some(1))?;
                self.cfg.tls_certificate = Some(PathBuf::from(&toks[0]));
            }
            "hideuser" => {
                arity(opt, toks, 1, None)?;
                self.cfg.hideuser = acl_of(toks);
            }
            "tls_control" => self.cfg.tls_control = acl_of(toks),
            "tls_listing" => self.cfg.tls_listing = acl_of(toks),
            "tls_data" => self.cfg.tls_data = acl_of(toks),
            "tls_fxp" => self.cfg.tls_fxp = acl_of(toks),
            "delete" => self.cfg.delete.push(acl_with_path(opt, toks)?),
            "deleteown" => self.cfg.deleteown.push(acl_with_path(opt, toks)?),
            "overwrite" => self.cfg.overwrite.push(acl_with_path(opt, toks)?),
            "resume" => self.cfg.resume.push(acl_with_path(opt, toks)?),
            "rename" => self.cfg.rename.push(acl_with_path(opt, toks)?),
            "renameown" => self.cfg.renameown.push(acl_with_path(opt, toks)?),
            "filemove" => self.cfg.filemove.push(acl_with_path(opt, toks)?),
            "makedir" => self.cfg.makedir.push(acl_with_path(opt, toks)?),
            "upload" => self.cfg.upload.push(acl_with_path(opt, toks)?),
            "download" => self.cfg.download.push(acl_with_path(opt, toks)?),
            "nuke" => self.cfg.nuke.push(acl_with_path(opt, toks)?),
            "hideinwho" => self.cfg.hideinwho.push(acl_with_path(opt, toks)?),
            "freefile" => self.cfg.freefile.push(acl_with_path(opt, toks)?),
            "nostats" => self.cfg.nostats.push(acl_with_path(opt, toks)?),
            "hideowner" => self.cfg.hideowner.push(acl_with_path(opt, toks)?),
            "show_diz" => self.cfg.show_diz.push(acl_with_path(opt, toks)?),
            "pre_check" => self.cfg.pre_check.push(acl_with_path(opt, toks)?),
            "pre_dir_check" => self.cfg.pre_dir_check.push(acl_with_path(opt, toks)?),
            "post_check" => self.cfg.post_check.push(acl_with_path(opt, toks)?),
            "indexed" => self.cfg.indexed.push(acl_with_path(opt, toks)?),
            "privpath" => {
                arity(opt, toks, 1, None)?;
                self.cfg.privpath.push(AclWithPath {
                    path: PathGlob::new(&toks[0])?,
                    acl: if toks.len() > 1 {
                        acl_of(&toks[1..])
                    } else {
                        Acl::deny_all()
                    },
                });
            }
            "hidden_files" => {
                arity(opt, toks, 2, None)?;
                let path = PathGlob::new(&toks[0])?;
                let mut masks = Vec::new();
                for tok in &toks[1..] {
                    masks.push(PathGlob::new(tok)?);
                }
                self.cfg.hidden_files.push(HiddenFiles { path, masks });
            }
            "welcome_msg" | "goodbye_msg" => {
                arity(opt, toks, 2, None)?;
                let entry = MsgFile {
                    file: PathBuf::from(&toks[0]),
                    acl: acl_of(&toks[1..]),
                };
                if opt == "welcome_msg" {
                    self.cfg.welcome_msg.push(entry);
                } else {
                    self.cfg.goodbye_msg.push(entry);
                }
            }
            "secure_ip" => {
                arity(opt, toks, 4, None)?;
                self.cfg.secure_ip.push(SecureIp {
                    min_fields: parse_num(&toks[0], "secure_ip fields")?,
                    allow_hostnames: parse_bool(&toks[1])?,
                    need_ident: parse_bool(&toks[2])?,
                    acl: acl_of(&toks[3..]),
                });
            }
            "allow_fxp" => {
                arity(opt, toks, 3, None)?;
                self.cfg.allow_fxp.push(AllowFxp {
                    downloads: parse_bool(&toks[0])?,
                    uploads: parse_bool(&toks[1])?,
                    logging: parse_bool(&toks[2])?,
                    acl: if toks.len() > 3 {
                        acl_of(&toks[3..])
                    } else {
                        Acl::allow_all()
                    },
                });
            }
            "speed_limit" | "maximum_speed" | "minimum_speed" => {
                arity(opt, toks, 3, None)?;
                let entry = SpeedLimit {
                    path: PathGlob::new(&toks[0])?,
                    up_kbps: parse_num(&toks[1], "speed")?,
                    down_kbps: parse_num(&toks[2], "speed")?,
                    acl: if toks.len() > 3 {
                        acl_of(&toks[3..])
                    } else {
                        Acl::allow_all()
                    },
                };
                match opt {
                    "speed_limit" => self.cfg.speed_limit.push(entry),
                    "maximum_speed" => self.cfg.maximum_speed.push(entry),
                    _ => self.cfg.minimum_speed.push(entry),
                }
            }
            "creditcheck" => {
                arity(opt, toks, 3, None)?;
                self.cfg.creditcheck.push(CreditCheck {
                    path: PathGlob::new(&toks[0])?,
                    ratio: parse_num(&toks[1], "creditcheck ratio")?,
                    acl: acl_of(&toks[2..]),
                });
            }
            "creditloss" => {
                arity(opt, toks, 4, None)?;
                self.cfg.creditloss.push(CreditLoss {
                    multiplier: parse_num(&toks[0], "creditloss multiplier")?,
                    leechers: parse_bool(&toks[1])?,
                    path: PathGlob::new(&toks[2])?,
                    acl: acl_of(&toks[3..]),
                });
            }
            "path-filter" => {
                arity(opt, toks, 3, None)?;
                let mut patterns = Vec::new();
                for tok in &toks[2..] {
                    patterns.push(
                        Regex::new(tok)
                            .map_err(|e| Error::Config(format!("bad path-filter regex: {}", e)))?,
                    );
                }
                self.cfg.path_filter.push(PathFilter {
                    group: toks[0].clone(),
                    message_file: PathBuf::from(&toks[1]),
                    patterns,
                });
            }
            "stat_section" => {
                arity(opt, toks, 3, Some(3))?;
                self.cfg.stat_section.push(StatSection {
                    keyword: toks[0].clone(),
                    path: PathGlob::new(&toks[1])?,
                    separate_credits: parse_bool(&toks[2])?,
                });
            }
            "site_cmd" => {
                arity(opt, toks, 3, None)?;
                let method = match toks[1].to_ascii_lowercase().as_str() {
                    "exec" => SiteCmdMethod::Exec,
                    "text" => SiteCmdMethod::Text,
                    "is" => SiteCmdMethod::Is,
                    other => {
                        return Err(Error::Config(format!("invalid site_cmd method: {}", other)))
                    }
                };
                self.cfg.site_cmd.push(SiteCmd {
                    command: toks[0].to_ascii_uppercase(),
                    method,
                    target: toks[2].clone(),
                    args: toks[3..].to_vec(),
                });
            }
            "cscript" => {
                arity(opt, toks, 3, Some(3))?;
                let hook = match toks[1].to_ascii_lowercase().as_str() {
                    "pre" => CscriptHook::Pre,
                    "post" => CscriptHook::Post,
                    other => return Err(Error::Config(format!("invalid cscript hook: {}", other))),
                };
                self.cfg.cscript.push(Cscript {
                    command: toks[0].to_ascii_uppercase(),
                    hook,
                    script: PathBuf::from(&toks[2]),
                });
            }
            "requests" => {
                arity(opt, toks, 2, Some(2))?;
                self.cfg.requests = Some(Requests {
                    file: PathBuf::from(&toks[0]),
                    max: parse_num(&toks[1], "requests max")?,
                });
            }
            "idle_timeout" => {
                arity(opt, toks, 3, Some(3))?;
                self.cfg.idle_timeout = IdleTimeout {
                    default: Duration::from_secs(parse_num(&toks[0], "idle_timeout")?),
                    min: Duration::from_secs(parse_num(&toks[1], "idle_timeout")?),
                    max: Duration::from_secs(parse_num(&toks[2], "idle_timeout")?),
                };
            }
            "nukedir_style" => {
                arity(opt, toks, 3, Some(3))?;
                self.cfg.nukedir_style = Some(NukedirStyle {
                    format: toks[0].clone(),
                    action: parse_num(&toks[1], "nukedir_style action")?,
                    max_bytes: parse_num(&toks[2], "nukedir_style bytes")?,
                });
            }
            "msg_path" => {
                arity(opt, toks, 2, None)?;
                self.cfg.msg_path.push(MsgPath {
                    path: PathGlob::new(&toks[0])?,
                    filename: PathBuf::from(&toks[1]),
                    acl: if toks.len() > 2 {
                        acl_of(&toks[2..])
                    } else {
                        Acl::allow_all()
                    },
                });
            }
            "pasv_addr" => {
                arity(opt, toks, 1, Some(2))?;
                self.cfg.pasv_addr.push(PasvAddr {
                    addr: toks[0].clone(),
                    primary: toks.len() > 1,
                });
            }
            "pasv_ports" => {
                arity(opt, toks, 1, None)?;
                self.cfg.pasv_ports = Ports::parse(toks)?;
            }
            "active_ports" => {
                arity(opt, toks, 1, None)?;
                self.cfg.active_ports = Ports::parse(toks)?;
            }
            "sim_xfers" => {
                arity(opt, toks, 2, Some(2))?;
                self.cfg.sim_xfers = SimXfers {
                    max_downloads: parse_num(&toks[0], "sim_xfers")?,
                    max_uploads: parse_num(&toks[1], "sim_xfers")?,
                };
            }
            "section" => {
                arity(opt, toks, 1, Some(1))?;
                let name = toks[0].to_ascii_uppercase();
                if self.cfg.sections.iter().any(|s| s.name == name) {
                    return Err(Error::Config(format!("section {} already exists", name)));
                }
                self.current_section = Some(Section::new(name));
            }
            other => {
                return Err(Error::Config(format!(
                    "invalid global config option: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Config> {
        if let Some(section) = self.current_section.take() {
            return Err(Error::Config(format!(
                "section {} missing endsection",
                section.name
            )));
        }
        for required in ["sitepath", "datapath", "port", "valid_ip"] {
            if !self.seen.contains(required) {
                return Err(Error::Config(format!(
                    "required setting missing: {}",
                    required
                )));
            }
        }
        if self.cfg.login_prompt.is_empty() {
            self.cfg.login_prompt = format!("{}: skua connected.", self.cfg.sitename_long);
        }
        if self.cfg.allow_fxp.is_empty() {
            self.cfg.allow_fxp.push(AllowFxp::default());
        }
        self.cfg.version = LATEST_VERSION.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.cfg)
    }
}

impl Config {
    /// Parse a config from its text form. Errors are collected per line so a
    /// broken file reports every problem at once.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser::new();
        let mut errors = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if let Err(e) = parser.parse_line(line) {
                errors.push(format!("line {}: {}", lineno + 1, e));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }
        parser.finish()
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("unable to open config file: {}", e)))?;
        Self::parse(&text)
    }

    pub fn is_bouncer(&self, ip: &str) -> bool {
        self.bouncer_ip.iter().any(|b| b == ip)
    }

    /// First section claiming `path`, in declaration order.
    pub fn section_for(&self, path: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.matches(path))
    }

    /// First entry in `list` whose path glob matches, in declaration order.
    pub fn first_matching<'a>(
        &self,
        list: &'a [AclWithPath],
        path: &str,
    ) -> Option<&'a AclWithPath> {
        list.iter().find(|e| e.path.matches(path))
    }

    /// Decide a path-scoped operation: the first path-matching entry's ACL
    /// wins; with no matching entry the operation falls back to `default`.
    pub fn path_op_allowed(
        &self,
        list: &[AclWithPath],
        path: &str,
        principal: &Principal,
        groups: &[String],
        default: bool,
    ) -> bool {
        match self.first_matching(list, path) {
            Some(entry) => entry.acl.check(principal, groups),
            None => default,
        }
    }

    /// Per-command ACL gate. Commands without a configured override are
    /// allowed; state gating happens in the dispatcher.
    pub fn allowed(&self, keyword: &str, principal: &Principal, groups: &[String]) -> bool {
        match self.command_acls.get(&keyword.to_ascii_lowercase()) {
            Some(acl) => acl.check(principal, groups),
            None => true,
        }
    }

    pub fn tls_required_for(
        &self,
        channel: TlsChannel,
        principal: &Principal,
        groups: &[String],
    ) -> bool {
        let acl = match channel {
            TlsChannel::Control => &self.tls_control,
            TlsChannel::Listing => &self.tls_listing,
            TlsChannel::Data => &self.tls_data,
            TlsChannel::Fxp => &self.tls_fxp,
        };
        acl.check(principal, groups)
    }

    /// Resolve the speed caps for one transfer.
    ///
    /// Most-specific (longest) matching path wins within each family, ties
    /// broken by last declaration. `speed_limit` and `maximum_speed` both
    /// impose ceilings; `minimum_speed` imposes a floor.
    pub fn speed_caps(&self, path: &str, principal: &Principal, groups: &[String]) -> SpeedCaps {
        fn best<'a>(
            entries: &'a [SpeedLimit],
            path: &str,
            principal: &Principal,
            groups: &[String],
        ) -> Option<&'a SpeedLimit> {
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.path.matches(path) && e.acl.check(principal, groups))
                // max_by_key keeps the last entry on ties.
                .max_by_key(|(i, e)| (e.path.specificity(), *i))
                .map(|(_, e)| e)
        }

        let ceiling = best(&self.speed_limit, path, principal, groups)
            .into_iter()
            .chain(best(&self.maximum_speed, path, principal, groups))
            .max_by_key(|e| (e.path.specificity(),));
        let floor = best(&self.minimum_speed, path, principal, groups);

        let nonzero = |v: u64| if v == 0 { None } else { Some(v) };
        SpeedCaps {
            max_up_kbps: ceiling.and_then(|e| nonzero(e.up_kbps)),
            max_down_kbps: ceiling.and_then(|e| nonzero(e.down_kbps)),
            min_up_kbps: floor.and_then(|e| nonzero(e.up_kbps)),
            min_down_kbps: floor.and_then(|e| nonzero(e.down_kbps)),
        }
    }

    /// Ratio override from `creditcheck`, if one matches this path and
    /// principal.
    pub fn credit_ratio(&self, path: &str, principal: &Principal, groups: &[String]) -> Option<i32> {
        self.creditcheck
            .iter()
            .find(|c| c.path.matches(path) && c.acl.check(principal, groups))
            .map(|c| c.ratio)
    }

    /// Download debit multiplier from `creditloss`. `is_leech` suppresses
    /// the loss unless the entry says leechers pay too.
    pub fn credit_loss_multiplier(
        &self,
        path: &str,
        principal: &Principal,
        groups: &[String],
        is_leech: bool,
    ) -> i64 {
        match self
            .creditloss
            .iter()
            .find(|c| c.path.matches(path) && c.acl.check(principal, groups))
        {
            Some(entry) => {
                if is_leech && !entry.leechers {
                    0
                } else {
                    entry.multiplier.min(self.multiplier_max as i64)
                }
            }
            None => {
                if is_leech {
                    0
                } else {
                    1
                }
            }
        }
    }

    /// FXP policy for one transfer direction: `(allowed, log)`.
    pub fn fxp_allowed(
        &self,
        direction: skua_core::TransferDirection,
        principal: &Principal,
        groups: &[String],
    ) -> (bool, bool) {
        for entry in &self.allow_fxp {
            if entry.acl.check(principal, groups) {
                let allowed = match direction {
                    skua_core::TransferDirection::Download => entry.downloads,
                    skua_core::TransferDirection::Upload => entry.uploads,
                };
                return (allowed, entry.logging);
            }
        }
        (false, true)
    }

    /// Passive address to advertise to `peer_ip`. Bouncer peers get the
    /// first non-primary entry; everyone else the primary (or the only)
    /// entry. None means advertise the data socket's local address.
    pub fn pasv_addr_for(&self, peer_ip: &str) -> Option<&PasvAddr> {
        if self.pasv_addr.is_empty() {
            return None;
        }
        if self.is_bouncer(peer_ip) {
            if let Some(entry) = self.pasv_addr.iter().find(|a| !a.primary) {
                return Some(entry);
            }
        }
        self.pasv_addr
            .iter()
            .find(|a| a.primary)
            .or_else(|| self.pasv_addr.first())
    }

    /// Whether a download of `name` (`size_kb` kilobytes) runs under ASCII
    /// translation regardless of the session's transfer type. `-1` as the
    /// configured size means no limit.
    pub fn ascii_download(&self, name: &str, size_kb: i64) -> bool {
        match &self.ascii_downloads {
            Some(ad) => {
                (ad.max_kb < 0 || size_kb <= ad.max_kb)
                    && ad.masks.iter().any(|m| m.matches(name))
            }
            None => false,
        }
    }

    /// Whether `name` in directory `dir_path` is masked by `hidden_files`.
    pub fn is_hidden_file(&self, dir_path: &str, name: &str) -> bool {
        self.hidden_files
            .iter()
            .filter(|h| h.path.matches(dir_path))
            .any(|h| h.masks.iter().any(|m| m.matches(name)))
    }

    /// Path filters applying to any of the principal's groups (or `*`).
    pub fn path_filters_for<'a>(&'a self, groups: &[String]) -> Vec<&'a PathFilter> {
        self.path_filter
            .iter()
            .filter(|f| f.group == "*" || groups.iter().any(|g| *g == f.group))
            .collect()
    }

    pub fn clamp_idle(&self, requested: Duration) -> Duration {
        requested.clamp(self.idle_timeout.min, self.idle_timeout.max)
    }
}

/// Atomically swappable snapshot reference. Sessions acquire the current
/// snapshot once per command.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.inner.read().unwrap().clone()
    }

    /// Install a freshly loaded snapshot. Failed reloads simply never call
    /// this, keeping the prior snapshot live.
    pub fn replace(&self, config: Config) {
        *self.inner.write().unwrap() = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skua_core::TransferDirection;

    fn principal(name: &str, flags: &str) -> Principal {
        Principal {
            uid: 1,
            name: name.into(),
            primary_gid: 10,
            gids: vec![10],
            flags: flags.into(),
        }
    }

    const BASE: &str = "\
sitepath /site
datapath /data
port 2121
valid_ip 0.0.0.0
";

    #[test]
    fn required_settings_enforced() {
        assert!(Config::parse("port 2121\n").is_err());
        assert!(Config::parse(BASE).is_ok());
    }

    #[test]
    fn version_increments_per_load() {
        let a = Config::parse(BASE).unwrap();
        let b = Config::parse(BASE).unwrap();
        assert!(b.version > a.version);
    }

    #[test]
    fn scalars_and_enums() {
        let text = format!(
            "{}dl_incomplete false\nepsv_fxp deny\nweek_start monday\nmax_sitecmd_lines 20\n",
            BASE
        );
        let cfg = Config::parse(&text).unwrap();
        assert!(!cfg.dl_incomplete);
        assert_eq!(cfg.epsv_fxp, EpsvFxp::Deny);
        assert_eq!(cfg.week_start, WeekStart::Monday);
        assert_eq!(cfg.max_sitecmd_lines, Some(20));
    }

    #[test]
    fn unknown_option_is_an_error_with_line_number() {
        let err = Config::parse(&format!("{}frobnicate 1\n", BASE)).unwrap_err();
        assert!(err.to_string().contains("line 5"));
    }

    #[test]
    fn not_implemented_options_are_recognized_noops() {
        let text = format!("{}mmap_amount 4096\ndl_send_file true\npwd_path /x\n", BASE);
        assert!(Config::parse(&text).is_ok());
    }

    #[test]
    fn alais_is_accepted_as_alias() {
        let cfg = Config::parse(&format!("{}alais inc /incoming\n", BASE)).unwrap();
        assert_eq!(cfg.alias.len(), 1);
        assert_eq!(cfg.alias[0].name, "inc");
    }

    #[test]
    fn sections_first_match_wins_in_declaration_order() {
        let text = format!(
            "{}section MP3\npath /mp3/*\nratio 3\nendsection\nsection ALL\npath /*\nseparate_credits true\nendsection\n",
            BASE
        );
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.section_for("/mp3/x").unwrap().name, "MP3");
        assert_eq!(cfg.section_for("/iso/x").unwrap().name, "ALL");
        assert!(cfg.section_for("/iso/x").unwrap().separate_credits);
    }

    #[test]
    fn duplicate_section_rejected() {
        let text = format!(
            "{}section A\npath /a/*\nendsection\nsection A\npath /b/*\nendsection\n",
            BASE
        );
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn command_acl_keywords() {
        let cfg = Config::parse(&format!("{}-retr !bob *\n", BASE)).unwrap();
        assert!(!cfg.allowed("RETR", &principal("bob", "3"), &[]));
        assert!(cfg.allowed("RETR", &principal("alice", "3"), &[]));
        // No override configured: allowed.
        assert!(cfg.allowed("STOR", &principal("bob", "3"), &[]));
        // Unknown keyword is a load error.
        assert!(Config::parse(&format!("{}-bogus *\n", BASE)).is_err());
    }

    #[test]
    fn custom_site_cmd_acl_requires_definition() {
        assert!(Config::parse(&format!("{}custom-wipe *\n", BASE)).is_err());
        let text = format!("{}site_cmd WIPE exec /bin/wipe\ncustom-wipe -1\n", BASE);
        let cfg = Config::parse(&text).unwrap();
        assert!(cfg.command_acls.contains_key("custom-wipe"));
    }

    #[test]
    fn path_op_default_and_first_match() {
        let text = format!("{}upload /priv* !*\nupload /* *\n", BASE);
        let cfg = Config::parse(&text).unwrap();
        let p = principal("alice", "3");
        assert!(!cfg.path_op_allowed(&cfg.upload, "/priv/x", &p, &[], true));
        assert!(cfg.path_op_allowed(&cfg.upload, "/pub/x", &p, &[], true));
        // No entries at all: the default decides.
        let bare = Config::parse(BASE).unwrap();
        assert!(bare.path_op_allowed(&bare.upload, "/pub/x", &p, &[], true));
        assert!(!bare.path_op_allowed(&bare.privpath, "/pub/x", &p, &[], false));
    }

    #[test]
    fn speed_caps_most_specific_then_last_wins() {
        let text = format!(
            "{}speed_limit /* 1000 1000\nspeed_limit /iso/* 200 300\nspeed_limit /iso/* 400 500\nminimum_speed /iso/* 50 60\n",
            BASE
        );
        let cfg = Config::parse(&text).unwrap();
        let p = principal("alice", "3");
        let caps = cfg.speed_caps("/iso/file.bin", &p, &[]);
        // /iso/* is more specific than /*; the later /iso/* declaration wins.
        assert_eq!(caps.max_up_kbps, Some(400));
        assert_eq!(caps.max_down_kbps, Some(500));
        assert_eq!(caps.min_down_kbps, Some(60));
        let caps = cfg.speed_caps("/mp3/file", &p, &[]);
        assert_eq!(caps.max_up_kbps, Some(1000));
        assert_eq!(caps.min_up_kbps, None);
    }

    #[test]
    fn ports_round_robin_indexing() {
        let ports = Ports::parse(&["30000-30002".into(), "31000".into()]).unwrap();
        assert_eq!(ports.len(), 4);
        assert_eq!(ports.port_at(0), Some(30000));
        assert_eq!(ports.port_at(3), Some(31000));
        assert_eq!(ports.port_at(4), Some(30000));
    }

    #[test]
    fn fxp_policy_first_acl_match() {
        let text = format!("{}allow_fxp false true false -1\nallow_fxp true true true *\n", BASE);
        let cfg = Config::parse(&text).unwrap();
        let op = principal("op", "1");
        let pleb = principal("pleb", "3");
        assert_eq!(cfg.fxp_allowed(TransferDirection::Download, &op, &[]), (false, false));
        assert_eq!(cfg.fxp_allowed(TransferDirection::Download, &pleb, &[]), (true, true));
    }

    #[test]
    fn default_fxp_policy_denies() {
        let cfg = Config::parse(BASE).unwrap();
        let p = principal("x", "3");
        assert_eq!(cfg.fxp_allowed(TransferDirection::Upload, &p, &[]), (false, true));
    }

    #[test]
    fn pasv_addr_selection() {
        let text = format!(
            "{}bouncer_ip 10.9.9.9\npasv_addr 1.2.3.4 primary\npasv_addr 5.6.7.8\n",
            BASE
        );
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.pasv_addr_for("8.8.8.8").unwrap().addr, "1.2.3.4");
        assert_eq!(cfg.pasv_addr_for("10.9.9.9").unwrap().addr, "5.6.7.8");
    }

    #[test]
    fn ascii_downloads_masks_and_size() {
        let cfg = Config::parse(&format!("{}ascii_downloads 64 *.txt *.diz\n", BASE)).unwrap();
        assert!(cfg.ascii_download("readme.txt", 2));
        assert!(cfg.ascii_download("file_id.diz", 64));
        assert!(!cfg.ascii_download("readme.txt", 65));
        assert!(!cfg.ascii_download("big.bin", 2));

        // "*" as the size means any size qualifies.
        let cfg = Config::parse(&format!("{}ascii_downloads * *.nfo\n", BASE)).unwrap();
        assert!(cfg.ascii_download("rel.nfo", 1 << 20));

        // Unconfigured: never forced.
        let cfg = Config::parse(BASE).unwrap();
        assert!(!cfg.ascii_download("readme.txt", 1));
    }

    #[test]
    fn hidden_files_masks() {
        let text = format!("{}hidden_files /* .* *.lock\n", BASE);
        let cfg = Config::parse(&text).unwrap();
        assert!(cfg.is_hidden_file("/pub", ".secret"));
        assert!(cfg.is_hidden_file("/pub", "x.lock"));
        assert!(!cfg.is_hidden_file("/pub", "readme.txt"));
    }

    #[test]
    fn tls_defaults_follow_original() {
        let cfg = Config::parse(BASE).unwrap();
        let p = principal("x", "3");
        assert!(cfg.tls_required_for(TlsChannel::Control, &p, &[]));
        assert!(cfg.tls_required_for(TlsChannel::Listing, &p, &[]));
        assert!(!cfg.tls_required_for(TlsChannel::Data, &p, &[]));
        assert!(!cfg.tls_required_for(TlsChannel::Fxp, &p, &[]));
    }

    #[test]
    fn handle_swap_is_visible_to_new_acquisitions() {
        let handle = ConfigHandle::new(Config::parse(BASE).unwrap());
        let old = handle.current();
        handle.replace(Config::parse(&format!("{}timezone 2\n", BASE)).unwrap());
        let new = handle.current();
        assert_eq!(old.timezone, 0);
        assert_eq!(new.timezone, 2);
        assert!(new.version > old.version);
    }
}
