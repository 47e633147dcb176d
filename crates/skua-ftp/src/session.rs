//! The per-client control-connection state machine.
//!
//! One session owns its control channel and (at most) one pending data
//! plan. Commands are processed strictly in order; the next command is not
//! read until the previous one has its final reply, with the single
//! exception of the transfer loop, which keeps reading the control channel
//! so ABOR can cancel an in-flight transfer.

use crate::audit::AuditEvent;
use crate::auth::{self, LoginDenied};
use crate::channel::ControlChannel;
use crate::config::{Config, EpsvFxp, TlsChannel};
use crate::data::{self, DataPlan, DataStream};
use crate::error::{Error, Result};
use crate::listing::{self, ListingKind};
use crate::server::SharedState;
use crate::site::{self, SiteCtx};
use crate::transfer::{self, TransferCtx, UploadMode};
use crate::vfs::{self, Vfs};
use skua_core::{Owner, Principal, TransferDirection, User};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_LOGIN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    AwaitingUser,
    AwaitingPass,
    Authenticated,
}

const IN_AWAIT_USER: u8 = 0b001;
const IN_AWAIT_PASS: u8 = 0b010;
const IN_AUTHED: u8 = 0b100;
const IN_ANY: u8 = 0b111;

impl LoginState {
    fn bit(self) -> u8 {
        match self {
            LoginState::AwaitingUser => IN_AWAIT_USER,
            LoginState::AwaitingPass => IN_AWAIT_PASS,
            LoginState::Authenticated => IN_AUTHED,
        }
    }
}

/// Dispatch-table row: which states admit the verb and how many arguments
/// it needs. The per-command ACL keyword is the lowercased verb itself.
struct CommandDef {
    name: &'static str,
    states: u8,
    min_args: usize,
}

#[rustfmt::skip]
static COMMANDS: &[CommandDef] = &[
    CommandDef { name: "USER", states: IN_ANY,        min_args: 1 },
    CommandDef { name: "PASS", states: IN_AWAIT_PASS, min_args: 0 },
    CommandDef { name: "AUTH", states: IN_AWAIT_USER | IN_AWAIT_PASS, min_args: 1 },
    CommandDef { name: "PBSZ", states: IN_ANY,        min_args: 1 },
    CommandDef { name: "PROT", states: IN_ANY,        min_args: 1 },
    CommandDef { name: "QUIT", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "REIN", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "TYPE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "MODE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "STRU", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "PWD",  states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "CWD",  states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "CDUP", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "PORT", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "EPRT", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "PASV", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "EPSV", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "REST", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "STOR", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "STOU", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "APPE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "RETR", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "RNFR", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "RNTO", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "DELE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "RMD",  states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "MKD",  states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "SIZE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "MDTM", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "STAT", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "NOOP", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "ALLO", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "SYST", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "FEAT", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "OPTS", states: IN_ANY,        min_args: 1 },
    CommandDef { name: "HELP", states: IN_ANY,        min_args: 0 },
    CommandDef { name: "LIST", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "NLST", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "MLSD", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "MLST", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "SITE", states: IN_AUTHED,     min_args: 1 },
    CommandDef { name: "ABOR", states: IN_AUTHED,     min_args: 0 },
    CommandDef { name: "MIC",  states: IN_ANY,        min_args: 1 },
    CommandDef { name: "CONF", states: IN_ANY,        min_args: 1 },
    CommandDef { name: "ENC",  states: IN_ANY,        min_args: 1 },
];

fn lookup_command(verb: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|def| def.name == verb)
}

fn split_command(line: &str) -> (String, String) {
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.trim().to_ascii_uppercase(), arg.trim().to_string()),
        None => (line.trim().to_ascii_uppercase(), String::new()),
    }
}

pub struct Session {
    id: Uuid,
    shared: Arc<SharedState>,
    channel: ControlChannel,
    local_ip: IpAddr,
    state: LoginState,
    pending_name: Option<String>,
    user: Option<User>,
    principal: Option<Principal>,
    group_names: Vec<String>,
    cwd: String,
    ascii: bool,
    pbsz_done: bool,
    prot_private: bool,
    data_plan: DataPlan,
    rename_from: Option<String>,
    restart_offset: u64,
    login_attempts: u32,
    closing: bool,
}

impl Session {
    pub fn new(id: Uuid, shared: Arc<SharedState>, stream: TcpStream, peer: SocketAddr) -> Self {
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
        Self {
            id,
            shared,
            channel: ControlChannel::new(stream, peer),
            local_ip,
            state: LoginState::AwaitingUser,
            pending_name: None,
            user: None,
            principal: None,
            group_names: Vec::new(),
            cwd: "/".to_string(),
            ascii: true,
            pbsz_done: false,
            prot_private: false,
            data_plan: DataPlan::None,
            rename_from: None,
            restart_offset: 0,
            login_attempts: 0,
            closing: false,
        }
    }

    fn username(&self) -> Option<String> {
        self.user.as_ref().map(|u| u.name.clone())
    }

    /// Drive the session to completion. Returns the authenticated username
    /// for the disconnect audit record.
    pub async fn run(&mut self) -> Result<Option<String>> {
        self.greet().await?;

        while !self.closing {
            let cfg = self.shared.config.current();
            let line = match tokio::time::timeout(
                cfg.idle_timeout.default,
                self.channel.read_line(),
            )
            .await
            {
                Err(_) => {
                    self.channel.reply(421, "Timeout: closing control connection.").await.ok();
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(line))) => line,
                Ok(Err(Error::Protocol(msg))) => {
                    debug!(session = %self.id, "protocol error: {}", msg);
                    self.channel.reply(500, "Syntax error.").await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
            };
            if line.is_empty() {
                continue;
            }
            let (verb, arg) = split_command(&line);
            self.shared.tracker.set_command(&self.id, &verb);

            if let Err(e) = self.dispatch(&cfg, &verb, &arg).await {
                if !e.is_recoverable() {
                    return Err(e);
                }
                AuditEvent::CommandError {
                    session_id: self.id,
                    username: self.username(),
                    command: verb.clone(),
                    path: None,
                    error: e.to_string(),
                }
                .log();
                self.channel.reply(e.reply_code(), &e.client_message()).await?;
            }

            // A staged rename source survives navigation and informational
            // commands; anything else discards it. RNTO consumes it itself.
            const KEEPS_RENAME_STASH: &[&str] = &[
                "RNFR", "PWD", "CWD", "CDUP", "NOOP", "TYPE", "MODE", "STRU", "SYST", "STAT",
                "HELP", "FEAT", "OPTS",
            ];
            if !KEEPS_RENAME_STASH.contains(&verb.as_str()) {
                self.rename_from = None;
            }
            self.shared.tracker.set_command(&self.id, "IDLE");
        }
        Ok(self.username())
    }

    async fn greet(&mut self) -> Result<()> {
        let cfg = self.shared.config.current();
        let mut banner_lines = Vec::new();
        if let Some(banner) = &cfg.banner {
            if let Ok(text) = tokio::fs::read_to_string(banner).await {
                banner_lines.extend(text.lines().map(str::to_string));
            }
        }
        if banner_lines.is_empty() {
            self.channel.reply(220, &cfg.login_prompt).await
        } else {
            self.channel.reply_multi(220, &banner_lines, &cfg.login_prompt).await
        }
    }

    async fn dispatch(&mut self, cfg: &Arc<Config>, verb: &str, arg: &str) -> Result<()> {
        // AwaitingPass admits only the login restart set.
        if self.state == LoginState::AwaitingPass
            && !matches!(verb, "USER" | "PASS" | "QUIT" | "REIN")
        {
            return self.channel.reply(503, "Login with PASS first.").await;
        }

        let Some(def) = lookup_command(verb) else {
            return self
                .channel
                .reply(500, &format!("'{}': command not understood.", verb))
                .await;
        };

        if def.states & self.state.bit() == 0 {
            return if self.state == LoginState::Authenticated {
                self.channel.reply(503, "Bad sequence of commands.").await
            } else {
                self.channel.reply(530, "Please login with USER and PASS.").await
            };
        }

        if def.min_args > 0 && arg.is_empty() {
            return self
                .channel
                .reply(501, &format!("'{}': missing argument.", verb))
                .await;
        }

        // Per-command ACL override gate, once a principal exists.
        if let Some(principal) = &self.principal {
            if !cfg.allowed(verb, principal, &self.group_names) {
                return self.channel.reply(550, "Permission denied.").await;
            }
        }

        match verb {
            "USER" => self.cmd_user(arg).await,
            "PASS" => self.cmd_pass(cfg, arg).await,
            "AUTH" => self.cmd_auth(arg).await,
            "PBSZ" => self.cmd_pbsz(arg).await,
            "PROT" => self.cmd_prot(cfg, arg).await,
            "QUIT" => self.cmd_quit(cfg).await,
            "REIN" => self.cmd_rein().await,
            "TYPE" => self.cmd_type(arg).await,
            "MODE" => self.cmd_mode(arg).await,
            "STRU" => self.cmd_stru(arg).await,
            "PWD" => {
                let cwd = self.cwd.clone();
                self.channel
                    .reply(257, &format!("\"{}\" is current directory.", cwd))
                    .await
            }
            "CWD" => self.cmd_cwd(cfg, arg).await,
            "CDUP" => self.cmd_cwd(cfg, "..").await,
            "PORT" => self.cmd_port(cfg, arg).await,
            "EPRT" => self.cmd_eprt(cfg, arg).await,
            "PASV" => self.cmd_pasv(cfg).await,
            "EPSV" => self.cmd_epsv(cfg, arg).await,
            "REST" => self.cmd_rest(arg).await,
            "STOR" | "APPE" | "RETR" | "STOU" => self.cmd_transfer(cfg, verb, arg).await,
            "RNFR" => self.cmd_rnfr(cfg, arg).await,
            "RNTO" => self.cmd_rnto(cfg, arg).await,
            "DELE" => self.cmd_dele(cfg, arg).await,
            "RMD" => self.cmd_rmd(cfg, arg).await,
            "MKD" => self.cmd_mkd(cfg, arg).await,
            "SIZE" => self.cmd_size(cfg, arg).await,
            "MDTM" => self.cmd_mdtm(cfg, arg).await,
            "STAT" => self.cmd_stat(cfg, arg).await,
            "NOOP" => self.channel.reply(200, "NOOP command successful.").await,
            "ALLO" => self.channel.reply(202, "ALLO command ignored.").await,
            "SYST" => self.channel.reply(215, "UNIX Type: L8").await,
            "FEAT" => self.cmd_feat().await,
            "OPTS" => self.cmd_opts(arg).await,
            "HELP" => self.cmd_help().await,
            "LIST" => self.cmd_list(cfg, arg, ListingKind::Long).await,
            "NLST" => self.cmd_list(cfg, arg, ListingKind::NamesOnly).await,
            "MLSD" => self.cmd_list(cfg, arg, ListingKind::MachineReadable).await,
            "MLST" => self.cmd_mlst(cfg, arg).await,
            "SITE" => self.cmd_site(cfg, arg).await,
            "ABOR" => {
                self.data_plan = DataPlan::None;
                self.channel.reply(226, "No transfer to abort.").await
            }
            "MIC" | "CONF" | "ENC" => {
                self.channel
                    .reply(533, "Integrity-protected commands not supported; use AUTH TLS.")
                    .await
            }
            _ => self.channel.reply(500, "Command not implemented.").await,
        }
    }

    async fn cmd_user(&mut self, arg: &str) -> Result<()> {
        let name = arg.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
        self.user = None;
        self.principal = None;
        self.group_names.clear();
        self.pending_name = Some(name.clone());
        self.state = LoginState::AwaitingPass;
        self.channel
            .reply(331, &format!("Password required for {}.", name))
            .await
    }

    async fn cmd_pass(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let Some(name) = self.pending_name.clone() else {
            return self.channel.reply(503, "Login with USER first.").await;
        };
        let peer_ip = self.channel.peer().ip();

        let looked_up = self.shared.users.user_by_name(&name).await?;
        let denied: Option<LoginDenied> = match &looked_up {
            None => Some(LoginDenied::BadPassword),
            Some(user) => {
                let group_names = self.resolve_group_names(user);
                auth::check_login(cfg, user, &group_names, arg, peer_ip, self.channel.is_tls())
                    .err()
            }
        };

        if let Some(reason) = denied {
            AuditEvent::AuthAttempt {
                session_id: self.id,
                client_ip: peer_ip,
                username: name.clone(),
                success: false,
                reason: Some(reason.to_string()),
            }
            .log();
            self.login_attempts += 1;
            self.state = LoginState::AwaitingUser;
            self.pending_name = None;
            if self.login_attempts >= MAX_LOGIN_ATTEMPTS {
                self.channel.reply(421, "Too many login failures.").await?;
                self.closing = true;
                return Ok(());
            }
            let text = match reason {
                LoginDenied::TlsRequired => "TLS required; use AUTH TLS.",
                _ => "Login incorrect.",
            };
            return self.channel.reply(530, text).await;
        }

        let user = looked_up.expect("denied covers the missing-user case");
        // Per-group concurrent login ceiling.
        if let Some(group) = self.shared.groups.group_by_id(user.primary_gid).await? {
            if group.max_logins >= 0
                && self.shared.tracker.logins_for(user.uid) >= group.max_logins as usize
            {
                self.state = LoginState::AwaitingUser;
                return self.channel.reply(530, "Too many logins for your group.").await;
            }
        }

        self.group_names = self.resolve_group_names(&user);
        self.principal = Some(user.principal());
        self.cwd = if self.shared.vfs(cfg).is_dir(&user.home_dir).await {
            user.home_dir.clone()
        } else {
            "/".to_string()
        };
        self.shared.tracker.set_user(&self.id, user.uid, &user.name);
        self.shared.users.record_login(user.uid, chrono::Utc::now()).await?;
        AuditEvent::AuthAttempt {
            session_id: self.id,
            client_ip: peer_ip,
            username: user.name.clone(),
            success: true,
            reason: None,
        }
        .log();
        info!(session = %self.id, user = %user.name, "authenticated");

        let principal = user.principal();
        let mut welcome = Vec::new();
        for msg in &cfg.welcome_msg {
            if msg.acl.check(&principal, &self.group_names) {
                if let Ok(text) = tokio::fs::read_to_string(&msg.file).await {
                    welcome.extend(text.lines().map(str::to_string));
                }
            }
        }
        let final_line = format!("User {} logged in.", user.name);
        self.user = Some(user);
        self.state = LoginState::Authenticated;
        self.login_attempts = 0;
        if welcome.is_empty() {
            self.channel.reply(230, &final_line).await
        } else {
            self.channel.reply_multi(230, &welcome, &final_line).await
        }
    }

    fn resolve_group_names(&self, user: &User) -> Vec<String> {
        let mut names = vec![self.shared.groups.group_name_of(user.primary_gid)];
        for gid in &user.secondary_gids {
            names.push(self.shared.groups.group_name_of(*gid));
        }
        names
    }

    async fn cmd_auth(&mut self, arg: &str) -> Result<()> {
        if !arg.eq_ignore_ascii_case("TLS") && !arg.eq_ignore_ascii_case("SSL") {
            return self
                .channel
                .reply(504, &format!("AUTH {} not supported.", arg))
                .await;
        }
        if self.channel.is_tls() {
            return self.channel.reply(503, "Already secured.").await;
        }
        let Some(acceptor) = self.shared.tls.clone() else {
            return self.channel.reply(431, "TLS not configured.").await;
        };
        self.channel.reply(234, "AUTH TLS successful.").await?;
        if let Err(e) = self.channel.upgrade_tls(&acceptor).await {
            // A failed handshake closes the session; the reply is best
            // effort since the channel is likely already unusable.
            debug!(session = %self.id, "TLS handshake failed: {}", e);
            self.channel.reply(421, "TLS handshake failed.").await.ok();
            self.closing = true;
            return Ok(());
        }
        Ok(())
    }

    async fn cmd_pbsz(&mut self, arg: &str) -> Result<()> {
        if !self.channel.is_tls() {
            return self.channel.reply(503, "Secure the control channel first.").await;
        }
        self.pbsz_done = true;
        if arg != "0" {
            // RFC 4217: TLS needs no buffering; force the size to zero.
            return self.channel.reply(200, "PBSZ=0").await;
        }
        self.channel.reply(200, "PBSZ 0 successful.").await
    }

    async fn cmd_prot(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        if !self.pbsz_done {
            return self.channel.reply(503, "PBSZ required before PROT.").await;
        }
        match arg.to_ascii_uppercase().as_str() {
            "P" => {
                self.prot_private = true;
                self.channel.reply(200, "Protection set to Private.").await
            }
            "C" => {
                // Clearing protection is refused for principals the config
                // obliges to protect their data channel.
                if let Some(principal) = &self.principal {
                    if cfg.tls_required_for(TlsChannel::Data, principal, &self.group_names) {
                        return self.channel.reply(534, "Data protection required.").await;
                    }
                }
                self.prot_private = false;
                self.channel.reply(200, "Protection set to Clear.").await
            }
            other => {
                self.channel
                    .reply(536, &format!("PROT {} unsupported.", other))
                    .await
            }
        }
    }

    async fn cmd_quit(&mut self, cfg: &Arc<Config>) -> Result<()> {
        let mut goodbye = Vec::new();
        if let (Some(principal), false) = (&self.principal, cfg.goodbye_msg.is_empty()) {
            for msg in &cfg.goodbye_msg {
                if msg.acl.check(principal, &self.group_names) {
                    if let Ok(text) = tokio::fs::read_to_string(&msg.file).await {
                        goodbye.extend(text.lines().map(str::to_string));
                    }
                }
            }
        }
        if goodbye.is_empty() {
            self.channel.reply(221, "Goodbye.").await?;
        } else {
            self.channel.reply_multi(221, &goodbye, "Goodbye.").await?;
        }
        self.closing = true;
        Ok(())
    }

    async fn cmd_rein(&mut self) -> Result<()> {
        self.user = None;
        self.principal = None;
        self.group_names.clear();
        self.pending_name = None;
        self.state = LoginState::AwaitingUser;
        self.cwd = "/".to_string();
        self.ascii = true;
        self.data_plan = DataPlan::None;
        self.rename_from = None;
        self.restart_offset = 0;
        // TLS state survives REIN.
        self.channel.reply(220, "Service ready for new user.").await
    }

    async fn cmd_type(&mut self, arg: &str) -> Result<()> {
        let mut parts = arg.split_whitespace();
        match parts.next().map(|t| t.to_ascii_uppercase()).as_deref() {
            Some("A") => {
                self.ascii = true;
                self.restart_offset = 0;
                self.channel.reply(200, "Type set to A.").await
            }
            Some("I") => {
                self.ascii = false;
                self.restart_offset = 0;
                self.channel.reply(200, "Type set to I.").await
            }
            Some("L") if parts.next() == Some("8") => {
                self.ascii = false;
                self.restart_offset = 0;
                self.channel.reply(200, "Type set to L 8.").await
            }
            _ => {
                self.channel
                    .reply(504, &format!("Type {} not supported.", arg))
                    .await
            }
        }
    }

    async fn cmd_mode(&mut self, arg: &str) -> Result<()> {
        if arg.eq_ignore_ascii_case("S") {
            self.channel.reply(200, "Mode set to S.").await
        } else {
            self.channel.reply(504, "Only stream mode is supported.").await
        }
    }

    async fn cmd_stru(&mut self, arg: &str) -> Result<()> {
        if arg.eq_ignore_ascii_case("F") {
            self.channel.reply(200, "Structure set to F.").await
        } else {
            self.channel.reply(504, "Only file structure is supported.").await
        }
    }

    async fn cmd_cwd(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated");

        let mut target = vfs::join(&self.cwd, arg)?;
        if !vfs.is_dir(&target).await && !arg.contains('/') {
            // Aliases and cdpath entries catch bare names that miss.
            if let Some(alias) = cfg.alias.iter().find(|a| a.name == arg) {
                target = vfs::normalize(&alias.target)?;
            } else {
                for prefix in &cfg.cdpath {
                    if let Ok(candidate) = vfs::join(prefix, arg) {
                        if vfs.is_dir(&candidate).await {
                            target = candidate;
                            break;
                        }
                    }
                }
            }
        }

        if !cfg.path_op_allowed(&cfg.privpath, &target, principal, &self.group_names, true) {
            return Err(Error::NotFound(target));
        }
        if !vfs.is_dir(&target).await {
            return Err(Error::NotFound(target));
        }
        self.cwd = target.clone();

        // Per-directory message, glftpd style.
        for msg in &cfg.msg_path {
            if msg.path.matches(&target) && msg.acl.check(principal, &self.group_names) {
                let file = vfs.resolve(&target)?.join(&msg.filename);
                if let Ok(text) = tokio::fs::read_to_string(&file).await {
                    let lines: Vec<String> = text.lines().map(str::to_string).collect();
                    return self
                        .channel
                        .reply_multi(250, &lines, &format!("CWD successful. \"{}\"", target))
                        .await;
                }
            }
        }
        self.channel
            .reply(250, &format!("CWD successful. \"{}\"", target))
            .await
    }

    /// PORT/EPRT bounce protection: no privileged ports, and no pointing
    /// the data connection back at this daemon unless `active_addr` says
    /// that address is ours to use.
    fn validate_active_target(&self, cfg: &Config, addr: SocketAddr) -> Option<&'static str> {
        if addr.port() < 1024 {
            return Some("Refusing privileged data port.");
        }
        if addr.ip() == self.local_ip
            && !cfg.active_addr.iter().any(|a| *a == addr.ip().to_string())
        {
            return Some("Refusing data connection to self.");
        }
        None
    }

    async fn cmd_port(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let addr = data::parse_port_arg(arg)?;
        if let Some(reason) = self.validate_active_target(cfg, addr) {
            return self.channel.reply(501, reason).await;
        }
        self.data_plan = DataPlan::Active {
            peer: addr,
            via_eprt: false,
        };
        self.channel.reply(200, "PORT command successful.").await
    }

    async fn cmd_eprt(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let addr = data::parse_eprt_arg(arg)?;
        if let Some(reason) = self.validate_active_target(cfg, addr) {
            return self.channel.reply(501, reason).await;
        }
        self.data_plan = DataPlan::Active {
            peer: addr,
            via_eprt: true,
        };
        self.channel.reply(200, "EPRT command successful.").await
    }

    async fn cmd_pasv(&mut self, cfg: &Arc<Config>) -> Result<()> {
        let (listener, port) =
            match data::open_passive(cfg, &self.shared.ports.pasv_cursor, self.local_ip).await {
                Ok(ok) => ok,
                Err(e) => return self.channel.reply(425, &e.client_message()).await,
            };
        let advertised_ip = cfg
            .pasv_addr_for(&self.channel.peer().ip().to_string())
            .and_then(|entry| entry.addr.parse::<IpAddr>().ok())
            .unwrap_or(self.local_ip);
        let formatted = data::format_pasv_addr(advertised_ip, port)?;
        self.data_plan = DataPlan::Passive {
            listener,
            port,
            via_epsv: false,
        };
        self.channel
            .reply(227, &format!("Entering Passive Mode ({})", formatted))
            .await
    }

    async fn cmd_epsv(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        if arg.eq_ignore_ascii_case("ALL") {
            return self.channel.reply(200, "EPSV ALL accepted.").await;
        }
        let (listener, port) =
            match data::open_passive(cfg, &self.shared.ports.pasv_cursor, self.local_ip).await {
                Ok(ok) => ok,
                Err(e) => return self.channel.reply(425, &e.client_message()).await,
            };
        self.data_plan = DataPlan::Passive {
            listener,
            port,
            via_epsv: true,
        };
        self.channel
            .reply(229, &format!("Entering Extended Passive Mode (|||{}|)", port))
            .await
    }

    async fn cmd_rest(&mut self, arg: &str) -> Result<()> {
        let offset: u64 = arg
            .parse()
            .map_err(|_| Error::Protocol(format!("bad REST offset: {}", arg)))?;
        self.restart_offset = offset;
        self.channel
            .reply(350, &format!("Restarting at {}. Send STOR or RETR.", offset))
            .await
    }

    async fn cmd_rnfr(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated");
        let source = vfs::join(&self.cwd, arg)?;
        if !vfs.exists(&source).await {
            return Err(Error::NotFound(source));
        }
        let allowed = cfg.path_op_allowed(&cfg.rename, &source, principal, &self.group_names, true)
            || (vfs.owner_of(&source).await.uid == principal.uid
                && cfg.path_op_allowed(&cfg.renameown, &source, principal, &self.group_names, true));
        if !allowed {
            return Err(Error::PermissionDenied(source));
        }
        self.rename_from = Some(source);
        self.channel.reply(350, "RNFR accepted; send RNTO.").await
    }

    async fn cmd_rnto(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let Some(source) = self.rename_from.take() else {
            return self.channel.reply(503, "RNFR required first.").await;
        };
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated");
        let target = vfs::join(&self.cwd, arg)?;

        let (source_dir, _) = vfs::split(&source);
        let (target_dir, _) = vfs::split(&target);
        if source_dir != target_dir
            && !cfg.path_op_allowed(&cfg.filemove, &target, principal, &self.group_names, true)
        {
            return Err(Error::PermissionDenied(target));
        }

        vfs.rename(&source, &target).await?;
        self.channel
            .reply(250, &format!("Rename successful: {} -> {}.", source, target))
            .await
    }

    async fn cmd_dele(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated");
        let vpath = vfs::join(&self.cwd, arg)?;
        if !vfs.exists(&vpath).await {
            return Err(Error::NotFound(vpath));
        }
        let allowed = cfg.path_op_allowed(&cfg.delete, &vpath, principal, &self.group_names, true)
            || (vfs.owner_of(&vpath).await.uid == principal.uid
                && cfg.path_op_allowed(&cfg.deleteown, &vpath, principal, &self.group_names, true));
        if !allowed {
            return Err(Error::PermissionDenied(vpath));
        }
        vfs.delete_file(&vpath).await?;
        self.channel.reply(250, "DELE command successful.").await
    }

    async fn cmd_rmd(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated");
        let vpath = vfs::join(&self.cwd, arg)?;
        if !cfg.path_op_allowed(&cfg.delete, &vpath, principal, &self.group_names, true) {
            return Err(Error::PermissionDenied(vpath));
        }
        vfs.remove_dir(&vpath).await?;
        self.channel.reply(250, "RMD command successful.").await
    }

    async fn cmd_mkd(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated").clone();
        let vpath = vfs::join(&self.cwd, arg)?;
        if !cfg.path_op_allowed(&cfg.makedir, &vpath, &principal, &self.group_names, true) {
            return Err(Error::PermissionDenied(vpath));
        }
        vfs.make_dir(&vpath, Owner::new(principal.uid, principal.primary_gid))
            .await?;
        self.channel
            .reply(257, &format!("\"{}\" created.", vpath))
            .await
    }

    async fn cmd_size(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let vpath = vfs::join(&self.cwd, arg)?;
        let meta = vfs.metadata(&vpath).await?;
        if meta.is_dir() {
            return Err(Error::NotFound(vpath));
        }
        self.channel.reply(213, &meta.len().to_string()).await
    }

    async fn cmd_mdtm(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let vpath = vfs::join(&self.cwd, arg)?;
        let meta = vfs.metadata(&vpath).await?;
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        self.channel
            .reply(213, &listing::format_mdtm(modified))
            .await
    }

    async fn cmd_stat(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        if arg.is_empty() {
            let lines = vec![
                format!("Connected from {}", self.channel.peer().ip()),
                format!(
                    "Logged in as {}",
                    self.username().unwrap_or_else(|| "-".to_string())
                ),
                format!("TYPE: {}", if self.ascii { "ASCII" } else { "BINARY" }),
                format!("Session: {}", self.id),
            ];
            return self.channel.reply_multi(211, &lines, "End of status.").await;
        }
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.as_ref().expect("authenticated").clone();
        let vpath = vfs::join(&self.cwd, arg)?;
        let lines = listing::build_listing(
            &vfs,
            cfg,
            self.shared.users.as_ref(),
            self.shared.groups.as_ref(),
            &vpath,
            &principal,
            &self.group_names,
            ListingKind::Long,
        )
        .await?;
        self.channel
            .reply_multi(213, &lines, "End of status.")
            .await
    }

    async fn cmd_feat(&mut self) -> Result<()> {
        let features = [
            " AUTH TLS",
            " PBSZ",
            " PROT",
            " EPRT",
            " EPSV",
            " SIZE",
            " MDTM",
            " REST STREAM",
            " MLST type*;size*;modify*;unix.owner;unix.group;",
            " MLSD",
            " UTF8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        self.channel.reply_multi(211, &features, "End").await
    }

    async fn cmd_opts(&mut self, arg: &str) -> Result<()> {
        let upper = arg.to_ascii_uppercase();
        if upper == "UTF8 ON" {
            self.channel.reply(200, "UTF8 set to on.").await
        } else if upper.starts_with("MLST") {
            self.channel.reply(200, "MLST OPTS accepted.").await
        } else {
            self.channel.reply(501, "Option not understood.").await
        }
    }

    async fn cmd_help(&mut self) -> Result<()> {
        let mut names: Vec<&str> = COMMANDS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        let lines: Vec<String> = names
            .chunks(8)
            .map(|chunk| format!(" {}", chunk.join(" ")))
            .collect();
        self.channel
            .reply_multi(214, &lines, "Direct comments to the siteops.")
            .await
    }

    async fn cmd_site(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let args: Vec<String> = arg.split_whitespace().map(str::to_string).collect();
        let vfs = self.shared.vfs(cfg);
        let user = self.user.clone().expect("authenticated");
        let principal = self.principal.clone().expect("authenticated");
        let ctx = SiteCtx {
            config: cfg,
            vfs: &vfs,
            users: self.shared.users.as_ref(),
            groups: self.shared.groups.as_ref(),
            tracker: &self.shared.tracker,
            user: &user,
            principal: &principal,
            group_names: &self.group_names,
            cwd: &self.cwd,
        };
        let result = site::dispatch(&ctx, &args).await;
        let command = args.first().cloned().unwrap_or_default().to_ascii_uppercase();
        match result {
            Ok(reply) => {
                AuditEvent::SiteCommand {
                    session_id: self.id,
                    username: user.name.clone(),
                    command,
                    success: reply.code < 400,
                }
                .log();
                match reply.lines.split_last() {
                    Some((last, rest)) if !rest.is_empty() => {
                        self.channel
                            .reply_multi(reply.code, &rest.to_vec(), last)
                            .await
                    }
                    Some((last, _)) => self.channel.reply(reply.code, last).await,
                    None => self.channel.reply(reply.code, "Done.").await,
                }
            }
            Err(e) => {
                AuditEvent::SiteCommand {
                    session_id: self.id,
                    username: user.name.clone(),
                    command,
                    success: false,
                }
                .log();
                self.channel.reply(e.reply_code(), &e.client_message()).await
            }
        }
    }

    async fn cmd_list(
        &mut self,
        cfg: &Arc<Config>,
        arg: &str,
        kind: ListingKind,
    ) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let principal = self.principal.clone().expect("authenticated");

        if cfg.tls_required_for(TlsChannel::Listing, &principal, &self.group_names)
            && !self.prot_private
        {
            return self.channel.reply(522, "TLS required on data for listings.").await;
        }

        // Strip ls-style flags LIST is commonly given.
        let path_arg = arg
            .split_whitespace()
            .find(|tok| !tok.starts_with('-'))
            .unwrap_or("");
        let dir = if path_arg.is_empty() {
            self.cwd.clone()
        } else {
            vfs::join(&self.cwd, path_arg)?
        };

        let lines = listing::build_listing(
            &vfs,
            cfg,
            self.shared.users.as_ref(),
            self.shared.groups.as_ref(),
            &dir,
            &principal,
            &self.group_names,
            kind,
        )
        .await?;

        let mut data = match self.open_data(cfg, TransferDirection::Download).await {
            Ok(stream) => stream,
            Err(e) => return self.channel.reply(425, &e.client_message()).await,
        };
        self.channel
            .reply(150, "Opening data connection for directory listing.")
            .await?;
        let mut payload = String::new();
        for line in &lines {
            payload.push_str(line);
            payload.push_str("\r\n");
        }
        let result = data.write_all(payload.as_bytes()).await;
        data.shutdown().await.ok();
        match result {
            Ok(()) => self.channel.reply(226, "Transfer complete.").await,
            Err(_) => self.channel.reply(426, "Data connection closed.").await,
        }
    }

    async fn cmd_mlst(&mut self, cfg: &Arc<Config>, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let vpath = if arg.is_empty() {
            self.cwd.clone()
        } else {
            vfs::join(&self.cwd, arg)?
        };
        let facts = listing::build_mlst(
            &vfs,
            self.shared.users.as_ref(),
            self.shared.groups.as_ref(),
            &vpath,
        )
        .await?;
        self.channel
            .reply_multi(250, &[format!(" {}", facts)], "End")
            .await
    }

    async fn open_data(
        &mut self,
        cfg: &Arc<Config>,
        direction: TransferDirection,
    ) -> Result<DataStream> {
        let plan = std::mem::replace(&mut self.data_plan, DataPlan::None);
        let principal = self.principal.as_ref().expect("authenticated");
        let (mut fxp_ok, fxp_log) = cfg.fxp_allowed(direction, principal, &self.group_names);
        if fxp_ok
            && cfg.tls_required_for(TlsChannel::Fxp, principal, &self.group_names)
            && !self.prot_private
        {
            fxp_ok = false;
        }

        let control_ip = self.channel.peer().ip();
        let stream = match plan {
            DataPlan::None => {
                return Err(Error::DataChannel("use PORT or PASV first".into()));
            }
            DataPlan::Active { peer, .. } => {
                if peer.ip() != control_ip && !fxp_ok {
                    return Err(Error::PeerMismatch(peer.ip().to_string()));
                }
                data::connect_active(cfg, &self.shared.ports.active_cursor, self.local_ip, peer)
                    .await?
            }
            DataPlan::Passive {
                listener, via_epsv, ..
            } => {
                match cfg.epsv_fxp {
                    EpsvFxp::Deny if via_epsv => fxp_ok = false,
                    EpsvFxp::Force if !via_epsv => fxp_ok = false,
                    _ => {}
                }
                data::accept_passive(listener, control_ip, fxp_ok, fxp_log).await?
            }
        };

        let acceptor = if self.prot_private {
            Some(self.shared.tls.as_ref().ok_or_else(|| {
                Error::Config("PROT P negotiated without a TLS certificate".into())
            })?)
        } else {
            None
        };
        data::maybe_tls(stream, acceptor).await
    }

    /// STOR/STOU/APPE/RETR. Keeps reading the control channel during the
    /// transfer so ABOR lands within one chunk.
    async fn cmd_transfer(&mut self, cfg: &Arc<Config>, verb: &str, arg: &str) -> Result<()> {
        let vfs = self.shared.vfs(cfg);
        let user = self.user.clone().expect("authenticated");
        let principal = self.principal.clone().expect("authenticated");
        let groups = self.group_names.clone();
        let users = Arc::clone(&self.shared.users);
        let direction = if verb == "RETR" {
            TransferDirection::Download
        } else {
            TransferDirection::Upload
        };

        // Simultaneous-transfer ceiling across this user's sessions.
        let cap = match direction {
            TransferDirection::Download => cfg.sim_xfers.max_downloads,
            TransferDirection::Upload => cfg.sim_xfers.max_uploads,
        };
        if cap > 0 && self.shared.tracker.transfers_for(user.uid, direction) >= cap as usize {
            self.restart_offset = 0;
            return self
                .channel
                .reply(450, "Simultaneous transfer limit reached.")
                .await;
        }

        if cfg.tls_required_for(TlsChannel::Data, &principal, &groups) && !self.prot_private {
            self.restart_offset = 0;
            return self.channel.reply(521, "TLS required on data channel.").await;
        }

        let vpath = if verb == "STOU" {
            let base = if arg.is_empty() { "file" } else { arg };
            let mut candidate;
            loop {
                candidate = vfs::join(
                    &self.cwd,
                    &format!("{}.{}", base, &Uuid::new_v4().simple().to_string()[..8]),
                )?;
                if !vfs.exists(&candidate).await {
                    break;
                }
            }
            candidate
        } else {
            vfs::join(&self.cwd, arg)?
        };

        let offset = self.restart_offset;
        self.restart_offset = 0;
        let mut ascii = self.ascii;

        let ctx = TransferCtx {
            config: cfg,
            vfs: &vfs,
            users: users.as_ref(),
            user: &user,
            principal: &principal,
            groups: &groups,
        };

        enum Prepared {
            Download(transfer::DownloadPlan),
            Upload(UploadMode),
        }
        let prepared = match direction {
            TransferDirection::Download => {
                match transfer::preflight_download(&ctx, &vpath, offset).await {
                    Ok(plan) => Prepared::Download(plan),
                    Err(e) => {
                        return self.channel.reply(e.reply_code(), &e.client_message()).await
                    }
                }
            }
            TransferDirection::Upload => {
                match transfer::preflight_upload(&ctx, &vpath, offset, verb == "APPE").await {
                    Ok(mode) => Prepared::Upload(mode),
                    Err(e) => {
                        return self.channel.reply(e.reply_code(), &e.client_message()).await
                    }
                }
            }
        };

        // `ascii_downloads` forces translation for small text-like files
        // whatever TYPE the client set.
        if let Prepared::Download(plan) = &prepared {
            if !ascii {
                let (_, name) = vfs::split(&vpath);
                if cfg.ascii_download(&name, crate::credits::kb_for_bytes(plan.size)) {
                    ascii = true;
                }
            }
        }

        let mut data = match self.open_data(cfg, direction).await {
            Ok(stream) => stream,
            Err(e) => {
                // The download charge was taken at pre-flight; nothing
                // moved, so hand it all back.
                if let Prepared::Download(plan) = &prepared {
                    if let Some(charge) = &plan.charge {
                        crate::credits::credit(users.as_ref(), user.uid, &charge.key, charge.kb)
                            .await?;
                    }
                }
                return self.channel.reply(425, &e.client_message()).await;
            }
        };

        let mode_name = if ascii { "ASCII" } else { "BINARY" };
        let opening = match &prepared {
            Prepared::Download(plan) => format!(
                "Opening {} mode data connection for {} ({} bytes).",
                mode_name, vpath, plan.size
            ),
            Prepared::Upload(_) => {
                format!("Opening {} mode data connection for {}.", mode_name, vpath)
            }
        };
        self.channel.reply(150, &opening).await?;

        AuditEvent::TransferStart {
            session_id: self.id,
            username: user.name.clone(),
            direction,
            path: vpath.clone(),
            offset,
        }
        .log();
        self.shared.tracker.set_transferring(&self.id, Some(direction));
        let started = std::time::Instant::now();

        let (abort_tx, mut abort_rx) = watch::channel(false);
        let mut xfer = std::pin::pin!(async {
            match prepared {
                Prepared::Download(plan) => {
                    transfer::download(&ctx, &mut data, &vpath, offset, ascii, plan, &mut abort_rx)
                        .await
                }
                Prepared::Upload(mode) => {
                    transfer::upload(&ctx, &mut data, &vpath, mode, ascii, &mut abort_rx).await
                }
            }
        });

        let mut client_aborted = false;
        let mut quit_after = false;
        let mut control_lost = false;
        let result = loop {
            if control_lost {
                break xfer.as_mut().await;
            }
            tokio::select! {
                res = xfer.as_mut() => break res,
                line = self.channel.read_line() => match line {
                    Ok(Some(cmd)) => {
                        let (v, _) = split_command(&cmd);
                        match v.as_str() {
                            "ABOR" => {
                                client_aborted = true;
                                let _ = abort_tx.send(true);
                            }
                            "QUIT" => {
                                quit_after = true;
                                let _ = abort_tx.send(true);
                            }
                            _ => {
                                self.channel.reply(503, "Transfer in progress.").await.ok();
                            }
                        }
                    }
                    Ok(None) | Err(_) => {
                        control_lost = true;
                        let _ = abort_tx.send(true);
                    }
                },
            }
        };

        self.shared.tracker.set_transferring(&self.id, None);
        let duration_ms = started.elapsed().as_millis();

        let (bytes, success, error_text) = match &result {
            Ok(outcome) => (outcome.bytes, true, None),
            Err(Error::TransferAborted { bytes_done }) => {
                (*bytes_done, false, Some("aborted".to_string()))
            }
            Err(e) => (0, false, Some(e.to_string())),
        };
        AuditEvent::TransferEnd {
            session_id: self.id,
            username: user.name.clone(),
            direction,
            path: vpath.clone(),
            bytes,
            duration_ms,
            success,
            error: error_text,
        }
        .log();

        if control_lost {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "control connection lost during transfer",
            )));
        }

        match result {
            Ok(outcome) => {
                let text = if verb == "STOU" {
                    format!("Transfer complete (unique file: {}).", vpath)
                } else if outcome.credit_delta_kb != 0 {
                    format!(
                        "Transfer complete ({} bytes, {:+}KB credits).",
                        outcome.bytes, outcome.credit_delta_kb
                    )
                } else {
                    format!("Transfer complete ({} bytes).", outcome.bytes)
                };
                self.channel.reply(226, &text).await?;
            }
            Err(Error::TransferAborted { .. }) => {
                self.channel.reply(426, "Transfer aborted.").await?;
                if client_aborted {
                    self.channel.reply(226, "ABOR command successful.").await?;
                }
            }
            Err(e) => {
                self.channel.reply(e.reply_code(), &e.client_message()).await?;
            }
        }

        if quit_after {
            self.channel.reply(221, "Goodbye.").await.ok();
            self.closing = true;
        }
        Ok(())
    }
}

impl SharedState {
    /// The virtual filesystem for a given snapshot's site root.
    pub fn vfs(&self, cfg: &Config) -> Vfs {
        Vfs::new(cfg.sitepath.clone())
    }
}
