//! SITE command dispatcher.
//!
//! Table-driven: every subcommand carries its minimum argument count, ACL
//! keyword, and default access level. The per-keyword `-<keyword>` config
//! override always wins over the default. Output is capped by
//! `max_sitecmd_lines` with a truncation notice.

use crate::auth;
use crate::config::{Config, SiteCmdMethod};
use crate::credits;
use crate::error::{Error, Result};
use crate::tracker::SessionTracker;
use crate::vfs::Vfs;
use serde::{Deserialize, Serialize};
use skua_core::{flag, GroupStore, NewUser, Owner, Principal, User, UserField, UserStore};
use tracing::info;

/// Who may run a subcommand when no `-<keyword>` override is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAccess {
    Siteop,
    Gadmin,
    Everyone,
}

pub struct SiteCommandDef {
    pub name: &'static str,
    pub min_args: usize,
    pub acl_keyword: &'static str,
    pub default_access: DefaultAccess,
    pub syntax: &'static str,
}

pub const SITE_COMMANDS: &[SiteCommandDef] = &[
    SiteCommandDef { name: "USER", min_args: 0, acl_keyword: "user", default_access: DefaultAccess::Everyone, syntax: "SITE USER [<user>]" },
    SiteCommandDef { name: "ADDUSER", min_args: 2, acl_keyword: "adduser", default_access: DefaultAccess::Gadmin, syntax: "SITE ADDUSER <user> <password> [<group>]" },
    SiteCommandDef { name: "DELUSER", min_args: 1, acl_keyword: "deluser", default_access: DefaultAccess::Gadmin, syntax: "SITE DELUSER <user>" },
    SiteCommandDef { name: "CHANGE", min_args: 3, acl_keyword: "change", default_access: DefaultAccess::Siteop, syntax: "SITE CHANGE <user> <setting> <value>" },
    SiteCommandDef { name: "CHOWN", min_args: 2, acl_keyword: "chown", default_access: DefaultAccess::Siteop, syntax: "SITE CHOWN <user>[:<group>] <path>" },
    // Gated by "giveown" (anyone may part with their own credits); the
    // "give" keyword upgrades to minting, as the handler decides.
    SiteCommandDef { name: "GIVE", min_args: 2, acl_keyword: "giveown", default_access: DefaultAccess::Everyone, syntax: "SITE GIVE [-S <section>] <user> <amount>[K|M|G]" },
    SiteCommandDef { name: "TAKE", min_args: 2, acl_keyword: "take", default_access: DefaultAccess::Siteop, syntax: "SITE TAKE [-S <section>] <user> <amount>[K|M|G]" },
    SiteCommandDef { name: "NUKE", min_args: 2, acl_keyword: "nuke", default_access: DefaultAccess::Siteop, syntax: "SITE NUKE <path> <multiplier> [<reason>]" },
    SiteCommandDef { name: "UNNUKE", min_args: 1, acl_keyword: "unnuke", default_access: DefaultAccess::Siteop, syntax: "SITE UNNUKE <path> [<reason>]" },
    SiteCommandDef { name: "WHO", min_args: 0, acl_keyword: "who", default_access: DefaultAccess::Everyone, syntax: "SITE WHO" },
    SiteCommandDef { name: "STATS", min_args: 0, acl_keyword: "stats", default_access: DefaultAccess::Everyone, syntax: "SITE STATS [<user>]" },
    SiteCommandDef { name: "SECTIONS", min_args: 0, acl_keyword: "sections", default_access: DefaultAccess::Everyone, syntax: "SITE SECTIONS" },
    SiteCommandDef { name: "ADDGROUP", min_args: 1, acl_keyword: "addgroup", default_access: DefaultAccess::Siteop, syntax: "SITE ADDGROUP <group> [<description>]" },
    SiteCommandDef { name: "DELGROUP", min_args: 1, acl_keyword: "delgroup", default_access: DefaultAccess::Siteop, syntax: "SITE DELGROUP <group>" },
    SiteCommandDef { name: "PASSWD", min_args: 1, acl_keyword: "passwd", default_access: DefaultAccess::Everyone, syntax: "SITE PASSWD <password>" },
    SiteCommandDef { name: "TAGLINE", min_args: 1, acl_keyword: "tagline", default_access: DefaultAccess::Everyone, syntax: "SITE TAGLINE <text>" },
];

pub fn lookup(name: &str) -> Option<&'static SiteCommandDef> {
    let upper = name.to_ascii_uppercase();
    SITE_COMMANDS.iter().find(|def| def.name == upper)
}

/// Record left inside a nuked directory so UNNUKE can undo the damage.
#[derive(Debug, Serialize, Deserialize)]
struct NukeRecord {
    original_name: String,
    owner_uid: i32,
    multiplier: i64,
    taken_kb: i64,
    reason: String,
}

const NUKE_RECORD_FILE: &str = ".skua-nuke";

pub struct SiteCtx<'a> {
    pub config: &'a Config,
    pub vfs: &'a Vfs,
    pub users: &'a dyn UserStore,
    pub groups: &'a dyn GroupStore,
    pub tracker: &'a SessionTracker,
    pub user: &'a User,
    pub principal: &'a Principal,
    pub group_names: &'a [String],
    pub cwd: &'a str,
}

#[derive(Debug)]
pub struct SiteReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SiteReply {
    fn ok(lines: Vec<String>) -> Self {
        Self { code: 200, lines }
    }

    fn fail(text: impl Into<String>) -> Self {
        Self {
            code: 550,
            lines: vec![text.into()],
        }
    }
}

fn has_access(ctx: &SiteCtx<'_>, def: &SiteCommandDef) -> bool {
    if let Some(acl) = ctx.config.command_acls.get(def.acl_keyword) {
        return acl.check(ctx.principal, ctx.group_names);
    }
    match def.default_access {
        DefaultAccess::Everyone => true,
        DefaultAccess::Gadmin => {
            ctx.principal.has_flag(flag::SITEOP) || ctx.principal.has_flag(flag::GADMIN)
        }
        DefaultAccess::Siteop => ctx.principal.has_flag(flag::SITEOP),
    }
}

fn keyword_allowed(ctx: &SiteCtx<'_>, keyword: &str, fallback: bool) -> bool {
    match ctx.config.command_acls.get(keyword) {
        Some(acl) => acl.check(ctx.principal, ctx.group_names),
        None => fallback,
    }
}

/// Parse `<amount>[K|M|G]` into kilobytes.
fn parse_kb(arg: &str) -> Result<i64> {
    let (digits, unit) = match arg.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&arg[..arg.len() - 1], c.to_ascii_uppercase()),
        _ => (arg, 'K'),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| Error::Protocol(format!("bad amount: {}", arg)))?;
    if amount < 0 {
        return Err(Error::Protocol(format!("bad amount: {}", arg)));
    }
    Ok(match unit {
        'K' => amount,
        'M' => amount * 1024,
        'G' => amount * 1024 * 1024,
        _ => return Err(Error::Protocol(format!("bad amount unit: {}", arg))),
    })
}

/// `[-S <section>]` prefix shared by GIVE and TAKE. Returns (section key,
/// remaining args).
fn parse_section_flag<'a>(
    ctx: &SiteCtx<'_>,
    args: &'a [String],
) -> Result<(String, &'a [String])> {
    if args.first().map(|a| a.eq_ignore_ascii_case("-s")) == Some(true) {
        let name = args
            .get(1)
            .ok_or_else(|| Error::Protocol("missing section name".into()))?
            .to_ascii_uppercase();
        let section = ctx
            .config
            .sections
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Protocol(format!("section {} doesn't exist", name)))?;
        if !section.separate_credits {
            return Err(Error::Protocol(format!(
                "section {} doesn't have separate credits",
                name
            )));
        }
        Ok((name, &args[2..]))
    } else {
        Ok((skua_core::DEFAULT_SECTION.to_string(), args))
    }
}

/// Dispatch one SITE invocation. `args` excludes the SITE token itself.
pub async fn dispatch(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let Some(sub) = args.first() else {
        return Err(Error::Protocol("SITE requires a subcommand".into()));
    };
    let rest = &args[1..];

    // Config-defined commands shadow nothing in the built-in table.
    if lookup(sub).is_none() {
        if let Some(custom) = ctx
            .config
            .site_cmd
            .iter()
            .find(|c| c.command.eq_ignore_ascii_case(sub))
        {
            let keyword = format!("custom-{}", custom.command.to_ascii_lowercase());
            if !keyword_allowed(ctx, &keyword, false) {
                return Ok(SiteReply::fail("Permission denied."));
            }
            return run_custom(ctx, custom, rest).await;
        }
        return Err(Error::Protocol(format!("unknown SITE command: {}", sub)));
    }

    let def = lookup(sub).unwrap();
    if !has_access(ctx, def) {
        return Ok(SiteReply::fail("Permission denied."));
    }
    if rest.len() < def.min_args {
        return Ok(SiteReply {
            code: 501,
            lines: vec![format!("Syntax: {}", def.syntax)],
        });
    }

    let mut reply = match def.name {
        "USER" => cmd_user(ctx, rest).await?,
        "ADDUSER" => cmd_adduser(ctx, rest).await?,
        "DELUSER" => cmd_deluser(ctx, rest).await?,
        "CHANGE" => cmd_change(ctx, rest).await?,
        "CHOWN" => cmd_chown(ctx, rest).await?,
        "GIVE" => cmd_give(ctx, rest).await?,
        "TAKE" => cmd_take(ctx, rest).await?,
        "NUKE" => cmd_nuke(ctx, rest).await?,
        "UNNUKE" => cmd_unnuke(ctx, rest).await?,
        "WHO" => cmd_who(ctx).await?,
        "STATS" => cmd_stats(ctx, rest).await?,
        "SECTIONS" => cmd_sections(ctx)?,
        "ADDGROUP" => cmd_addgroup(ctx, rest).await?,
        "DELGROUP" => cmd_delgroup(ctx, rest).await?,
        "PASSWD" => cmd_passwd(ctx, rest).await?,
        "TAGLINE" => cmd_tagline(ctx, rest).await?,
        _ => return Err(Error::Protocol(format!("unknown SITE command: {}", sub))),
    };

    if let Some(cap) = ctx.config.max_sitecmd_lines {
        let cap = cap as usize;
        if reply.lines.len() > cap {
            reply.lines.truncate(cap);
            reply
                .lines
                .push("(output truncated; raise max_sitecmd_lines)".to_string());
        }
    }
    Ok(reply)
}

async fn run_custom(
    ctx: &SiteCtx<'_>,
    custom: &crate::config::SiteCmd,
    args: &[String],
) -> Result<SiteReply> {
    match custom.method {
        SiteCmdMethod::Text => {
            let path = ctx.config.datapath.join(&custom.target);
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|_| Error::NotFound(custom.target.clone()))?;
            Ok(SiteReply::ok(text.lines().map(str::to_string).collect()))
        }
        SiteCmdMethod::Exec => {
            let output = tokio::process::Command::new(&custom.target)
                .args(&custom.args)
                .args(args)
                .env("SKUA_USER", &ctx.user.name)
                .env("SKUA_CWD", ctx.cwd)
                .output()
                .await
                .map_err(Error::Io)?;
            let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect();
            if !output.status.success() {
                lines.push(format!("(exit status {})", output.status));
            }
            Ok(SiteReply::ok(lines))
        }
        SiteCmdMethod::Is => {
            // Alias onto another subcommand line.
            let mut aliased: Vec<String> =
                custom.target.split_whitespace().map(str::to_string).collect();
            aliased.extend(args.iter().cloned());
            Box::pin(dispatch(ctx, &aliased)).await
        }
    }
}

fn describe_user(user: &User, group_name: &str) -> Vec<String> {
    let mut lines = vec![
        format!("+ User: {} ({})", user.name, user.uid),
        format!("| Flags: {}  Group: {}", user.flags, group_name),
        format!("| Ratio: 1:{}  Weekly allotment: {}KB", user.default_ratio, user.weekly_allotment_kb),
        format!(
            "| Uploads: {} files / {}KB  Downloads: {} files / {}KB",
            user.uploaded_files, user.uploaded_kb, user.downloaded_files, user.downloaded_kb
        ),
        format!("| Home: {}  Tagline: {}", user.home_dir, user.tagline),
    ];
    let mut credit_lines: Vec<String> = user
        .credits_kb
        .iter()
        .map(|(section, kb)| format!("| Credits [{}]: {}KB", section, kb))
        .collect();
    credit_lines.sort();
    lines.extend(credit_lines);
    lines
}

async fn cmd_user(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let name = args.first().map(String::as_str).unwrap_or(&ctx.user.name);
    // Only operators may inspect other accounts.
    if name != ctx.user.name && !ctx.principal.is_siteop() && !ctx.principal.has_flag(flag::GADMIN)
    {
        return Ok(SiteReply::fail("Permission denied."));
    }
    match ctx.users.user_by_name(name).await? {
        Some(user) => {
            let group = ctx.groups.group_name_of(user.primary_gid);
            Ok(SiteReply::ok(describe_user(&user, &group)))
        }
        None => Ok(SiteReply::fail(format!("User {} doesn't exist.", name))),
    }
}

async fn cmd_adduser(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let name = args[0].to_ascii_lowercase();
    let password = &args[1];
    let gid = match args.get(2) {
        Some(group_name) => match ctx.groups.group_by_name(group_name).await? {
            Some(group) => group.gid,
            None => return Ok(SiteReply::fail(format!("Group {} doesn't exist.", group_name))),
        },
        None => ctx.user.primary_gid,
    };
    // Group admins only add into their own groups.
    if !ctx.principal.is_siteop() && !ctx.principal.in_group(gid) {
        return Ok(SiteReply::fail("Permission denied."));
    }
    let count = ctx.users.users_matching("*").await?.len();
    if count >= ctx.config.total_users as usize {
        return Ok(SiteReply::fail("User limit reached."));
    }
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, password);
    let user = ctx
        .users
        .create_user(NewUser {
            name: name.clone(),
            primary_gid: gid,
            flags: ctx.config.default_flags.clone(),
            default_ratio: 3,
            home_dir: "/".to_string(),
            password_salt: salt,
            password_hash: hash,
        })
        .await?;
    info!(by = %ctx.user.name, added = %name, uid = user.uid, "user added");
    Ok(SiteReply::ok(vec![format!(
        "User {} added (uid {}).",
        name, user.uid
    )]))
}

async fn cmd_deluser(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let Some(user) = ctx.users.user_by_name(&args[0]).await? else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", args[0])));
    };
    if !ctx.principal.is_siteop() && !ctx.principal.in_group(user.primary_gid) {
        return Ok(SiteReply::fail("Permission denied."));
    }
    ctx.users.delete_user(user.uid).await?;
    info!(by = %ctx.user.name, deleted = %user.name, "user deleted");
    Ok(SiteReply::ok(vec![format!("User {} deleted.", user.name)]))
}

async fn cmd_change(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let Some(target) = ctx.users.user_by_name(&args[0]).await? else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", args[0])));
    };
    let setting = args[1].to_ascii_lowercase();
    let value = args[2..].join(" ");

    let field = match setting.as_str() {
        "ratio" => {
            let ratio: i32 = value
                .parse()
                .map_err(|_| Error::Protocol(format!("bad ratio: {}", value)))?;
            if ratio < 0 || ratio > ctx.config.maximum_ratio {
                return Ok(SiteReply::fail(format!(
                    "Ratio must be 0-{}.",
                    ctx.config.maximum_ratio
                )));
            }
            UserField::DefaultRatio(ratio)
        }
        "sratio" => {
            // sratio <SECTION> <ratio>
            let section = args[2].to_ascii_uppercase();
            let ratio: i32 = args
                .get(3)
                .ok_or_else(|| Error::Protocol("missing section ratio".into()))?
                .parse()
                .map_err(|_| Error::Protocol("bad section ratio".into()))?;
            UserField::SectionRatio(section, ratio)
        }
        "wkly_allotment" => UserField::WeeklyAllotmentKb(parse_kb(&value)?),
        "homedir" => UserField::HomeDir(crate::vfs::normalize(&value)?),
        "flags" => {
            let flags = match value.chars().next() {
                Some('+') => {
                    let mut flags = target.flags.clone();
                    for c in value[1..].chars() {
                        if !flags.contains(c) {
                            flags.push(c);
                        }
                    }
                    flags
                }
                Some('-') => target
                    .flags
                    .chars()
                    .filter(|c| !value[1..].contains(*c))
                    .collect(),
                _ => value.clone(),
            };
            UserField::Flags(flags)
        }
        "expires" => {
            if value.eq_ignore_ascii_case("never") {
                UserField::ExpiresAt(None)
            } else {
                let date = chrono::NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .map_err(|_| Error::Protocol(format!("bad date: {}", value)))?;
                let when = date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .ok_or_else(|| Error::Protocol("bad date".into()))?;
                UserField::ExpiresAt(Some(when))
            }
        }
        "tagline" => UserField::Tagline(value.clone()),
        "requires_tls" => UserField::RequiresTls(
            value.eq_ignore_ascii_case("true") || value == "1",
        ),
        other => {
            return Ok(SiteReply::fail(format!("Unknown setting: {}", other)));
        }
    };

    ctx.users.save_field(target.uid, field).await?;
    info!(by = %ctx.user.name, target = %target.name, setting = %setting, "setting changed");
    Ok(SiteReply::ok(vec![format!(
        "Changed {} for {}.",
        setting, target.name
    )]))
}

async fn cmd_chown(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let (user_part, group_part) = match args[0].split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (args[0].as_str(), None),
    };
    let Some(uid) = ctx.users.id_of(user_part) else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", user_part)));
    };
    let gid = match group_part {
        Some(name) => match ctx.groups.group_id_of(name) {
            Some(gid) => gid,
            None => return Ok(SiteReply::fail(format!("Group {} doesn't exist.", name))),
        },
        None => match ctx.users.user_by_id(uid).await? {
            Some(user) => user.primary_gid,
            None => return Ok(SiteReply::fail("User vanished.".to_string())),
        },
    };

    let vpath = crate::vfs::join(ctx.cwd, &args[1])?;
    if !ctx.vfs.exists(&vpath).await {
        return Ok(SiteReply::fail(format!("{}: No such file or directory.", args[1])));
    }
    let (dir, name) = crate::vfs::split(&vpath);
    ctx.vfs.owner_set(&dir, &name, Owner::new(uid, gid)).await?;
    Ok(SiteReply::ok(vec![format!(
        "Owner of {} set to {}:{}.",
        vpath, uid, gid
    )]))
}

async fn cmd_give(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let (section, rest) = parse_section_flag(ctx, args)?;
    let (target_name, amount) = match rest {
        [t, a, ..] => (t, a),
        _ => return Err(Error::Protocol("SITE GIVE <user> <amount>".into())),
    };
    let Some(target) = ctx.users.user_by_name(target_name).await? else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", target_name)));
    };
    let kb = parse_kb(amount)?;

    let mut lines = Vec::new();
    let full_give = keyword_allowed(ctx, "give", ctx.principal.is_siteop());
    if !full_give {
        // The giveown subset: credits come out of the giver's balance.
        let ratio = ctx.user.effective_ratio(&section, None);
        if ratio == 0 {
            return Ok(SiteReply::fail(
                "Not allowed to give credits when you have leech!",
            ));
        }
        match credits::debit(ctx.users, ctx.user, &section, kb).await {
            Ok(()) => {}
            Err(Error::QuotaExceeded(_)) => {
                return Ok(SiteReply::fail("Not enough credits to do that."));
            }
            Err(e) => return Err(e),
        }
        lines.push(format!("Taken {}KB credits from you!", kb));
    }

    credits::credit(ctx.users, target.uid, &section, kb).await?;
    lines.push(format!("Given {}KB credits to {}.", kb, target.name));
    Ok(SiteReply::ok(lines))
}

async fn cmd_take(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let (section, rest) = parse_section_flag(ctx, args)?;
    let (target_name, amount) = match rest {
        [t, a, ..] => (t, a),
        _ => return Err(Error::Protocol("SITE TAKE <user> <amount>".into())),
    };
    let Some(target) = ctx.users.user_by_name(target_name).await? else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", target_name)));
    };
    let kb = parse_kb(amount)?;
    let balance = credits::credit(ctx.users, target.uid, &section, -kb).await?;
    Ok(SiteReply::ok(vec![format!(
        "Taken {}KB credits from {} (balance {}KB).",
        kb, target.name, balance
    )]))
}

async fn dir_size_kb(ctx: &SiteCtx<'_>, vpath: &str) -> Result<i64> {
    let mut total = 0u64;
    for entry in ctx.vfs.list(vpath).await? {
        if !entry.is_dir {
            total += entry.size;
        }
    }
    Ok(credits::kb_for_bytes(total))
}

async fn cmd_nuke(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let vpath = crate::vfs::join(ctx.cwd, &args[0])?;
    let multiplier: i64 = args[1]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad multiplier: {}", args[1])))?;
    let multiplier = multiplier.clamp(0, ctx.config.multiplier_max as i64);
    let reason = args[2..].join(" ");

    if !ctx.vfs.is_dir(&vpath).await {
        return Ok(SiteReply::fail(format!("{}: not a directory.", vpath)));
    }
    let owner = ctx.vfs.owner_of(&vpath).await;
    let mut size_kb = dir_size_kb(ctx, &vpath).await?;
    if size_kb == 0 {
        // Empty nukes still sting; empty_nuke is already in kilobytes.
        size_kb = ctx.config.empty_nuke as i64;
    }
    let taken_kb = size_kb * multiplier;

    if owner.uid >= 0 {
        // Straight to negative if the uploader cannot cover it.
        ctx.users
            .adjust_credits(owner.uid, skua_core::DEFAULT_SECTION, -taken_kb)
            .await?;
    }

    let (dir, name) = crate::vfs::split(&vpath);
    let style = ctx
        .config
        .nukedir_style
        .as_ref()
        .map(|s| s.format.clone())
        .unwrap_or_else(|| "NUKED-%N".to_string());
    let nuked_name = style.replace("%N", &name);
    let nuked_path = crate::vfs::join(&dir, &nuked_name)?;
    ctx.vfs.rename(&vpath, &nuked_path).await?;

    let record = NukeRecord {
        original_name: name.clone(),
        owner_uid: owner.uid,
        multiplier,
        taken_kb,
        reason: reason.clone(),
    };
    let record_path = ctx.vfs.resolve(&nuked_path)?.join(NUKE_RECORD_FILE);
    tokio::fs::write(
        &record_path,
        serde_json::to_vec(&record)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
    )
    .await?;

    info!(by = %ctx.user.name, path = %vpath, multiplier, taken_kb, "nuked");
    Ok(SiteReply::ok(vec![format!(
        "Nuked {} ({}x, {}KB taken from {}).",
        vpath,
        multiplier,
        taken_kb,
        ctx.users.name_of(owner.uid)
    )]))
}

async fn cmd_unnuke(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let vpath = crate::vfs::join(ctx.cwd, &args[0])?;
    let record_path = ctx.vfs.resolve(&vpath)?.join(NUKE_RECORD_FILE);
    let bytes = tokio::fs::read(&record_path)
        .await
        .map_err(|_| Error::NotFound(format!("{} is not nuked", vpath)))?;
    let record: NukeRecord = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    if record.owner_uid >= 0 {
        ctx.users
            .adjust_credits(record.owner_uid, skua_core::DEFAULT_SECTION, record.taken_kb)
            .await?;
    }
    tokio::fs::remove_file(&record_path).await?;

    let (dir, _) = crate::vfs::split(&vpath);
    let restored = crate::vfs::join(&dir, &record.original_name)?;
    ctx.vfs.rename(&vpath, &restored).await?;

    info!(by = %ctx.user.name, path = %restored, returned_kb = record.taken_kb, "unnuked");
    Ok(SiteReply::ok(vec![format!(
        "Unnuked {} ({}KB returned).",
        restored, record.taken_kb
    )]))
}

async fn cmd_who(ctx: &SiteCtx<'_>) -> Result<SiteReply> {
    let mut lines = Vec::new();
    for info in ctx.tracker.list() {
        let Some(username) = info.username.clone() else {
            continue;
        };
        // hideinwho paths and the hideuser ACL keep operators invisible.
        if let Some(uid) = info.uid {
            if uid != ctx.user.uid && !ctx.principal.is_siteop() {
                if let Some(target) = ctx.users.user_by_id(uid).await? {
                    let target_principal = target.principal();
                    if ctx.config.hideuser.check(&target_principal, &[]) {
                        continue;
                    }
                }
            }
        }
        let what = match info.transferring {
            Some(direction) => format!("{} ({})", info.current_command, direction),
            None => info.current_command.clone(),
        };
        lines.push(format!("{:<12} {:<16} {}", username, info.peer_ip, what));
    }
    if lines.is_empty() {
        lines.push("No users online.".to_string());
    }
    Ok(SiteReply::ok(lines))
}

async fn cmd_stats(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let name = args.first().map(String::as_str).unwrap_or(&ctx.user.name);
    if name != ctx.user.name && !ctx.principal.is_siteop() {
        return Ok(SiteReply::fail("Permission denied."));
    }
    let Some(user) = ctx.users.user_by_name(name).await? else {
        return Ok(SiteReply::fail(format!("User {} doesn't exist.", name)));
    };
    let mut lines = vec![
        format!("Stats for {}:", user.name),
        format!("  Uploaded:   {} files, {}KB", user.uploaded_files, user.uploaded_kb),
        format!("  Downloaded: {} files, {}KB", user.downloaded_files, user.downloaded_kb),
    ];
    let mut credit_lines: Vec<String> = user
        .credits_kb
        .iter()
        .map(|(section, kb)| format!("  Credits [{}]: {}KB", section, kb))
        .collect();
    credit_lines.sort();
    lines.extend(credit_lines);
    Ok(SiteReply::ok(lines))
}

fn cmd_sections(ctx: &SiteCtx<'_>) -> Result<SiteReply> {
    let mut lines = vec![format!("{:<12} {:<8} {:<10} PATHS", "SECTION", "RATIO", "CREDITS")];
    for section in &ctx.config.sections {
        let paths: Vec<&str> = section.paths.iter().map(|p| p.pattern()).collect();
        lines.push(format!(
            "{:<12} {:<8} {:<10} {}",
            section.name,
            section
                .ratio
                .map(|r| format!("1:{}", r))
                .unwrap_or_else(|| "-".to_string()),
            if section.separate_credits { "separate" } else { "shared" },
            paths.join(" ")
        ));
    }
    if ctx.config.sections.is_empty() {
        lines.push("No sections configured.".to_string());
    }
    Ok(SiteReply::ok(lines))
}

async fn cmd_addgroup(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let description = args[1..].join(" ");
    let group = ctx.groups.create_group(&args[0], &description).await?;
    Ok(SiteReply::ok(vec![format!(
        "Group {} added (gid {}).",
        group.name, group.gid
    )]))
}

async fn cmd_delgroup(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let Some(group) = ctx.groups.group_by_name(&args[0]).await? else {
        return Ok(SiteReply::fail(format!("Group {} doesn't exist.", args[0])));
    };
    let (primary, secondary) = ctx.groups.member_counts(group.gid).await?;
    if primary + secondary > 0 {
        return Ok(SiteReply::fail(format!(
            "Group {} still has {} member(s).",
            group.name,
            primary + secondary
        )));
    }
    ctx.groups.delete_group(group.gid).await?;
    Ok(SiteReply::ok(vec![format!("Group {} deleted.", group.name)]))
}

async fn cmd_passwd(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &args[0]);
    ctx.users
        .save_field(ctx.user.uid, UserField::Password { salt, hash })
        .await?;
    Ok(SiteReply::ok(vec!["Password changed.".to_string()]))
}

async fn cmd_tagline(ctx: &SiteCtx<'_>, args: &[String]) -> Result<SiteReply> {
    let tagline = args.join(" ");
    ctx.users
        .save_field(ctx.user.uid, UserField::Tagline(tagline.clone()))
        .await?;
    Ok(SiteReply::ok(vec![format!("Tagline set to: {}", tagline)]))
}
