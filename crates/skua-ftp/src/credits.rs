//! Credit accounting.
//!
//! Balances live per (user, section) in kilobyte units; sections without
//! separate credits share the default balance. Downloads debit, uploads
//! earn ratio-multiplied credit, leech (ratio 0) touches nothing. Debits
//! for a whole transfer are taken up front and refunded pro-rata for bytes
//! never delivered.

use crate::config::{Config, Section};
use crate::error::{Error, Result};
use skua_core::{Principal, User, UserStore, DEFAULT_SECTION};

/// Kilobytes charged for a byte count, rounding up.
pub fn kb_for_bytes(bytes: u64) -> i64 {
    ((bytes + 1023) / 1024) as i64
}

/// The balance key a section charges against: its own name when it keeps
/// separate credits, the shared default otherwise.
pub fn credit_key(section: Option<&Section>) -> &str {
    match section {
        Some(s) if s.separate_credits => &s.name,
        _ => DEFAULT_SECTION,
    }
}

/// Ratio a transfer on `path` runs under: a `creditcheck` override when one
/// matches, otherwise the user's effective ratio for the section.
pub fn ratio_for(
    config: &Config,
    user: &User,
    principal: &Principal,
    groups: &[String],
    path: &str,
    section: Option<&Section>,
) -> i32 {
    if let Some(ratio) = config.credit_ratio(path, principal, groups) {
        return ratio;
    }
    let (name, section_ratio) = match section {
        Some(s) => (s.name.as_str(), s.ratio),
        None => (DEFAULT_SECTION, None),
    };
    user.effective_ratio(name, section_ratio)
}

/// An up-front debit that may need a partial refund.
#[derive(Debug, Clone)]
pub struct Charge {
    pub key: String,
    pub kb: i64,
    pub multiplier: i64,
}

impl Charge {
    /// Kilobytes to hand back when only `delivered` of `expected` bytes
    /// made it.
    pub fn refund_kb(&self, delivered: u64, expected: u64) -> i64 {
        if expected == 0 || delivered >= expected {
            return 0;
        }
        let owed = kb_for_bytes(expected - delivered) * self.multiplier;
        owed.min(self.kb)
    }
}

/// Debit `kb` from a balance, refusing rather than sinking below zero.
pub async fn debit(store: &dyn UserStore, user: &User, key: &str, kb: i64) -> Result<()> {
    if kb <= 0 {
        return Ok(());
    }
    let balance = store.credits(user.uid, key).await?;
    if balance < kb {
        return Err(Error::QuotaExceeded(format!(
            "{} needs {}KB in {}, has {}KB",
            user.name, kb, key, balance
        )));
    }
    store.adjust_credits(user.uid, key, -kb).await?;
    Ok(())
}

/// Unconditional credit (upload earnings, refunds, SITE GIVE).
pub async fn credit(store: &dyn UserStore, uid: skua_core::UserId, key: &str, kb: i64) -> Result<i64> {
    Ok(store.adjust_credits(uid, key, kb).await?)
}

/// Derive section, ratio and loss multiplier for a download on `path` and
/// take the whole debit up front. `None` means the download is free: leech
/// ratio, a zero `creditcheck`, or a `creditloss` exemption.
pub async fn transfer_debit(
    store: &dyn UserStore,
    config: &Config,
    user: &User,
    principal: &Principal,
    groups: &[String],
    path: &str,
    bytes: u64,
) -> Result<Option<Charge>> {
    let section = config.section_for(path);
    let ratio = ratio_for(config, user, principal, groups, path, section);
    let is_leech = ratio == 0;
    let multiplier = config.credit_loss_multiplier(path, principal, groups, is_leech);
    if multiplier == 0 {
        return Ok(None);
    }
    let key = credit_key(section).to_string();
    let kb = kb_for_bytes(bytes) * multiplier;
    debit(store, user, &key, kb).await?;
    Ok(Some(Charge { key, kb, multiplier }))
}

/// Credit an upload of `bytes` at the resolved ratio. Returns the credited
/// kilobytes.
pub async fn upload_credit(
    store: &dyn UserStore,
    config: &Config,
    user: &User,
    principal: &Principal,
    groups: &[String],
    path: &str,
    bytes: u64,
) -> Result<i64> {
    let section = config.section_for(path);
    let ratio = ratio_for(config, user, principal, groups, path, section);
    if ratio <= 0 {
        return Ok(0);
    }
    let ratio = ratio.min(config.maximum_ratio.max(1));
    let kb = kb_for_bytes(bytes) * ratio as i64;
    credit(store, user.uid, credit_key(section), kb).await?;
    Ok(kb)
}
