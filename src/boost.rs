// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Player boost data, the reference replicated entity.
//!
//! A player carries a list of timed boosts, each adding a flat amount to the
//! payout multiplier of one currency, optionally restricted to one job.
//! Multiplier lookups happen on every payout, so totals are memoized per
//! `(job, currency)` until the earliest contributing boost expires or the
//! boost list changes (local mutation or remote merge).
//!
//! ```rust
//! use crossync::boost::{Boost, CurrencyType, PlayerBoosts};
//! use crossync::Entity;
//! use std::time::Duration;
//!
//! let mut boosts = PlayerBoosts::new("069a79f4-44e9-4726-a5be-fca90e38aaf5");
//! boosts.add_boost(Boost::new(CurrencyType::Money, 1.0).expiring_in(Duration::from_secs(60)));
//! assert_eq!(boosts.boost("miner", CurrencyType::Money, 1.0), 2.0);
//! ```

use crate::entity::Entity;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Currencies a job pays out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrencyType {
    Money,
    Exp,
    Points,
}

impl CurrencyType {
    pub const ALL: [CurrencyType; 3] = [CurrencyType::Money, CurrencyType::Exp, CurrencyType::Points];
}

/// One timed boost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boost {
    pub kind: CurrencyType,
    /// Added to the base multiplier while active.
    pub value: f64,
    /// Restrict to one job; `None` applies to every job.
    #[serde(default)]
    pub job: Option<String>,
    /// Unix epoch milliseconds; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Boost {
    pub fn new(kind: CurrencyType, value: f64) -> Self {
        Self {
            kind,
            value,
            job: None,
            expires_at: None,
        }
    }

    pub fn for_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.expires_at = Some(now_ms().saturating_add(ttl_ms));
        self
    }

    pub fn expiring_at(mut self, epoch_ms: i64) -> Self {
        self.expires_at = Some(epoch_ms);
        self
    }

    pub fn is_active_at(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now_ms)
    }

    fn applies_to(&self, job: &str, kind: CurrencyType) -> bool {
        self.kind == kind && self.job.as_deref().map_or(true, |j| j.eq_ignore_ascii_case(job))
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedTotal {
    total: f64,
    /// Earliest expiry among the boosts summed, if any.
    valid_until: Option<i64>,
}

/// All boosts held by one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerBoosts {
    id: String,
    #[serde(default)]
    boosts: Vec<Boost>,
    #[serde(skip)]
    cache: HashMap<(String, CurrencyType), CachedTotal>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl PlayerBoosts {
    pub fn boosts(&self) -> &[Boost] {
        &self.boosts
    }

    pub fn add_boost(&mut self, boost: Boost) {
        self.boosts.push(boost);
        self.cache.clear();
    }

    /// Drop expired boosts. Returns how many were removed.
    pub fn remove_expired(&mut self) -> usize {
        let now = now_ms();
        let before = self.boosts.len();
        self.boosts.retain(|b| b.is_active_at(now));
        let removed = before - self.boosts.len();
        if removed > 0 {
            self.cache.clear();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.boosts.clear();
        self.cache.clear();
    }

    /// Effective multiplier: `base` plus every active boost of `kind` that
    /// applies to `job`.
    pub fn boost(&mut self, job: &str, kind: CurrencyType, base: f64) -> f64 {
        let now = now_ms();
        let key = (job.to_ascii_lowercase(), kind);

        if let Some(cached) = self.cache.get(&key) {
            if cached.valid_until.map_or(true, |at| at > now) {
                return base + cached.total;
            }
        }

        let mut total = 0.0;
        let mut valid_until: Option<i64> = None;
        for boost in self.boosts.iter().filter(|b| b.applies_to(job, kind) && b.is_active_at(now)) {
            total += boost.value;
            if let Some(at) = boost.expires_at {
                valid_until = Some(valid_until.map_or(at, |v| v.min(at)));
            }
        }

        self.cache.insert(key, CachedTotal { total, valid_until });
        base + total
    }

    /// Whether a memoized total exists for `(job, kind)`.
    pub fn cache_is_warm(&self, job: &str, kind: CurrencyType) -> bool {
        self.cache.contains_key(&(job.to_ascii_lowercase(), kind))
    }

    pub fn has_active_boost(&self) -> bool {
        let now = now_ms();
        self.boosts.iter().any(|b| b.is_active_at(now))
    }
}

impl PartialEq for PlayerBoosts {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.boosts == other.boosts
    }
}

impl Entity for PlayerBoosts {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            boosts: Vec::new(),
            cache: HashMap::new(),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_removable(&self) -> bool {
        !self.has_active_boost()
    }

    fn merge(&mut self, remote: Self) {
        self.boosts = remote.boosts;
        self.cache.clear();
    }
}
