use chrono::{DateTime, Duration, Utc};
use strum_macros::{AsRefStr, Display, EnumString};

use super::{ProxyId, UserId};

/// Consecutive failures that put a proxy into cooldown.
pub const COOLDOWN_FAIL_STREAK: u32 = 3;
/// Consecutive failures that deactivate a proxy.
pub const DEACTIVATE_FAIL_STREAK: u32 = 5;
pub const COOLDOWN_MINUTES: i64 = 15;
pub const DEFAULT_PROXY_PRIORITY: u8 = 5;
/// Success rate assumed for a proxy that has never been used.
pub const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

pub fn cooldown_duration() -> Duration {
    Duration::minutes(COOLDOWN_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProxy {
    pub owner: UserId,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password_cipher: Option<Vec<u8>>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub id: ProxyId,
    pub owner: UserId,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password_cipher: Option<Vec<u8>>,
    pub active: bool,
    /// 1 is best, 10 is worst.
    pub priority: u8,
    pub used: u64,
    pub success: u64,
    pub fail_streak: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Side effects of a single failure, reported for logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureEffect {
    pub cooled_down: bool,
    pub deactivated: bool,
}

impl ProxyRecord {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.in_cooldown(now)
    }

    pub fn apply_success(&mut self, now: DateTime<Utc>) {
        self.used += 1;
        self.success += 1;
        self.fail_streak = 0;
        self.cooldown_until = None;
        self.last_checked = Some(now);
    }

    pub fn apply_failure(&mut self, now: DateTime<Utc>, apply_cooldown: bool) -> FailureEffect {
        self.used += 1;
        self.fail_streak += 1;
        self.last_checked = Some(now);

        let mut effect = FailureEffect::default();
        if apply_cooldown && self.fail_streak >= COOLDOWN_FAIL_STREAK {
            self.cooldown_until = Some(now + cooldown_duration());
            effect.cooled_down = true;
        }
        if self.fail_streak >= DEACTIVATE_FAIL_STREAK && self.active {
            self.active = false;
            effect.deactivated = true;
        }
        effect
    }

    pub fn success_rate(&self) -> f64 {
        if self.used == 0 {
            NEUTRAL_SUCCESS_RATE
        } else {
            self.success as f64 / self.used as f64
        }
    }

    /// `0.7·successRate + 0.2·(1 − used/maxUsed) + 0.1·(1 − (priority−1)/9)`.
    pub fn adaptive_score(&self, max_used: u64) -> f64 {
        let usage = if max_used == 0 {
            1.0
        } else {
            1.0 - (self.used as f64 / max_used as f64)
        };
        let priority = f64::from(self.priority.clamp(1, 10));
        let priority_score = 1.0 - (priority - 1.0) / 9.0;
        0.7 * self.success_rate() + 0.2 * usage + 0.1 * priority_score
    }
}

/// Aggregate health of one user's proxy pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub in_cooldown: usize,
    pub success_rate: f64,
    pub total_uses: u64,
    pub total_successes: u64,
}

impl ProxyStats {
    pub fn collect(proxies: &[ProxyRecord], now: DateTime<Utc>) -> Self {
        let total = proxies.len();
        let active = proxies.iter().filter(|proxy| proxy.active).count();
        let in_cooldown = proxies
            .iter()
            .filter(|proxy| proxy.active && proxy.in_cooldown(now))
            .count();
        let total_uses: u64 = proxies.iter().map(|proxy| proxy.used).sum();
        let total_successes: u64 = proxies.iter().map(|proxy| proxy.success).sum();
        let success_rate = if total_uses == 0 {
            0.0
        } else {
            total_successes as f64 / total_uses as f64
        };

        Self {
            total,
            active,
            inactive: total - active,
            in_cooldown,
            success_rate,
            total_uses,
            total_successes,
        }
    }
}
