use chrono::{DateTime, NaiveDate, Utc};

use super::{ApiKeyId, UserId};

pub const DEFAULT_API_DAILY_LIMIT: u32 = 950;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApiKey {
    pub owner: UserId,
    pub secret: String,
    pub created_on: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub owner: UserId,
    pub secret: String,
    pub used_today: u32,
    pub ref_day: NaiveDate,
    pub working: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.ref_day < today
    }

    /// Applies the daily reset: a key first observed on a new calendar day
    /// starts over at zero uses.
    pub fn normalize_for(&mut self, today: NaiveDate) -> bool {
        if self.is_stale(today) {
            self.used_today = 0;
            self.ref_day = today;
            true
        } else {
            false
        }
    }

    pub fn is_available(&self, limit: u32) -> bool {
        self.working && self.used_today < limit
    }

    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.used_today)
    }

    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }

    /// Read model of the key as seen on `today`, without mutating the row.
    pub fn status(&self, today: NaiveDate, limit: u32) -> ApiKeyStatus {
        let mut view = self.clone();
        view.normalize_for(today);
        ApiKeyStatus {
            id: view.id,
            masked_key: view.masked(),
            used_today: view.used_today,
            limit,
            remaining: view.remaining(limit),
            working: view.working,
            available: view.is_available(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyStatus {
    pub id: ApiKeyId,
    pub masked_key: String,
    pub used_today: u32,
    pub limit: u32,
    pub remaining: u32,
    pub working: bool,
    pub available: bool,
}

pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{prefix}...")
}
