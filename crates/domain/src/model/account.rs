use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::{AccountId, NotificationKind, UserId};

/// Window (inclusive, in days) in which a pending deadline counts as
/// expiring soon.
pub const EXPIRING_SOON_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner: UserId,
    pub handle: String,
    pub start_at: DateTime<Utc>,
    /// Local calendar date of `start_at`; the deadline is derived from it.
    pub start_on: NaiveDate,
    pub period_days: u32,
}

impl NewAccount {
    /// Normalises the handle (see [`normalize_handle`]) and clamps the period
    /// to at least one day.
    pub fn new(
        owner: UserId,
        handle: &str,
        start_at: DateTime<Utc>,
        start_on: NaiveDate,
        period_days: u32,
    ) -> Self {
        Self {
            owner,
            handle: normalize_handle(handle),
            start_at,
            start_on,
            period_days: period_days.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: AccountId,
    pub owner: UserId,
    pub handle: String,
    pub start_at: DateTime<Utc>,
    pub start_on: NaiveDate,
    pub period_days: u32,
    pub finished_on: Option<NaiveDate>,
    pub done: bool,
}

impl AccountRecord {
    pub fn deadline(&self) -> NaiveDate {
        self.start_on + Duration::days(i64::from(self.period_days))
    }

    pub fn is_pending(&self) -> bool {
        !self.done
    }

    /// Classifies a pending account against `today`. Finished accounts and
    /// deadlines further out than the reminder window yield `None`.
    pub fn classify_deadline(&self, today: NaiveDate) -> Option<DeadlineStatus> {
        if self.done {
            return None;
        }
        let deadline = self.deadline();
        let delta = (deadline - today).num_days();
        if delta < 0 {
            Some(DeadlineStatus {
                kind: NotificationKind::Expired,
                days: -delta,
            })
        } else if delta <= EXPIRING_SOON_WINDOW_DAYS {
            Some(DeadlineStatus {
                kind: NotificationKind::ExpiringSoon,
                days: delta,
            })
        } else {
            None
        }
    }
}

/// Result of deadline classification. `days` is the overdue count for
/// expired accounts and the remaining count for expiring ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineStatus {
    pub kind: NotificationKind,
    pub days: i64,
}

/// Handles are case-insensitive on the provider side; they are stored
/// trimmed, without a leading `@`, in lowercase.
pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').trim().to_lowercase()
}
