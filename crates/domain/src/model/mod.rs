//! Entities and value types shared by the storage and engine crates.

mod account;
mod api_key;
mod proxy;
mod settings;
mod verify_mode;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

pub use account::*;
pub use api_key::*;
pub use proxy::*;
pub use settings::*;
pub use verify_mode::*;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Chat-level identity of an end user; assigned externally.
    UserId
);
id_type!(AccountId);
id_type!(ApiKeyId);
id_type!(ProxyId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserRole {
    User,
    Admin,
    Superuser,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Superuser => "superuser",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownRole> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "superuser" => Ok(Self::Superuser),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown user role `{0}`")]
pub struct UnknownRole(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub role: UserRole,
    pub active: bool,
    pub check_interval_minutes: u32,
    pub auto_check_enabled: bool,
    /// Raw persisted tag. Parsed on use so a corrupted row surfaces as a
    /// misconfiguration of that user's job instead of a load failure.
    pub verify_mode: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn wants_auto_check(&self) -> bool {
        self.active && self.auto_check_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: UserId,
    pub role: UserRole,
    pub check_interval_minutes: u32,
    pub auto_check_enabled: bool,
    pub verify_mode: VerifyMode,
    pub created_at: DateTime<Utc>,
}

impl NewUser {
    pub fn new(id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            role: UserRole::User,
            check_interval_minutes: DEFAULT_CHECK_INTERVAL_MINUTES,
            auto_check_enabled: false,
            verify_mode: VerifyMode::default(),
            created_at,
        }
    }
}

/// Deadline reminder flavour; one receipt per kind per account per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationKind {
    ExpiringSoon,
    Expired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpiringSoon => "expiring_soon",
            Self::Expired => "expired",
        }
    }

    /// Short token used inside inline-button callback data.
    pub fn callback_token(self) -> &'static str {
        match self {
            Self::ExpiringSoon => "soon",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expiring_soon" => Some(Self::ExpiringSoon),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReceipt {
    pub owner: UserId,
    pub account: AccountId,
    pub kind: NotificationKind,
    pub sent_on: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRecord {
    pub id: i64,
    pub owner: UserId,
    pub account: AccountId,
    pub kind: NotificationKind,
    pub sent_on: NaiveDate,
    pub created_at: DateTime<Utc>,
}
