use std::str::FromStr;

use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};
use thiserror::Error;

/// Per-user verification mode tag. The engine only reads it as a set of
/// stage toggles; see [`VerifyMode::stages`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum VerifyMode {
    #[default]
    #[strum(serialize = "api+instagram")]
    ApiInstagram,
    #[strum(serialize = "api+proxy")]
    ApiProxy,
    #[strum(serialize = "api+proxy+instagram")]
    ApiProxyInstagram,
    #[strum(serialize = "instagram+proxy")]
    InstagramProxy,
    #[strum(serialize = "instagram")]
    Instagram,
    #[strum(serialize = "proxy")]
    Proxy,
    #[strum(serialize = "simple_monitor")]
    SimpleMonitor,
    #[strum(serialize = "full_bypass")]
    FullBypass,
    #[strum(serialize = "api-v2")]
    ApiV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageToggles {
    pub stage_a: bool,
    pub stage_b: bool,
    /// A Stage A hit only counts once Stage B has confirmed it.
    pub require_confirmation: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown verification mode `{0}`")]
pub struct VerifyModeError(pub String);

impl VerifyMode {
    pub fn parse(tag: &str) -> Result<Self, VerifyModeError> {
        Self::from_str(tag.trim()).map_err(|_| VerifyModeError(tag.trim().to_string()))
    }

    pub fn as_tag(self) -> &'static str {
        self.into()
    }

    pub fn all_tags() -> Vec<&'static str> {
        Self::iter().map(Self::as_tag).collect()
    }

    pub fn stages(self) -> StageToggles {
        match self {
            Self::ApiInstagram | Self::ApiProxy => StageToggles {
                stage_a: true,
                stage_b: true,
                require_confirmation: false,
            },
            Self::ApiProxyInstagram | Self::ApiV2 => StageToggles {
                stage_a: true,
                stage_b: true,
                require_confirmation: true,
            },
            Self::InstagramProxy
            | Self::Instagram
            | Self::Proxy
            | Self::SimpleMonitor
            | Self::FullBypass => StageToggles {
                stage_a: false,
                stage_b: true,
                require_confirmation: false,
            },
        }
    }
}
