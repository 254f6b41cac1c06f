//! Verification engine: key and proxy pools, the two-stage verification
//! pipeline, per-user schedulers and the daily deadline notifier.
//!
//! The API binary embeds [`EngineRuntime`] in-process; `main.rs` runs the same
//! runtime headless for deployments without the status surface.

pub mod api_key_pool;
pub mod client;
pub mod deadline;
pub mod error;
pub mod notifier;
pub mod pipeline;
pub mod provider;
pub mod proxy_pool;
pub mod runtime;
pub mod scheduler;
pub mod secret;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use api_key_pool::ApiKeyPool;
pub use deadline::{DeadlineNotifier, DeadlineReport};
pub use error::EngineError;
pub use notifier::{BotApiNotifier, InlineButton, LogNotifier, Notifier, NotifyError};
pub use pipeline::{AccountVerifier, IndeterminateReason, Outcome, VerificationPipeline};
pub use provider::{LookupResult, ProfileProvider, ProfileSummary, ProviderError, RapidApiProvider};
pub use proxy_pool::{ImportReport, ProxyEndpoint, ProxyPool, SelectionStrategy};
pub use runtime::{EngineParts, EngineRuntime};
pub use scheduler::{SchedulerSettings, SchedulerStatus, UserJobStatus, UserScheduler};
pub use settings::GlobalSettings;
