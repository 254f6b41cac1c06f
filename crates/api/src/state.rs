use std::sync::Arc;

use handle_watch_domain::services::telemetry::TelemetryGuard;
use handle_watch_engine::EngineRuntime;

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<EngineRuntime>,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(runtime: Arc<EngineRuntime>, telemetry: TelemetryGuard) -> Self {
        Self { runtime, telemetry }
    }

    pub fn runtime(&self) -> &EngineRuntime {
        self.runtime.as_ref()
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
