//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use speech_gateway_config::Settings;
use speech_gateway_synth::{ReplicaRouter, SynthesisBackend, VoiceCatalog};

use crate::registry::SessionRegistry;

/// State handed to every handler. The registry and the replica pool are
/// the only pieces shared across sessions.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<ReplicaRouter>,
    pub catalog: Arc<VoiceCatalog>,
    pub backend: Arc<dyn SynthesisBackend>,
}

impl AppState {
    pub fn new(config: Settings, backend: Arc<dyn SynthesisBackend>) -> Self {
        let registry = SessionRegistry::new(
            config.session.max_sessions,
            Duration::from_secs(config.session.idle_timeout_secs),
            Duration::from_secs(config.session.sweep_interval_secs),
        );
        let router = ReplicaRouter::new(
            &config.synthesis.replicas,
            config.synthesis.fail_threshold,
        );
        let catalog = VoiceCatalog::with_presets(config.synthesis.preset_voices.iter().cloned());

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            router: Arc::new(router),
            catalog: Arc::new(catalog),
            backend,
        }
    }
}
