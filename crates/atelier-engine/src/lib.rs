pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod provider;
pub mod quota;
pub mod queue;

use std::sync::Arc;

use anyhow::{Context, Result};
use atelier_contracts::events::EventWriter;

pub use client::ImageClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ProviderKind};
pub use error::{ConfigError, GenerationError, ProviderError};
pub use orchestrator::{AttemptReport, Orchestrator};
pub use pipeline::{ATTEMPT_COST, SHOTS_PER_ATTEMPT};
pub use prompts::PromptLibrary;
pub use quota::QuotaTracker;
pub use queue::{QueueController, QueueTicker};

/// Wires configuration into a ready-to-use controller: provider, prompt
/// library, quota window, clock and optional event log.
pub struct AtelierEngine {
    config: EngineConfig,
    controller: Arc<QueueController>,
}

impl AtelierEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        events: Option<EventWriter>,
    ) -> Result<Self> {
        config::ensure_attempt_fits(&config.quota)?;
        let provider = provider::provider_for(&config)?;
        let prompts = PromptLibrary::load(config.prompts_path.as_deref()).with_context(|| {
            match config.prompts_path.as_deref() {
                Some(path) => format!("loading prompt library from {}", path.display()),
                None => "loading built-in prompt library".to_string(),
            }
        })?;
        tracing::info!(
            provider = provider.name(),
            model = %config.image_model,
            rpm_limit = config.quota.limit(),
            window_ms = config.quota.window_ms(),
            "engine ready"
        );

        let mut orchestrator = Orchestrator::new(
            ImageClient::new(provider),
            Arc::new(prompts),
            Arc::new(QuotaTracker::new(config.quota)),
            clock,
        );
        if let Some(events) = events {
            orchestrator = orchestrator.with_events(events);
        }
        Ok(Self {
            config,
            controller: Arc::new(QueueController::new(Arc::new(orchestrator))),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<QueueController> {
        &self.controller
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        self.controller.orchestrator()
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use atelier_contracts::request::{AspectRatio, GenerationRequest, ImageBlob};
    use atelier_contracts::scenes::SceneCatalog;

    use super::*;

    fn dryrun_config() -> EngineConfig {
        EngineConfig {
            provider: ProviderKind::Dryrun,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn dryrun_engine_completes_an_attempt() -> Result<()> {
        let events = EventWriter::in_memory("engine-test");
        let engine = AtelierEngine::new(
            dryrun_config(),
            Arc::new(ManualClock::new(0)),
            Some(events.clone()),
        )?;
        let scene = SceneCatalog::default()
            .first()
            .map(|preset| preset.to_mode())
            .context("default catalog is empty")?;
        let request = GenerationRequest::scene(
            ImageBlob::png(vec![1, 2, 3]),
            scene,
            AspectRatio::Portrait,
            None,
        );

        let report = engine.controller().submit(request);
        let outcome = report.outcome().context("attempt did not succeed")?;
        assert_eq!(outcome.images.len(), SHOTS_PER_ATTEMPT);
        assert_eq!(engine.orchestrator().quota().len(), ATTEMPT_COST);
        assert_eq!(
            events.captured_types().last().map(String::as_str),
            Some("attempt_succeeded")
        );
        Ok(())
    }

    #[test]
    fn gemini_without_key_is_rejected() {
        let result = AtelierEngine::new(
            EngineConfig::default(),
            Arc::new(SystemClock),
            None,
        );
        let err = result.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(err.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn window_smaller_than_an_attempt_is_rejected() -> Result<()> {
        let config = EngineConfig {
            quota: atelier_contracts::quota::QuotaWindow::new(ATTEMPT_COST - 1, 60_000)?,
            ..dryrun_config()
        };
        let err = AtelierEngine::new(config, Arc::new(ManualClock::new(0)), None)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("ATELIER_RPM_LIMIT"), "{err}");
        Ok(())
    }

    #[test]
    fn unreadable_prompt_override_is_reported_with_path() {
        let config = EngineConfig {
            prompts_path: Some(PathBuf::from("/nonexistent/prompts.json")),
            ..dryrun_config()
        };
        let err = AtelierEngine::new(config, Arc::new(SystemClock), None)
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("/nonexistent/prompts.json"));
    }
}
