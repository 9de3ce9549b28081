use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use atelier_contracts::events::EventWriter;
use atelier_contracts::outcome::{AttemptStep, GenerationOutcome, OrchestratorState};
use atelier_contracts::request::{GenerationMode, GenerationRequest};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::client::ImageClient;
use crate::clock::Clock;
use crate::error::GenerationError;
use crate::pipeline::{
    extract_garment, generate_locked_scene, generate_scenes, SynthesisReport, ATTEMPT_COST,
};
use crate::prompts::PromptLibrary;
use crate::quota::{QuotaReservation, QuotaTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt_id: String,
    pub state: OrchestratorState,
    /// Quota records this attempt added, pre-charges included.
    pub calls_charged: usize,
}

impl AttemptReport {
    pub fn is_queued(&self) -> bool {
        self.state.is_queued()
    }

    pub fn outcome(&self) -> Option<&GenerationOutcome> {
        self.state.outcome()
    }
}

/// Runs one generation attempt end to end: quota gate, extraction,
/// synthesis fan-out, aggregation.
///
/// State transitions are `Idle -> Running -> {Succeeded | Failed | Queued}`.
/// Quota-shaped provider failures park the attempt as `Queued` and charge a
/// full attempt against the local window on top of the calls already made.
pub struct Orchestrator {
    client: ImageClient,
    prompts: Arc<PromptLibrary>,
    quota: Arc<QuotaTracker>,
    clock: Arc<dyn Clock>,
    events: Option<EventWriter>,
    state: Mutex<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(
        client: ImageClient,
        prompts: Arc<PromptLibrary>,
        quota: Arc<QuotaTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            prompts,
            quota,
            clock,
            events: None,
            state: Mutex::new(OrchestratorState::Idle),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.lock_state().clone()
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn events(&self) -> Option<&EventWriter> {
        self.events.as_ref()
    }

    pub fn has_capacity_for_attempt(&self) -> bool {
        self.quota.has_capacity(self.clock.now_ms(), ATTEMPT_COST)
    }

    pub fn generate(&self, request: &GenerationRequest) -> AttemptReport {
        self.generate_with_progress(request, &|_| {})
    }

    pub fn generate_with_progress(
        &self,
        request: &GenerationRequest,
        on_step: &(dyn Fn(AttemptStep) + Sync),
    ) -> AttemptReport {
        let attempt_id = Uuid::new_v4().to_string();
        self.emit(
            &attempt_id,
            "attempt_started",
            json!({
                "mode": request.mode.label(),
                "aspect_ratio": request.aspect_ratio.as_str(),
                "provider": self.client.provider_name(),
            }),
        );

        if let Err(err) = request.validate() {
            let err = GenerationError::from(err);
            return self.finish_failed(attempt_id, &err, 0);
        }

        let now_ms = self.clock.now_ms();
        let Some(mut reservation) = self.quota.reserve(now_ms, ATTEMPT_COST) else {
            let remaining = self.quota.available(now_ms);
            tracing::info!(
                attempt_id = %attempt_id,
                remaining,
                needed = ATTEMPT_COST,
                "quota window exhausted; attempt queued"
            );
            self.emit(
                &attempt_id,
                "attempt_queued",
                json!({
                    "reason": "local_quota",
                    "remaining": remaining,
                    "needed": ATTEMPT_COST,
                }),
            );
            self.set_state(OrchestratorState::Queued);
            return AttemptReport {
                attempt_id,
                state: OrchestratorState::Queued,
                calls_charged: 0,
            };
        };

        tracing::info!(
            attempt_id = %attempt_id,
            mode = request.mode.label(),
            "generation attempt started"
        );
        match self.run_stages(&attempt_id, request, &mut reservation, on_step) {
            Ok(outcome) => {
                tracing::info!(
                    attempt_id = %attempt_id,
                    images = outcome.images.len(),
                    partial_failure = outcome.partial_failure,
                    "generation attempt succeeded"
                );
                self.emit(
                    &attempt_id,
                    "attempt_succeeded",
                    json!({
                        "images": outcome.images.len(),
                        "consumed_call_count": outcome.consumed_call_count,
                        "partial_failure": outcome.partial_failure,
                    }),
                );
                let state = OrchestratorState::Succeeded(outcome);
                self.set_state(state.clone());
                AttemptReport {
                    attempt_id,
                    state,
                    calls_charged: reservation.recorded(),
                }
            }
            Err(err) if err.is_quota_exceeded() => {
                reservation.record_many(self.clock.now_ms(), ATTEMPT_COST);
                tracing::warn!(
                    attempt_id = %attempt_id,
                    error = %err,
                    "provider refused on quota; attempt queued"
                );
                self.emit(
                    &attempt_id,
                    "attempt_queued",
                    json!({
                        "reason": "provider_quota",
                        "error": err.to_string(),
                        "pre_charged": ATTEMPT_COST,
                    }),
                );
                self.set_state(OrchestratorState::Queued);
                AttemptReport {
                    attempt_id,
                    state: OrchestratorState::Queued,
                    calls_charged: reservation.recorded(),
                }
            }
            Err(err) => {
                let charged = reservation.recorded();
                self.finish_failed(attempt_id, &err, charged)
            }
        }
    }

    fn run_stages(
        &self,
        attempt_id: &str,
        request: &GenerationRequest,
        reservation: &mut QuotaReservation<'_>,
        on_step: &(dyn Fn(AttemptStep) + Sync),
    ) -> Result<GenerationOutcome, GenerationError> {
        self.enter_step(attempt_id, "extraction", None, 1, on_step);
        let extracted = extract_garment(&self.client, &self.prompts, &request.garment_image);
        if !matches!(extracted, Err(GenerationError::Prompt(_))) {
            reservation.record(self.clock.now_ms());
        }
        let extracted = extracted.inspect_err(|err| {
            self.emit_call_failed(attempt_id, "extraction", None, err);
        })?;

        let progress = |index: usize| {
            self.enter_step(attempt_id, "synthesis", Some(index), index + 2, on_step);
        };
        let report = match &request.mode {
            GenerationMode::Scene(scene) => generate_scenes(
                &self.client,
                &self.prompts,
                &extracted,
                scene,
                request.aspect_ratio,
                request.normalized_color_hint(),
                &progress,
            ),
            GenerationMode::LockedScene(locked) => generate_locked_scene(
                &self.client,
                &self.prompts,
                &extracted,
                &locked.template_image,
                request.aspect_ratio,
                &progress,
            ),
        }?;
        reservation.record_many(self.clock.now_ms(), report.attempted());
        self.emit_shot_failures(attempt_id, &report);

        let synthesized = report.aggregate()?;
        Ok(GenerationOutcome {
            images: synthesized.images,
            consumed_call_count: reservation.recorded(),
            partial_failure: synthesized.partial_failure,
        })
    }

    fn enter_step(
        &self,
        attempt_id: &str,
        stage: &str,
        shot: Option<usize>,
        step: usize,
        on_step: &(dyn Fn(AttemptStep) + Sync),
    ) {
        let step = AttemptStep {
            step,
            total_steps: ATTEMPT_COST,
        };
        self.set_state(OrchestratorState::Running(step));
        self.emit(
            attempt_id,
            "call_dispatched",
            json!({
                "stage": stage,
                "shot": shot,
                "step": step.step,
                "total_steps": step.total_steps,
            }),
        );
        on_step(step);
    }

    fn emit_shot_failures(&self, attempt_id: &str, report: &SynthesisReport) {
        for (index, shot) in report.shots.iter().enumerate() {
            if let Err(err) = shot {
                self.emit_call_failed(attempt_id, "synthesis", Some(index), err);
            }
        }
    }

    fn emit_call_failed(
        &self,
        attempt_id: &str,
        stage: &str,
        shot: Option<usize>,
        err: &GenerationError,
    ) {
        self.emit(
            attempt_id,
            "call_failed",
            json!({
                "stage": stage,
                "shot": shot,
                "kind": err.kind().as_str(),
                "error": err.to_string(),
            }),
        );
    }

    fn finish_failed(
        &self,
        attempt_id: String,
        err: &GenerationError,
        calls_charged: usize,
    ) -> AttemptReport {
        let failure = err.to_failure();
        tracing::warn!(
            attempt_id = %attempt_id,
            kind = failure.kind.as_str(),
            error = %failure.message,
            "generation attempt failed"
        );
        self.emit(
            &attempt_id,
            "attempt_failed",
            json!({
                "kind": failure.kind.as_str(),
                "root_kind": err.root().kind().as_str(),
                "error": failure.message,
            }),
        );
        let state = OrchestratorState::Failed(failure);
        self.set_state(state.clone());
        AttemptReport {
            attempt_id,
            state,
            calls_charged,
        }
    }

    fn emit(&self, attempt_id: &str, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let mut payload = match payload {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        payload.insert(
            "attempt_id".to_string(),
            Value::String(attempt_id.to_string()),
        );
        if let Err(err) = events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "event log write failed");
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
