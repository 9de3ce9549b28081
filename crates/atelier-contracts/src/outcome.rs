use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::ImageBlob;

/// Result of one successful orchestration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Successful images in dispatch order.
    pub images: Vec<ImageBlob>,
    pub consumed_call_count: usize,
    pub partial_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SafetyBlocked,
    UnexpectedTextResponse,
    EmptyOrInvalidResponse,
    ProviderQuotaExceeded,
    NetworkOrTransport,
    AllAttemptsFailed,
    InvalidRequest,
    Prompt,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SafetyBlocked => "safety_blocked",
            Self::UnexpectedTextResponse => "unexpected_text_response",
            Self::EmptyOrInvalidResponse => "empty_or_invalid_response",
            Self::ProviderQuotaExceeded => "provider_quota_exceeded",
            Self::NetworkOrTransport => "network_or_transport",
            Self::AllAttemptsFailed => "all_attempts_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Prompt => "prompt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Which provider call an attempt is working on. Step 1 is extraction;
/// steps 2.. are synthesis shots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStep {
    pub step: usize,
    pub total_steps: usize,
}

impl fmt::Display for AttemptStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.step, self.total_steps)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    Running(AttemptStep),
    Queued,
    Failed(Failure),
    Succeeded(GenerationOutcome),
}

impl OrchestratorState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Queued => "queued",
            Self::Failed(_) => "failed",
            Self::Succeeded(_) => "succeeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Succeeded(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }

    pub fn outcome(&self) -> Option<&GenerationOutcome> {
        match self {
            Self::Succeeded(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_accessors_match_variant() {
        let failed = OrchestratorState::Failed(Failure {
            kind: FailureKind::SafetyBlocked,
            message: "blocked".to_string(),
        });
        assert_eq!(failed.label(), "failed");
        assert!(failed.is_terminal());
        assert_eq!(failed.failure().map(ToString::to_string), Some("blocked".to_string()));
        assert!(failed.outcome().is_none());

        let running = OrchestratorState::Running(AttemptStep {
            step: 2,
            total_steps: 5,
        });
        assert!(!running.is_terminal());
        assert_eq!(running.label(), "running");
        assert!(OrchestratorState::Queued.is_queued());
        assert_eq!(OrchestratorState::default(), OrchestratorState::Idle);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let raw = serde_json::to_string(&FailureKind::AllAttemptsFailed).unwrap_or_default();
        assert_eq!(raw, format!("\"{}\"", FailureKind::AllAttemptsFailed.as_str()));
    }
}
