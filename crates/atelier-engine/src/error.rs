use atelier_contracts::outcome::{Failure, FailureKind};
use atelier_contracts::request::RequestError;

/// Markers the provider uses when refusing a call for rate or quota reasons.
const QUOTA_MARKERS: [&str; 4] = ["quota", "超额", "rate limit", "resource_exhausted"];

pub fn is_quota_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Failures raised at the provider transport boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request failed ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} returned an unreadable payload: {message}")]
    Decode { provider: String, message: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("Image generation was blocked by the provider's safety policy ({reason}).")]
    SafetyBlocked { reason: String },
    #[error("Provider returned text instead of an image: {text}")]
    UnexpectedTextResponse { text: String },
    #[error("Provider returned an empty or invalid response.")]
    EmptyOrInvalidResponse,
    #[error("{0}")]
    ProviderQuotaExceeded(String),
    #[error("{0}")]
    NetworkOrTransport(String),
    /// Every call of a stage failed; displays the first underlying error.
    #[error("{first}")]
    AllAttemptsFailed {
        stage: &'static str,
        attempted: usize,
        first: Box<GenerationError>,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("Prompt template error: {0}")]
    Prompt(String),
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SafetyBlocked { .. } => FailureKind::SafetyBlocked,
            Self::UnexpectedTextResponse { .. } => FailureKind::UnexpectedTextResponse,
            Self::EmptyOrInvalidResponse => FailureKind::EmptyOrInvalidResponse,
            Self::ProviderQuotaExceeded(_) => FailureKind::ProviderQuotaExceeded,
            Self::NetworkOrTransport(_) => FailureKind::NetworkOrTransport,
            Self::AllAttemptsFailed { .. } => FailureKind::AllAttemptsFailed,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Prompt(_) => FailureKind::Prompt,
        }
    }

    /// True when the provider's own limiter refused the work, judged by kind
    /// or by message text.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Self::ProviderQuotaExceeded(_) => true,
            Self::AllAttemptsFailed { first, .. } => first.is_quota_exceeded(),
            Self::InvalidRequest(_) | Self::Prompt(_) => false,
            other => is_quota_message(&other.to_string()),
        }
    }

    /// Innermost error of an `AllAttemptsFailed` chain.
    pub fn root(&self) -> &GenerationError {
        match self {
            Self::AllAttemptsFailed { first, .. } => first.root(),
            other => other,
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<ProviderError> for GenerationError {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        let too_many_requests = matches!(err, ProviderError::Http { status: 429, .. });
        if too_many_requests || is_quota_message(&message) {
            return Self::ProviderQuotaExceeded(message);
        }
        match err {
            ProviderError::Http { .. } | ProviderError::Transport { .. } => {
                Self::NetworkOrTransport(message)
            }
            ProviderError::Decode { .. } => Self::EmptyOrInvalidResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "Missing provider credential: set GEMINI_API_KEY (or GOOGLE_API_KEY) before starting, or use the dryrun provider."
    )]
    MissingApiKey,
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Unknown provider '{0}'. Available providers: dryrun, gemini")]
    UnknownProvider(String),
}
