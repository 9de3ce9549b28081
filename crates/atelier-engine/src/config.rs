use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use atelier_contracts::quota::QuotaWindow;

use crate::error::ConfigError;
use crate::pipeline::ATTEMPT_COST;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderKind {
    #[default]
    Gemini,
    Dryrun,
}

impl ProviderKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Dryrun => "dryrun",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "dryrun" | "dry-run" => Ok(Self::Dryrun),
            _ => Err(ConfigError::UnknownProvider(raw.to_string())),
        }
    }
}

/// Process-start configuration. Built once, validated once; a Gemini setup
/// without a credential never gets past [`EngineConfig::validated`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_model: String,
    pub quota: QuotaWindow,
    pub request_timeout_s: f64,
    pub prompts_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            api_key: None,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            quota: QuotaWindow::default(),
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
            prompts_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(non_empty_env)?.validated()
    }

    /// Parses every setting without enforcing the credential, so callers can
    /// layer overrides before validating.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("ATELIER_PROVIDER") {
            config.provider = raw.parse()?;
        }
        config.api_key = lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY"));
        if let Some(base) = lookup("GEMINI_API_BASE") {
            let trimmed = base.trim().trim_end_matches('/').to_string();
            if !trimmed.is_empty() {
                config.api_base = trimmed;
            }
        }
        if let Some(model) = lookup("ATELIER_IMAGE_MODEL") {
            config.image_model = model;
        }

        let limit = match lookup("ATELIER_RPM_LIMIT") {
            Some(raw) => parse_number::<usize>("ATELIER_RPM_LIMIT", &raw)?,
            None => QuotaWindow::DEFAULT_LIMIT,
        };
        let window_ms = match lookup("ATELIER_WINDOW_MS") {
            Some(raw) => parse_number::<u64>("ATELIER_WINDOW_MS", &raw)?,
            None => QuotaWindow::DEFAULT_WINDOW_MS,
        };
        config.quota = quota_window(limit, window_ms)?;

        if let Some(raw) = lookup("ATELIER_REQUEST_TIMEOUT_S") {
            let timeout = parse_number::<f64>("ATELIER_REQUEST_TIMEOUT_S", &raw)?;
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(ConfigError::InvalidValue {
                    key: "ATELIER_REQUEST_TIMEOUT_S",
                    value: raw,
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
            config.request_timeout_s = timeout;
        }
        config.prompts_path = lookup("ATELIER_PROMPTS_PATH").map(PathBuf::from);
        Ok(config)
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.provider == ProviderKind::Gemini
            && self
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .is_none()
        {
            return Err(ConfigError::MissingApiKey);
        }
        ensure_attempt_fits(&self.quota)?;
        Ok(self)
    }
}

pub fn quota_window(limit: usize, window_ms: u64) -> Result<QuotaWindow, ConfigError> {
    let window = QuotaWindow::new(limit, window_ms).map_err(|err| ConfigError::InvalidValue {
        key: "quota",
        value: format!("{limit}/{window_ms}ms"),
        reason: err.to_string(),
    })?;
    ensure_attempt_fits(&window)?;
    Ok(window)
}

/// A window smaller than one full attempt would park every request forever.
pub fn ensure_attempt_fits(window: &QuotaWindow) -> Result<(), ConfigError> {
    if window.limit() < ATTEMPT_COST {
        return Err(ConfigError::InvalidValue {
            key: "ATELIER_RPM_LIMIT",
            value: window.limit().to_string(),
            reason: format!("must allow at least {ATTEMPT_COST} calls per window"),
        });
    }
    Ok(())
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: "not a number".to_string(),
    })
}

/// Environment lookup that treats blank values as unset.
pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
