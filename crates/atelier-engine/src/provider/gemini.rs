use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use super::{CallConfig, ImageProvider, PromptPart};
use crate::config::EngineConfig;
use crate::error::ProviderError;

const PROVIDER: &str = "Gemini";
const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiProvider {
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())?;
        Some(Self::new(
            config.api_base.clone(),
            api_key,
            config.image_model.clone(),
            Duration::from_secs_f64(config.request_timeout_s),
        ))
    }

    pub fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn build_payload(parts: &[PromptPart], config: &CallConfig) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": parts.iter().map(PromptPart::to_json).collect::<Vec<Value>>(),
            })]),
        );

        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            Value::Array(vec![Value::String("IMAGE".to_string())]),
        );
        if let Some(aspect_ratio) = config.aspect_ratio {
            generation_config.insert(
                "imageConfig".to_string(),
                json!({ "aspectRatio": aspect_ratio.as_str() }),
            );
        }
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
        Value::Object(payload)
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn invoke(&self, parts: &[PromptPart], config: &CallConfig) -> Result<Value, ProviderError> {
        let endpoint = self.endpoint();
        let payload = Self::build_payload(parts, config);
        tracing::debug!(
            endpoint = %endpoint,
            parts = parts.len(),
            aspect_ratio = config.aspect_ratio.map(|ratio| ratio.as_str()),
            "dispatching Gemini generateContent"
        );

        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(transport_error)?;
        response_json_or_error(response)
    }
}

/// Failure text surfaced to users and event logs; the request URL stays out.
fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        provider: PROVIDER.to_string(),
        message: err.without_url().to_string(),
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response.text().map_err(|err| ProviderError::Transport {
        provider: PROVIDER.to_string(),
        message: format!("response body read failed: {}", err.without_url()),
    })?;
    if !status.is_success() {
        return Err(ProviderError::Http {
            provider: PROVIDER.to_string(),
            status: status.as_u16(),
            body: error_body_message(&body),
        });
    }
    serde_json::from_str(&body).map_err(|err| ProviderError::Decode {
        provider: PROVIDER.to_string(),
        message: err.to_string(),
    })
}

/// Pulls `error.status` / `error.message` out of a Google API error body,
/// falling back to the truncated raw text.
pub(crate) fn error_body_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .and_then(Value::as_object);
    if let Some(error) = error {
        let status = error.get("status").and_then(Value::as_str).unwrap_or("");
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        let joined = [status, message]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<&str>>()
            .join(": ");
        if !joined.is_empty() {
            return truncate_text(&joined, 512);
        }
    }
    truncate_text(body.trim(), 512)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
