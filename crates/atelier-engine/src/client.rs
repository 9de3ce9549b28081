use std::sync::Arc;

use atelier_contracts::request::{ImageBlob, PNG_MIME};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::GenerationError;
use crate::provider::{CallConfig, ImageProvider, PromptPart};

const SAFETY_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

/// One provider call, normalized into an image or a typed failure. Never
/// retries.
#[derive(Clone)]
pub struct ImageClient {
    provider: Arc<dyn ImageProvider>,
}

impl ImageClient {
    pub fn new(provider: Arc<dyn ImageProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn call(
        &self,
        parts: &[PromptPart],
        config: &CallConfig,
    ) -> Result<ImageBlob, GenerationError> {
        let raw = self.provider.invoke(parts, config)?;
        normalize_response(&raw)
    }
}

/// Rules, first match wins: inline image → success; safety block →
/// `SafetyBlocked`; text only → `UnexpectedTextResponse`; anything else →
/// `EmptyOrInvalidResponse`.
pub fn normalize_response(raw: &Value) -> Result<ImageBlob, GenerationError> {
    let candidates = raw
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut texts = Vec::new();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
            if let Some(inline) = inline {
                let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .map_err(|_| GenerationError::EmptyOrInvalidResponse)?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or(PNG_MIME);
                return Ok(ImageBlob::new(bytes, mime_type));
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    texts.push(trimmed.to_string());
                }
            }
        }
    }

    if let Some(reason) = safety_block_reason(raw) {
        return Err(GenerationError::SafetyBlocked { reason });
    }
    if !texts.is_empty() {
        return Err(GenerationError::UnexpectedTextResponse {
            text: texts.join(" "),
        });
    }
    Err(GenerationError::EmptyOrInvalidResponse)
}

fn safety_block_reason(raw: &Value) -> Option<String> {
    let prompt_block = raw
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty());
    if let Some(reason) = prompt_block {
        return Some(reason.to_string());
    }
    raw.get("candidates")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|candidate| candidate.get("finishReason").and_then(Value::as_str))
        .find(|reason| SAFETY_FINISH_REASONS.contains(reason))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ProviderError;

    fn inline(data: &str) -> Value {
        json!({"candidates": [{"content": {"parts": [
            {"text": "here you go"},
            {"inlineData": {"mimeType": "image/webp", "data": data}}
        ]}}]})
    }

    #[test]
    fn inline_image_wins_over_text_and_safety_flags() -> anyhow::Result<()> {
        let mut raw = inline("AQID");
        raw["candidates"][0]["finishReason"] = json!("SAFETY");
        let blob = normalize_response(&raw)?;
        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert_eq!(blob.mime_type, "image/webp");
        Ok(())
    }

    #[test]
    fn snake_case_inline_data_is_accepted() -> anyhow::Result<()> {
        let raw = json!({"candidates": [{"content": {"parts": [
            {"inline_data": {"data": "AQID"}}
        ]}}]});
        let blob = normalize_response(&raw)?;
        assert_eq!(blob.mime_type, "image/png");
        Ok(())
    }

    #[test]
    fn safety_finish_reason_is_safety_blocked() {
        let raw = json!({"candidates": [{"finishReason": "IMAGE_SAFETY"}]});
        let err = normalize_response(&raw).err();
        assert!(matches!(
            err,
            Some(GenerationError::SafetyBlocked { reason }) if reason == "IMAGE_SAFETY"
        ));
    }

    #[test]
    fn prompt_feedback_block_is_safety_blocked_even_with_text() {
        let raw = json!({
            "promptFeedback": {"blockReason": "PROHIBITED_CONTENT"},
            "candidates": [{"content": {"parts": [{"text": "I can't help with that."}]}}]
        });
        assert!(matches!(
            normalize_response(&raw),
            Err(GenerationError::SafetyBlocked { .. })
        ));
    }

    #[test]
    fn text_only_is_unexpected_text() {
        let raw = json!({"candidates": [{"finishReason": "STOP", "content": {"parts": [
            {"text": "Sure! "}, {"text": "Describe the outfit?"}
        ]}}]});
        let err = normalize_response(&raw).err();
        assert!(matches!(
            err,
            Some(GenerationError::UnexpectedTextResponse { text }) if text == "Sure! Describe the outfit?"
        ));
    }

    #[test]
    fn empty_shapes_are_empty_or_invalid() {
        for raw in [
            json!({}),
            json!({"candidates": []}),
            json!({"candidates": [{"content": {"parts": [{"text": "  "}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"inlineData": {"data": ""}}]}}]}),
            json!({"candidates": [{"finishReason": "MAX_TOKENS"}]}),
        ] {
            assert!(matches!(
                normalize_response(&raw),
                Err(GenerationError::EmptyOrInvalidResponse)
            ));
        }
    }

    #[test]
    fn undecodable_image_is_invalid() {
        assert!(matches!(
            normalize_response(&inline("!!not base64!!")),
            Err(GenerationError::EmptyOrInvalidResponse)
        ));
    }

    struct Refusing;

    impl ImageProvider for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn invoke(&self, _: &[PromptPart], _: &CallConfig) -> Result<Value, ProviderError> {
            Err(ProviderError::Http {
                provider: "Gemini".to_string(),
                status: 429,
                body: "RESOURCE_EXHAUSTED: Quota exceeded".to_string(),
            })
        }
    }

    #[test]
    fn client_maps_provider_errors() {
        let client = ImageClient::new(Arc::new(Refusing));
        assert_eq!(client.provider_name(), "refusing");
        let err = client.call(&[PromptPart::text("x")], &CallConfig::default()).err();
        assert!(matches!(err, Some(GenerationError::ProviderQuotaExceeded(_))));
    }
}
