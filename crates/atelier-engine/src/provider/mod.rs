use std::collections::BTreeMap;
use std::sync::Arc;

use atelier_contracts::request::{AspectRatio, ImageBlob};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::config::{EngineConfig, ProviderKind};
use crate::error::{ConfigError, ProviderError};

mod dryrun;
mod gemini;

pub use dryrun::DryrunProvider;
pub use gemini::GeminiProvider;

/// One ordered segment of a provider prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPart {
    Text(String),
    Image(ImageBlob),
}

impl PromptPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "text": text }),
            Self::Image(image) => json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallConfig {
    pub aspect_ratio: Option<AspectRatio>,
}

impl CallConfig {
    pub fn with_aspect_ratio(aspect_ratio: AspectRatio) -> Self {
        Self {
            aspect_ratio: Some(aspect_ratio),
        }
    }
}

/// The external image-generation call. Implementations return the raw
/// provider payload; interpreting it is [`crate::client::ImageClient`]'s job.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self, parts: &[PromptPart], config: &CallConfig) -> Result<Value, ProviderError>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Registry holding every provider the configuration can serve. Gemini is
/// only present when a credential was supplied.
pub fn default_provider_registry(config: &EngineConfig) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider);
    if let Some(provider) = GeminiProvider::from_config(config) {
        providers.register(provider);
    }
    providers
}

pub fn provider_for(config: &EngineConfig) -> Result<Arc<dyn ImageProvider>, ConfigError> {
    let registry = default_provider_registry(config);
    match registry.get(config.provider.as_str()) {
        Some(provider) => Ok(provider),
        None if config.provider == ProviderKind::Gemini => Err(ConfigError::MissingApiKey),
        None => Err(ConfigError::UnknownProvider(
            config.provider.as_str().to_string(),
        )),
    }
}
