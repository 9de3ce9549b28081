use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const PNG_MIME: &str = "image/png";

/// Opaque image bytes tagged with a mime type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageBlob {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, PNG_MIME)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBlob")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "4:3")]
    Classic,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Portrait,
        AspectRatio::Square,
        AspectRatio::Landscape,
        AspectRatio::Classic,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Portrait => "9:16",
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Classic => "4:3",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim();
        Self::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == normalized)
            .ok_or_else(|| {
                format!("Unsupported aspect ratio '{raw}'. Expected one of: 9:16, 1:1, 16:9, 4:3")
            })
    }
}

/// Free scene selection: prompts vary the camera angle over one description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneMode {
    pub prompt_template: String,
    pub scene_name: String,
}

/// A template photo whose pose, lighting and composition stay fixed while the
/// garment is swapped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedSceneMode {
    pub template_image: ImageBlob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationMode {
    Scene(SceneMode),
    LockedScene(LockedSceneMode),
}

impl GenerationMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scene(_) => "scene",
            Self::LockedScene(_) => "locked_scene",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub garment_image: ImageBlob,
    pub mode: GenerationMode,
    pub aspect_ratio: AspectRatio,
    pub color_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("garment image is empty")]
    EmptyGarment,
    #[error("scene '{0}' has an empty prompt")]
    EmptyScenePrompt(String),
    #[error("locked scene template image is empty")]
    EmptyTemplate,
}

impl GenerationRequest {
    pub fn scene(
        garment_image: ImageBlob,
        scene: SceneMode,
        aspect_ratio: AspectRatio,
        color_hint: Option<String>,
    ) -> Self {
        Self {
            garment_image,
            mode: GenerationMode::Scene(scene),
            aspect_ratio,
            color_hint,
        }
    }

    /// A locked template replaces free scene selection, so no color hint is
    /// carried.
    pub fn locked_scene(
        garment_image: ImageBlob,
        template_image: ImageBlob,
        aspect_ratio: AspectRatio,
    ) -> Self {
        Self {
            garment_image,
            mode: GenerationMode::LockedScene(LockedSceneMode { template_image }),
            aspect_ratio,
            color_hint: None,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.garment_image.is_empty() {
            return Err(RequestError::EmptyGarment);
        }
        match &self.mode {
            GenerationMode::Scene(scene) if scene.prompt_template.trim().is_empty() => Err(
                RequestError::EmptyScenePrompt(scene.scene_name.clone()),
            ),
            GenerationMode::LockedScene(locked) if locked.template_image.is_empty() => {
                Err(RequestError::EmptyTemplate)
            }
            _ => Ok(()),
        }
    }

    /// Color hint with surrounding whitespace removed; blank hints are `None`.
    pub fn normalized_color_hint(&self) -> Option<&str> {
        self.color_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn garment() -> ImageBlob {
        ImageBlob::new(vec![1, 2, 3], "image/jpeg")
    }

    #[test]
    fn aspect_ratio_round_trips_wire_form() {
        for ratio in AspectRatio::ALL {
            assert_eq!(ratio.as_str().parse::<AspectRatio>(), Ok(ratio));
        }
        assert!("3:2".parse::<AspectRatio>().is_err());
        assert_eq!(
            serde_json::to_string(&AspectRatio::Landscape).unwrap_or_default(),
            "\"16:9\""
        );
    }

    #[test]
    fn validate_rejects_empty_inputs() {
        let empty = GenerationRequest::scene(
            ImageBlob::png(Vec::new()),
            SceneMode {
                prompt_template: "beach".to_string(),
                scene_name: "Beach".to_string(),
            },
            AspectRatio::default(),
            None,
        );
        assert_eq!(empty.validate(), Err(RequestError::EmptyGarment));

        let blank_scene = GenerationRequest::scene(
            garment(),
            SceneMode {
                prompt_template: "   ".to_string(),
                scene_name: "Beach".to_string(),
            },
            AspectRatio::default(),
            None,
        );
        assert_eq!(
            blank_scene.validate(),
            Err(RequestError::EmptyScenePrompt("Beach".to_string()))
        );

        let locked = GenerationRequest::locked_scene(
            garment(),
            ImageBlob::png(Vec::new()),
            AspectRatio::Square,
        );
        assert_eq!(locked.validate(), Err(RequestError::EmptyTemplate));
    }

    #[test]
    fn locked_scene_drops_color_hint() {
        let request =
            GenerationRequest::locked_scene(garment(), ImageBlob::png(vec![9]), AspectRatio::Square);
        assert!(request.validate().is_ok());
        assert_eq!(request.normalized_color_hint(), None);
        assert_eq!(request.mode.label(), "locked_scene");
    }

    #[test]
    fn blank_color_hint_is_none() {
        let mut request = GenerationRequest::scene(
            garment(),
            SceneMode {
                prompt_template: "beach".to_string(),
                scene_name: "Beach".to_string(),
            },
            AspectRatio::default(),
            Some("  ".to_string()),
        );
        assert_eq!(request.normalized_color_hint(), None);
        request.color_hint = Some(" red, navy ".to_string());
        assert_eq!(request.normalized_color_hint(), Some("red, navy"));
    }
}
