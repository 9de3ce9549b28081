//! Prompt templates with named `{slot}` placeholders.
//!
//! Templates are configuration, not code: the built-in set is compiled in
//! from `resources/default_prompts.json` and a JSON file with the same shape
//! can replace it at startup.

use std::fs;
use std::path::Path;

use atelier_contracts::request::{AspectRatio, SceneMode};
use atelier_contracts::scenes::MULTI_COLOR_SCENE_NAME;
use serde::Deserialize;

use crate::error::GenerationError;

const DEFAULT_PROMPTS_JSON: &str = include_str!("../resources/default_prompts.json");

pub const SHOTS_PER_ATTEMPT: usize = 4;
pub const COLOR_SLOT: &str = "color";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("template '{template}' has no value for slot {{{slot}}}")]
    MissingSlotValue { template: &'static str, slot: String },
    #[error("template '{template}' must contain slot {{{slot}}}")]
    MissingSlot {
        template: &'static str,
        slot: &'static str,
    },
    #[error("template '{template}' has unsupported slot {{{slot}}}")]
    UnexpectedSlot { template: &'static str, slot: String },
    #[error("expected {expected} camera shots, found {found}")]
    CameraShotCount { expected: usize, found: usize },
    #[error("prompt library unreadable: {0}")]
    Load(String),
}

impl From<PromptError> for GenerationError {
    fn from(err: PromptError) -> Self {
        GenerationError::Prompt(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: &'static str,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(name: &'static str, source: &str) -> Self {
        Self {
            name,
            segments: parse_segments(source),
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(slot) => Some(slot.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots().any(|name| name == slot)
    }

    /// Fills one slot and leaves every other placeholder as written.
    pub fn fill(&self, slot: &str, value: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) if name == slot => out.push_str(value),
                Segment::Slot(name) => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
        }
        out
    }

    /// Fills every slot; values are inserted verbatim and never re-scanned.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String, PromptError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) => {
                    let value = values
                        .iter()
                        .find(|(slot, _)| *slot == name.as_str())
                        .map(|(_, value)| *value)
                        .ok_or_else(|| PromptError::MissingSlotValue {
                            template: self.name,
                            slot: name.clone(),
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    fn require_slots(&self, slots: &[&'static str]) -> Result<(), PromptError> {
        for slot in slots {
            if !self.has_slot(slot) {
                return Err(PromptError::MissingSlot {
                    template: self.name,
                    slot: *slot,
                });
            }
        }
        Ok(())
    }

    fn allow_only_slots(&self, allowed: &[&str]) -> Result<(), PromptError> {
        match self.slots().find(|slot| !allowed.contains(slot)) {
            Some(slot) => Err(PromptError::UnexpectedSlot {
                template: self.name,
                slot: slot.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn parse_segments(source: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = source;
    while let Some(open) = rest.find('{') {
        literal.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_slot_name(&after[..close]) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Slot(after[..close].to_string()));
                rest = &after[close + 1..];
            }
            _ => {
                literal.push('{');
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn is_slot_name(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_lowercase())
        && chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComplexityRule {
    pub keywords: Vec<String>,
    pub length_threshold: usize,
}

impl Default for ComplexityRule {
    fn default() -> Self {
        Self {
            keywords: vec!["person".to_string(), "model".to_string()],
            length_threshold: 200,
        }
    }
}

impl ComplexityRule {
    /// Descriptions that stage people, or run long, describe the whole
    /// scene rather than just a backdrop.
    pub fn is_complex(&self, description: &str) -> bool {
        let lowered = description.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
            || description.chars().count() > self.length_threshold
    }
}

#[derive(Debug, Deserialize)]
struct PromptLibraryFile {
    extraction: String,
    camera_shots: Vec<String>,
    whole_scene: String,
    background_only: String,
    locked_scene: String,
    color_instruction: String,
    default_palette: String,
    #[serde(default)]
    complexity: ComplexityRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptLibrary {
    extraction: PromptTemplate,
    camera_shots: Vec<String>,
    whole_scene: PromptTemplate,
    background_only: PromptTemplate,
    locked_scene: PromptTemplate,
    color_instruction: PromptTemplate,
    default_palette: String,
    complexity: ComplexityRule,
}

impl PromptLibrary {
    pub fn builtin() -> Result<Self, PromptError> {
        Self::from_json(DEFAULT_PROMPTS_JSON)
    }

    /// Built-in library, or the file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, PromptError> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|err| PromptError::Load(format!("{}: {err}", path.display())))?;
                Self::from_json(&raw)
            }
            None => Self::builtin(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, PromptError> {
        let file: PromptLibraryFile =
            serde_json::from_str(raw).map_err(|err| PromptError::Load(err.to_string()))?;
        if file.camera_shots.len() != SHOTS_PER_ATTEMPT {
            return Err(PromptError::CameraShotCount {
                expected: SHOTS_PER_ATTEMPT,
                found: file.camera_shots.len(),
            });
        }

        let library = Self {
            extraction: PromptTemplate::parse("extraction", &file.extraction),
            camera_shots: file.camera_shots,
            whole_scene: PromptTemplate::parse("whole_scene", &file.whole_scene),
            background_only: PromptTemplate::parse("background_only", &file.background_only),
            locked_scene: PromptTemplate::parse("locked_scene", &file.locked_scene),
            color_instruction: PromptTemplate::parse("color_instruction", &file.color_instruction),
            default_palette: file.default_palette,
            complexity: file.complexity,
        };
        library
            .whole_scene
            .require_slots(&["scene", "camera_shot"])?;
        library
            .background_only
            .require_slots(&["scene", "camera_shot"])?;
        library.color_instruction.require_slots(&["colors"])?;
        library.extraction.allow_only_slots(&[])?;
        library.locked_scene.allow_only_slots(&["aspect_ratio"])?;
        Ok(library)
    }

    pub fn camera_shots(&self) -> &[String] {
        &self.camera_shots
    }

    pub fn complexity(&self) -> &ComplexityRule {
        &self.complexity
    }

    pub fn extraction_prompt(&self) -> Result<String, PromptError> {
        self.extraction.render(&[])
    }

    pub fn locked_scene_prompt(&self, aspect_ratio: AspectRatio) -> Result<String, PromptError> {
        self.locked_scene
            .render(&[("aspect_ratio", aspect_ratio.as_str())])
    }

    /// Scene description with the `{color}` slot resolved.
    ///
    /// A color hint only applies to the multi-color scene. When that scene's
    /// template lacks the slot the hint is dropped with a warning and the
    /// description is returned unchanged.
    pub fn scene_description(&self, scene: &SceneMode, color_hint: Option<&str>) -> String {
        let template = PromptTemplate::parse("scene", &scene.prompt_template);
        let has_slot = template.has_slot(COLOR_SLOT);
        let hint = color_hint.map(str::trim).filter(|hint| !hint.is_empty());

        let mut fill = None;
        if let Some(hint) = hint {
            if scene.scene_name != MULTI_COLOR_SCENE_NAME {
                tracing::debug!(scene = %scene.scene_name, "color hint ignored outside the multi-color scene");
            } else if !has_slot {
                tracing::warn!(
                    scene = %scene.scene_name,
                    "color hint dropped: scene template has no {{color}} slot"
                );
            } else {
                fill = Some(self.color_instruction.fill("colors", hint));
            }
        }

        if !has_slot {
            return scene.prompt_template.clone();
        }
        let value = fill.unwrap_or_else(|| self.default_palette.clone());
        template.fill(COLOR_SLOT, &value)
    }

    /// One prompt per camera shot, in shot order.
    pub fn scene_prompts(
        &self,
        scene: &SceneMode,
        aspect_ratio: AspectRatio,
        color_hint: Option<&str>,
    ) -> Result<Vec<String>, PromptError> {
        let description = self.scene_description(scene, color_hint);
        let template = if self.complexity.is_complex(&description) {
            &self.whole_scene
        } else {
            &self.background_only
        };
        self.camera_shots
            .iter()
            .map(|shot| {
                template.render(&[
                    ("scene", description.as_str()),
                    ("camera_shot", shot.as_str()),
                    ("aspect_ratio", aspect_ratio.as_str()),
                ])
            })
            .collect()
    }
}
