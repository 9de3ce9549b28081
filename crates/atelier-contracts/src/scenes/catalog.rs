use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::request::SceneMode;

const DEFAULT_SCENES_JSON: &str = include_str!("../../resources/default_scenes.json");

/// Scene whose `{color}` slot accepts a user color hint.
pub const MULTI_COLOR_SCENE_NAME: &str = "Multi-color collection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenePreset {
    pub name: String,
    pub prompt: String,
}

impl ScenePreset {
    pub fn is_multi_color(&self) -> bool {
        self.name == MULTI_COLOR_SCENE_NAME
    }

    pub fn to_mode(&self) -> SceneMode {
        SceneMode {
            prompt_template: self.prompt.clone(),
            scene_name: self.name.clone(),
        }
    }
}

/// Ordered scene presets keyed by display name.
#[derive(Debug, Clone)]
pub struct SceneCatalog {
    scenes: IndexMap<String, ScenePreset>,
}

impl SceneCatalog {
    pub fn new(scenes: Option<IndexMap<String, ScenePreset>>) -> Self {
        Self {
            scenes: scenes.unwrap_or_else(default_scenes),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let rows: Vec<ScenePreset> = serde_json::from_str(raw)?;
        let mut scenes = IndexMap::new();
        for row in rows {
            if row.name.trim().is_empty() {
                anyhow::bail!("scene preset with empty name");
            }
            scenes.insert(row.name.clone(), row);
        }
        Ok(Self { scenes })
    }

    pub fn get(&self, name: &str) -> Option<&ScenePreset> {
        self.scenes.get(name)
    }

    /// Case-insensitive lookup, for names typed on a command line.
    pub fn find(&self, name: &str) -> Option<&ScenePreset> {
        let needle = name.trim();
        self.get(needle).or_else(|| {
            self.scenes
                .values()
                .find(|scene| scene.name.eq_ignore_ascii_case(needle))
        })
    }

    pub fn first(&self) -> Option<&ScenePreset> {
        self.scenes.values().next()
    }

    pub fn list(&self) -> impl Iterator<Item = &ScenePreset> {
        self.scenes.values()
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

impl Default for SceneCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_scenes() -> IndexMap<String, ScenePreset> {
    SceneCatalog::from_json(DEFAULT_SCENES_JSON)
        .map(|catalog| catalog.scenes)
        .unwrap_or_default()
}
