use super::catalog::{SceneCatalog, ScenePreset};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneSelection {
    pub scene: ScenePreset,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SceneSelector {
    pub catalog: SceneCatalog,
}

impl SceneSelector {
    pub fn new(catalog: Option<SceneCatalog>) -> Self {
        Self {
            catalog: catalog.unwrap_or_default(),
        }
    }

    /// Resolves a requested scene name, falling back to the first catalog
    /// entry. `prompt_override` replaces the preset's description while
    /// keeping its name, so the multi-color slot rules still apply.
    pub fn select(
        &self,
        requested: Option<&str>,
        prompt_override: Option<&str>,
    ) -> Result<SceneSelection, String> {
        let (scene, requested_text, fallback_reason) = match requested {
            Some(requested_value) => match self.catalog.find(requested_value) {
                Some(scene) => (scene.clone(), Some(requested_value.to_string()), None),
                None => {
                    let Some(first) = self.catalog.first() else {
                        return Err("Scene catalog is empty.".to_string());
                    };
                    (
                        first.clone(),
                        Some(requested_value.to_string()),
                        Some(format!(
                            "Requested scene '{requested_value}' not found; using '{}'.",
                            first.name
                        )),
                    )
                }
            },
            None => {
                let Some(first) = self.catalog.first() else {
                    return Err("Scene catalog is empty.".to_string());
                };
                (
                    first.clone(),
                    None,
                    Some("No scene specified; using default.".to_string()),
                )
            }
        };

        let scene = match prompt_override.map(str::trim).filter(|value| !value.is_empty()) {
            Some(prompt) => ScenePreset {
                name: scene.name,
                prompt: prompt.to_string(),
            },
            None => scene,
        };

        Ok(SceneSelection {
            scene,
            requested: requested_text,
            fallback_reason,
        })
    }
}
