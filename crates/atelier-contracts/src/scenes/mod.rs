mod catalog;
mod selector;

pub use catalog::{SceneCatalog, ScenePreset, MULTI_COLOR_SCENE_NAME};
pub use selector::{SceneSelection, SceneSelector};
