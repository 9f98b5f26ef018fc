//! JSON state files.
//!
//! A state file describes a whole session: the global box, the dataset
//! catalog, cameras, visualizations (naming datasets by their catalog
//! names), and renderer parameters. [`StateFile::apply`] resolves the
//! names into keys and commits everything to the peer group in
//! dependency order.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::camera::Camera;
use crate::datasets::{DataKind, Datasets};
use crate::engine::Engine;
use crate::errors::{NebulaError, Result};
use crate::geometry::Box3;
use crate::lighting::Lighting;
use crate::partition::PartitionMeta;
use crate::registry::Key;
use crate::renderer::RendererConfig;
use crate::vis::{Vis, VisParams, Visualization};

/// Partitioning section: the global box; the rank count comes from the
/// running group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitioningState {
    pub global_box: Box3,
}

/// One dataset catalog entry in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub kind: DataKind,
}

/// One vis element in the file; the dataset is named, not keyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisEntry {
    pub dataset: String,
    pub params: VisParams,
}

/// One visualization in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationEntry {
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub lighting: Lighting,
    pub elements: Vec<VisEntry>,
}

/// The whole session description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub partitioning: PartitioningState,
    #[serde(default)]
    pub renderer: RendererConfig,
    pub cameras: Vec<Camera>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    pub visualizations: Vec<VisualizationEntry>,
}

/// Keys of everything a state file committed.
#[derive(Debug, Clone)]
pub struct CommittedState {
    pub partition_key: Key,
    pub renderer_key: Key,
    pub datasets_key: Key,
    pub camera_keys: Vec<Key>,
    pub visualization_keys: Vec<Key>,
}

impl StateFile {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Commit the session to the group through the driver engine.
    /// Returns the keys for building renderings.
    pub fn apply(&self, engine: &Engine) -> Result<CommittedState> {
        let partition_key = engine.commit_partition(PartitionMeta {
            global_box: self.partitioning.global_box,
            n_partitions: engine.size(),
        })?;

        let renderer_key = engine.commit_renderer(self.renderer)?;

        // Catalog first, so visualizations can resolve names to keys
        let mut catalog = Datasets::new();
        for entry in &self.datasets {
            let key = engine.registry().allocate_key();
            catalog.insert(entry.name.clone(), key, entry.kind);
        }
        let datasets_key = engine.commit_datasets(catalog.clone())?;

        let camera_keys = self
            .cameras
            .iter()
            .map(|c| engine.commit_camera(c.clone()))
            .collect::<Result<Vec<_>>>()?;

        let visualization_keys = self
            .visualizations
            .iter()
            .map(|v| {
                let elements = v
                    .elements
                    .iter()
                    .map(|e| {
                        let dataset = catalog.find(&e.dataset).ok_or_else(|| {
                            NebulaError::Config(format!(
                                "visualization references unknown dataset '{}'",
                                e.dataset
                            ))
                        })?;
                        Ok(Vis {
                            dataset_key: dataset.key,
                            params: e.params.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                engine.commit_visualization(Visualization {
                    annotation: v.annotation.clone(),
                    elements,
                    lighting: v.lighting.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CommittedState {
            partition_key,
            renderer_key,
            datasets_key,
            camera_keys,
            visualization_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "partitioning": { "global_box": { "min": [-1, -1, -1], "max": [1, 1, 1] } },
        "cameras": [
            {
                "eye": [0, 0, 3],
                "view_dir": [0, 0, -1],
                "view_up": [0, 1, 0],
                "aov": 0.0,
                "width": 64,
                "height": 64,
                "annotation": ""
            }
        ],
        "datasets": [ { "name": "density", "kind": "Volume" } ],
        "visualizations": [
            {
                "annotation": "_d",
                "elements": [
                    {
                        "dataset": "density",
                        "params": {
                            "Volume": {
                                "colormap": [ { "value": 0.0, "color": [0, 0, 0] } ],
                                "opacitymap": [ { "value": 0.0, "opacity": 0.5 } ],
                                "volume_rendering": true,
                                "isovalues": [],
                                "slices": []
                            }
                        }
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_a_full_session() {
        let state = StateFile::from_json(SAMPLE).unwrap();
        assert_eq!(state.cameras.len(), 1);
        assert_eq!(state.cameras[0].width, 64);
        assert_eq!(state.visualizations[0].elements[0].dataset, "density");
        // Omitted sections fall back to defaults
        assert_eq!(state.renderer, RendererConfig::default());
        assert!(!state.visualizations[0].lighting.shadows);
    }

    #[test]
    fn unknown_dataset_reference_is_a_config_error() {
        let mut state = StateFile::from_json(SAMPLE).unwrap();
        state.visualizations[0].elements[0].dataset = "missing".into();
        let engines = Engine::create_group(1, 1);
        let engine = engines.into_iter().next().unwrap();
        let err = state.apply(&engine).unwrap_err();
        assert!(matches!(err, NebulaError::Config(_)));
        engine.shutdown();
    }

    #[test]
    fn bad_json_is_rejected() {
        assert!(StateFile::from_json("{ not json").is_err());
    }
}
