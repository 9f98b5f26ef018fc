//! Visualizations: what to draw and how to map data onto color.
//!
//! A [`Visualization`] is an ordered list of [`Vis`] elements plus a
//! lighting record, replicated to every rank. Each element names a
//! dataset by key and carries the type-specific mapping parameters
//! (transfer functions, radius mapping, isovalues, slice planes).

use serde::{Deserialize, Serialize};

use crate::lighting::Lighting;
use crate::registry::Key;

/// A control point of the color transfer function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorControl {
    pub value: f32,
    pub color: [f32; 3],
}

/// A control point of the opacity transfer function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpacityControl {
    pub value: f32,
    pub opacity: f32,
}

/// Linear data-value to radius mapping for particles and path lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusMap {
    pub value0: f32,
    pub value1: f32,
    pub radius0: f32,
    pub radius1: f32,
}

impl RadiusMap {
    #[must_use]
    pub fn radius(&self, v: f32) -> f32 {
        if (self.value1 - self.value0).abs() < f32::EPSILON {
            return self.radius0;
        }
        let t = ((v - self.value0) / (self.value1 - self.value0)).clamp(0.0, 1.0);
        self.radius0 + t * (self.radius1 - self.radius0)
    }
}

/// Type-specific parameters of one vis element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VisParams {
    Volume {
        colormap: Vec<ColorControl>,
        opacitymap: Vec<OpacityControl>,
        /// Integrate the volume; otherwise only isosurfaces/slices show.
        volume_rendering: bool,
        isovalues: Vec<f32>,
        /// Slice planes as (nx, ny, nz, d).
        slices: Vec<[f32; 4]>,
    },
    Particles {
        radius_map: RadiusMap,
    },
    PathLines {
        radius_map: RadiusMap,
    },
    Triangles,
}

/// One element of a visualization: a dataset and how to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vis {
    pub dataset_key: Key,
    pub params: VisParams,
}

/// The full recipe for one image family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Visualization {
    /// Appended to image filenames.
    pub annotation: String,
    pub elements: Vec<Vis>,
    pub lighting: Lighting,
}

impl Visualization {
    /// Piecewise-linear colormap lookup on the first volume element.
    #[must_use]
    pub fn sample_colormap(&self, v: f32) -> Option<[f32; 3]> {
        for e in &self.elements {
            if let VisParams::Volume { colormap, .. } = &e.params {
                return Some(lerp_controls(colormap, v, |c| (c.value, c.color)));
            }
        }
        None
    }

    /// Piecewise-linear opacity lookup on the first volume element.
    #[must_use]
    pub fn sample_opacity(&self, v: f32) -> Option<f32> {
        for e in &self.elements {
            if let VisParams::Volume { opacitymap, .. } = &e.params {
                let [o] = lerp_controls(opacitymap, v, |c| (c.value, [c.opacity]));
                return Some(o);
            }
        }
        None
    }
}

fn lerp_controls<T, const N: usize>(
    controls: &[T],
    v: f32,
    get: impl Fn(&T) -> (f32, [f32; N]),
) -> [f32; N] {
    assert!(!controls.is_empty(), "empty transfer function");
    let (first_v, first_c) = get(&controls[0]);
    if v <= first_v {
        return first_c;
    }
    for pair in controls.windows(2) {
        let (v0, c0) = get(&pair[0]);
        let (v1, c1) = get(&pair[1]);
        if v <= v1 {
            let t = if (v1 - v0).abs() < f32::EPSILON {
                0.0
            } else {
                (v - v0) / (v1 - v0)
            };
            let mut out = [0.0; N];
            for ((o, a), b) in out.iter_mut().zip(c0).zip(c1) {
                *o = a + t * (b - a);
            }
            return out;
        }
    }
    let (_, last) = get(controls.last().unwrap());
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_vis() -> Visualization {
        Visualization {
            annotation: "_vol".into(),
            elements: vec![Vis {
                dataset_key: 1,
                params: VisParams::Volume {
                    colormap: vec![
                        ColorControl { value: 0.0, color: [0.0, 0.0, 0.0] },
                        ColorControl { value: 1.0, color: [1.0, 0.5, 0.0] },
                    ],
                    opacitymap: vec![
                        OpacityControl { value: 0.0, opacity: 0.0 },
                        OpacityControl { value: 1.0, opacity: 1.0 },
                    ],
                    volume_rendering: true,
                    isovalues: Vec::new(),
                    slices: Vec::new(),
                },
            }],
            lighting: Lighting::default(),
        }
    }

    #[test]
    fn colormap_interpolates_and_clamps() {
        let vis = volume_vis();
        let mid = vis.sample_colormap(0.5).unwrap();
        assert!((mid[0] - 0.5).abs() < 1e-6);
        assert!((mid[1] - 0.25).abs() < 1e-6);
        assert_eq!(vis.sample_colormap(-1.0).unwrap(), [0.0, 0.0, 0.0]);
        assert_eq!(vis.sample_colormap(2.0).unwrap(), [1.0, 0.5, 0.0]);
    }

    #[test]
    fn opacity_tracks_value() {
        let vis = volume_vis();
        assert!((vis.sample_opacity(0.25).unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn radius_map_is_linear_and_clamped() {
        let m = RadiusMap {
            value0: 0.0,
            value1: 10.0,
            radius0: 1.0,
            radius1: 2.0,
        };
        assert!((m.radius(5.0) - 1.5).abs() < 1e-6);
        assert!((m.radius(-5.0) - 1.0).abs() < 1e-6);
        assert!((m.radius(50.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn visualization_json_round_trip() {
        let vis = volume_vis();
        let json = serde_json::to_string(&vis).unwrap();
        let back: Visualization = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vis);
    }
}
