//! Lighting record carried by a visualization.
//!
//! Camera-relative lights are stored in the camera's (right, up, dir)
//! basis and resolved to world-space point lights when a render starts,
//! so a moving camera drags its lights along.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// One light source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LightSource {
    /// World-space position.
    Point(Vec3),
    /// Direction the light travels; no falloff.
    Distant(Vec3),
    /// Offsets in the camera's (right, up, dir) basis.
    CameraRelative(Vec3),
}

/// The lighting environment of a visualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lighting {
    pub lights: Vec<LightSource>,
    /// Ambient-occlusion rays spawned per primary surface hit; 0 disables.
    pub ao_count: u32,
    /// Occlusion search radius, also the tMax of AO rays.
    pub ao_radius: f32,
    /// Ambient coefficient.
    pub ka: f32,
    /// Diffuse coefficient.
    pub kd: f32,
    /// Whether surface hits spawn shadow rays.
    pub shadows: bool,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            lights: vec![LightSource::CameraRelative(Vec3::new(0.0, 0.0, 1.0))],
            ao_count: 0,
            ao_radius: 1.0,
            ka: 0.4,
            kd: 0.6,
            shadows: false,
        }
    }
}

/// A light after resolution against the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedLight {
    Point(Vec3),
    Distant(Vec3),
}

impl ResolvedLight {
    /// Direction from `p` toward the light and the parametric distance a
    /// shadow ray must cover.
    #[must_use]
    pub fn toward(&self, p: Vec3) -> (Vec3, f32) {
        match self {
            ResolvedLight::Point(pos) => {
                let v = *pos - p;
                let d = v.length();
                (v / d, d)
            }
            ResolvedLight::Distant(dir) => (-dir.normalize(), f32::MAX),
        }
    }
}

/// World-space lighting used by the trace loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLighting {
    pub lights: Vec<ResolvedLight>,
    pub ao_count: u32,
    pub ao_radius: f32,
    pub ka: f32,
    pub kd: f32,
    pub shadows: bool,
}

impl Lighting {
    /// Resolve camera-relative lights into world space.
    #[must_use]
    pub fn resolve(&self, eye: Vec3, right: Vec3, up: Vec3, dir: Vec3) -> ResolvedLighting {
        let lights = self
            .lights
            .iter()
            .map(|l| match l {
                LightSource::Point(p) => ResolvedLight::Point(*p),
                LightSource::Distant(d) => ResolvedLight::Distant(d.normalize()),
                LightSource::CameraRelative(o) => {
                    ResolvedLight::Point(eye + right * o.x + up * o.y + dir * o.z)
                }
            })
            .collect();
        ResolvedLighting {
            lights,
            ao_count: self.ao_count,
            ao_radius: self.ao_radius,
            ka: self.ka,
            kd: self.kd,
            shadows: self.shadows,
        }
    }
}
