//! Axis-aligned box geometry shared by the partitioning, the camera and
//! the trace kernels.
//!
//! Face indices follow the partition convention throughout the engine:
//! `0` lower x, `1` upper x, `2` lower y, `3` upper y, `4` lower z,
//! `5` upper z.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// An axis-aligned box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Box3 {
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// The unit cube centered at the origin, handy in tests.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(Vec3::splat(-1.0), Vec3::splat(1.0))
    }

    #[must_use]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// The smallest edge length, used to scale the face-crossing epsilon.
    #[must_use]
    pub fn smallest_extent(&self) -> f32 {
        let e = self.extent();
        e.x.min(e.y).min(e.z)
    }

    /// The `i`th corner, `i` in `0..8`, with bit 0 selecting x, bit 1 y,
    /// bit 2 z.
    #[must_use]
    pub fn corner(&self, i: usize) -> Vec3 {
        Vec3::new(
            if i & 1 == 0 { self.min.x } else { self.max.x },
            if i & 2 == 0 { self.min.y } else { self.max.y },
            if i & 4 == 0 { self.min.z } else { self.max.z },
        )
    }

    /// Grow this box to cover `other`.
    pub fn expand(&mut self, other: &Box3) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Whether `p` lies inside the box, widened by `fuzz` on every face.
    #[must_use]
    pub fn contains(&self, p: Vec3, fuzz: f32) -> bool {
        p.x >= self.min.x - fuzz
            && p.x <= self.max.x + fuzz
            && p.y >= self.min.y - fuzz
            && p.y <= self.max.y + fuzz
            && p.z >= self.min.z - fuzz
            && p.z <= self.max.z + fuzz
    }

    /// Slab intersection of the ray `origin + t * dir` with this box.
    ///
    /// Returns the parametric entry and exit distances `(tmin, tmax)` with
    /// `tmin <= tmax`, or `None` when the ray misses. A negative `tmin`
    /// means the origin is inside the box.
    #[must_use]
    pub fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<(f32, f32)> {
        let mut tmin = f32::NEG_INFINITY;
        let mut tmax = f32::INFINITY;

        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            let lo = self.min[axis];
            let hi = self.max[axis];

            if d == 0.0 {
                if o < lo || o > hi {
                    return None;
                }
            } else {
                let inv = 1.0 / d;
                let (t0, t1) = if inv >= 0.0 {
                    ((lo - o) * inv, (hi - o) * inv)
                } else {
                    ((hi - o) * inv, (lo - o) * inv)
                };
                tmin = tmin.max(t0);
                tmax = tmax.min(t1);
                if tmin > tmax {
                    return None;
                }
            }
        }

        Some((tmin, tmax))
    }

    /// The first face the ray `origin + t * dir` crosses leaving the box
    /// from inside, as a face index in `0..6`.
    ///
    /// The origin is assumed inside or on the boundary; the result is the
    /// face whose slab exit distance is smallest.
    #[must_use]
    pub fn exit_face(&self, origin: Vec3, dir: Vec3) -> usize {
        let mut best_face = 0;
        let mut best_t = f32::INFINITY;

        for axis in 0..3 {
            let d = dir[axis];
            if d == 0.0 {
                continue;
            }
            let (face, bound) = if d > 0.0 {
                (axis * 2 + 1, self.max[axis])
            } else {
                (axis * 2, self.min[axis])
            };
            let t = (bound - origin[axis]) / d;
            if t < best_t {
                best_t = t;
                best_face = face;
            }
        }

        best_face
    }

    /// Parametric distance to the exit face, paired with [`Self::exit_face`].
    #[must_use]
    pub fn exit_t(&self, origin: Vec3, dir: Vec3) -> f32 {
        let mut best_t = f32::INFINITY;
        for axis in 0..3 {
            let d = dir[axis];
            if d == 0.0 {
                continue;
            }
            let bound = if d > 0.0 { self.max[axis] } else { self.min[axis] };
            let t = (bound - origin[axis]) / d;
            if t < best_t {
                best_t = t;
            }
        }
        best_t
    }
}

/// Intersection of the line through `p` with direction `l` and the plane
/// with normal `n` and offset `w` (`n · x + w = 0`).
#[must_use]
pub fn intersect_line_plane(p: Vec3, l: Vec3, n: Vec3, w: f32) -> Vec3 {
    let denom = l.dot(n);
    let t = -(p.dot(n) + w) / denom;
    p + l * t
}
