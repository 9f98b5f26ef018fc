//! Cameras and primary-ray generation.
//!
//! Each rank spawns rays only for the pixels its own sub-box can be the
//! first thing hit by: the sub-box is projected onto the image plane to
//! bound the candidate pixel rectangle, and each candidate ray is kept
//! only when its local-box entry coincides with its global-box entry
//! within `fuzz`. Generation is tiled across the thread pool; every tile
//! brackets itself with the set's active-camera count so the termination
//! detector cannot see a false idle while spawning is underway.

use std::sync::Arc;

use glam::Vec3;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::geometry::{Box3, intersect_line_plane};
use crate::rays::{Classification, RayList, RayListKind, RayType, TermFlags};
use crate::renderer::Renderer;
use crate::rendering::{DetectorLink, Rendering, RenderingSet};

/// Replicated camera description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub eye: Vec3,
    pub view_dir: Vec3,
    pub view_up: Vec3,
    /// Angle of view in degrees; 0 selects orthographic projection.
    pub aov: f32,
    pub width: usize,
    pub height: usize,
    /// Appended to image filenames.
    pub annotation: String,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 5.0),
            view_dir: Vec3::new(0.0, 0.0, -1.0),
            view_up: Vec3::Y,
            aov: 30.0,
            width: 512,
            height: 512,
            annotation: String::new(),
        }
    }
}

/// Derived image-plane frame.
#[derive(Debug, Clone, Copy)]
pub struct CameraBasis {
    pub eye: Vec3,
    pub dir: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    /// Center of the image plane in world space.
    pub center: Vec3,
    pub pixel_scaling: f32,
    pub off_x: f32,
    pub off_y: f32,
    pub is_ortho: bool,
}

impl Camera {
    /// Build the orthonormal (right, up, dir) frame and image-plane
    /// placement. The plane sits at distance `1 / tan(aov / 2)` for
    /// perspective, one unit out for orthographic.
    #[must_use]
    pub fn basis(&self) -> CameraBasis {
        let dir = self.view_dir.normalize();
        let right = dir.cross(self.view_up).normalize();
        let up = right.cross(dir).normalize();

        let is_ortho = self.aov == 0.0;
        let center = if is_ortho {
            self.eye + dir
        } else {
            let d = 1.0 / (self.aov.to_radians() / 2.0).tan();
            self.eye + dir * d
        };

        // Fit the (-1,1) square into the short image axis
        let pixel_scaling = (self.width.min(self.height) as f32 - 1.0) / 2.0;

        CameraBasis {
            eye: self.eye,
            dir,
            right,
            up,
            center,
            pixel_scaling,
            off_x: (self.width as f32 - 1.0) / 2.0,
            off_y: (self.height as f32 - 1.0) / 2.0,
            is_ortho,
        }
    }

    /// World-space ray through pixel `(x, y)`.
    #[must_use]
    pub fn ray_for_pixel(basis: &CameraBasis, x: i32, y: i32) -> (Vec3, Vec3) {
        let fx = (x as f32 - basis.off_x) / basis.pixel_scaling;
        let fy = (y as f32 - basis.off_y) / basis.pixel_scaling;
        let on_plane = basis.center + basis.right * fx + basis.up * fy;

        if basis.is_ortho {
            // Back the origin off the plane so geometry in front of it
            // still gets hit
            (on_plane - basis.dir, basis.dir)
        } else {
            (basis.eye, (on_plane - basis.eye).normalize())
        }
    }

    /// The inclusive pixel rectangle that can see `lbox` first, clipped
    /// to the screen; `None` when the projection misses the screen
    /// entirely. With the eye inside the box every pixel qualifies.
    #[must_use]
    pub fn screen_rect(&self, basis: &CameraBasis, lbox: &Box3) -> Option<(i32, i32, i32, i32)> {
        let full = (0, 0, self.width as i32 - 1, self.height as i32 - 1);
        if lbox.contains(basis.eye, 0.0) {
            return Some(full);
        }

        // The image plane is (dir, w)
        let w = -basis.center.dot(basis.dir);

        let mut minx = f32::INFINITY;
        let mut maxx = f32::NEG_INFINITY;
        let mut miny = f32::INFINITY;
        let mut maxy = f32::NEG_INFINITY;

        for i in 0..8 {
            let corner = lbox.corner(i);
            let proj = if basis.is_ortho {
                intersect_line_plane(corner, basis.dir, basis.dir, w)
            } else {
                intersect_line_plane(corner, corner - basis.eye, basis.dir, w)
            };
            // Into (right, up) coordinates centered on the plane
            let rel = proj - basis.center;
            let x = rel.dot(basis.right);
            let y = rel.dot(basis.up);
            minx = minx.min(x);
            maxx = maxx.max(x);
            miny = miny.min(y);
            maxy = maxy.max(y);
        }

        let ixmin = ((minx * basis.pixel_scaling + basis.off_x).floor() as i32).max(0);
        let ixmax = ((maxx * basis.pixel_scaling + basis.off_x).ceil() as i32).min(self.width as i32 - 1);
        let iymin = ((miny * basis.pixel_scaling + basis.off_y).floor() as i32).max(0);
        let iymax = ((maxy * basis.pixel_scaling + basis.off_y).ceil() as i32).min(self.height as i32 - 1);

        if ixmin > ixmax || iymin > iymax {
            return None;
        }
        Some((ixmin, iymin, ixmax, iymax))
    }
}

/// Everything a spawn tile needs, shared across the tile tasks of one
/// rendering x frame.
pub struct SpawnArgs {
    pub renderer: Arc<Renderer>,
    pub set: Arc<RenderingSet>,
    pub rendering: Arc<Rendering>,
    pub camera: Camera,
    pub local_box: Box3,
    pub global_box: Box3,
    pub frame: i32,
    pub link: Arc<DetectorLink>,
}

/// Project the local sub-box, tile the resulting pixel rectangle, and
/// fan the tiles out over the thread pool. Spawning is the highest
/// priority work a rank does for a new frame.
pub fn generate_initial_rays(args: &Arc<SpawnArgs>) {
    let basis = args.camera.basis();
    let Some((x0, y0, x1, y1)) = args.camera.screen_rect(&basis, &args.local_box) else {
        return;
    };

    let iw = (x1 - x0 + 1) as usize;
    let ih = (y1 - y0 + 1) as usize;
    let total = iw * ih;

    let config = *args.renderer.config();
    let permutation: Arc<Option<Vec<usize>>> = Arc::new(config.permute_pixels.then(|| {
        let mut p: Vec<usize> = (0..total).collect();
        p.shuffle(&mut rand::rng());
        p
    }));

    let mut start = 0;
    while start < total {
        let count = config.max_rays_per_list.min(total - start);
        args.set.camera_started();

        let args = args.clone();
        let permutation = permutation.clone();
        let pool = args.link.pool.clone();
        pool.add_task(move || {
            spawn_tile(&args, &permutation, basis, (x0, y0, iw), start, count);
            0
        });

        start += count;
    }
}

/// Generate the rays of one tile, keeping only first-hit pixels, and
/// enqueue them locally.
fn spawn_tile(
    args: &SpawnArgs,
    permutation: &Option<Vec<usize>>,
    basis: CameraBasis,
    rect: (i32, i32, usize),
    start: usize,
    count: usize,
) {
    if !args.set.is_active(args.frame) {
        // A later frame got here first; this tile's rays would be stale
        args.set.camera_finished(0, &args.link);
        return;
    }

    let (x0, y0, iw) = rect;
    let fuzz = args.renderer.config().fuzz;
    let mut list = RayList::new(
        args.renderer.key(),
        args.set.key(),
        args.rendering.key(),
        count,
        args.frame,
        RayListKind::Primary,
    );

    let mut dst = 0;
    for i in 0..count {
        let pindex = start + i;
        let p = permutation.as_ref().map_or(pindex, |perm| perm[pindex]);
        let x = x0 + (p % iw) as i32;
        let y = y0 + (p / iw) as i32;

        let (origin, dir) = Camera::ray_for_pixel(&basis, x, y);

        let Some((gmin, _gmax)) = args.global_box.intersect(origin, dir) else {
            continue;
        };
        let Some((lmin, lmax)) = args.local_box.intersect(origin, dir) else {
            continue;
        };

        // First-hit test: the local entry must be the global entry
        let d = lmin.abs() - gmin.abs();
        if lmax < 0.0 || d.abs() >= fuzz {
            continue;
        }

        list.set_pixel(dst, x, y);
        list.set_origin(dst, origin);
        list.set_dir(dst, dir);
        list.set_color(dst, [0.0, 0.0, 0.0, 0.0]);
        list.set_surface_color(dst, [0.0, 0.0, 0.0, 0.0]);
        list.set_t(dst, 0.0);
        list.set_t_max(dst, f32::MAX);
        list.set_ray_type(dst, RayType::Primary);
        list.set_term(dst, TermFlags::empty());
        list.set_classification(dst, Classification::Undetermined);
        dst += 1;
    }

    if dst > 0 && args.set.is_active(args.frame) {
        list.truncate(dst);
        args.renderer.record_originated(dst);
        args.set.enqueue(list, true, &args.link);
    } else {
        dst = 0;
    }

    args.set.camera_finished(dst, &args.link);
}
