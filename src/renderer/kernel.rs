//! Trace and shade kernel interfaces.
//!
//! The transport core never intersects geometry itself: it hands each
//! ray list to a [`TraceKernel`], which advances every ray to its next
//! event (surface hit, opacity saturation, local-box exit, or secondary
//! target reached) and records termination flags, and invokes a
//! [`ShadeKernel`] for the non-occluded part of surface shading.
//! Production kernels vectorize over the SoA lanes; the
//! [`LinearVolumeKernel`] here integrates a homogeneous medium with
//! optional embedded plane surfaces, enough to exercise every path of
//! the transport loop.

use glam::Vec3;

use crate::geometry::Box3;
use crate::lighting::ResolvedLighting;
use crate::rays::{RayList, RayType, TermFlags};
use crate::vis::Visualization;

/// Everything a kernel may consult during one trace pass.
pub struct TraceContext<'a> {
    pub vis: &'a Visualization,
    pub lights: &'a ResolvedLighting,
    pub local_box: Box3,
    pub global_box: Box3,
    /// Offset used when restarting a ray past a surface.
    pub epsilon: f32,
    /// Step budget; exceeding it sets `TIMEOUT`.
    pub step_limit: u32,
}

/// A primary-ray surface hit that may spawn secondaries.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceHit {
    /// Ray index within the traced list.
    pub index: usize,
    pub position: Vec3,
    /// Unit normal, oriented against the incoming ray.
    pub normal: Vec3,
    /// Surface color and opacity.
    pub color: [f32; 4],
    pub opaque: bool,
}

/// Advances rays to their next event.
pub trait TraceKernel: Send + Sync {
    /// Trace every ray in `rays`, updating t, termination flags,
    /// accumulated color, surface color and normal in place, and
    /// pushing a [`SurfaceHit`] for each primary surface encounter.
    fn trace(
        &self,
        ctx: &TraceContext<'_>,
        shade: &dyn ShadeKernel,
        rays: &mut RayList,
        hits: &mut Vec<SurfaceHit>,
    );
}

/// Computes the immediate (non-occluded) part of surface shading. The
/// occluded parts ride on shadow and ambient-occlusion rays spawned by
/// the transport loop, so this must leave them out exactly when those
/// rays will be spawned.
pub trait ShadeKernel: Send + Sync {
    fn shade(
        &self,
        lights: &ResolvedLighting,
        position: Vec3,
        normal: Vec3,
        surface: [f32; 4],
    ) -> [f32; 4];
}

/// Ambient plus unshadowed diffuse. Ambient moves onto AO rays when AO
/// is enabled, diffuse moves onto shadow rays when shadows are enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhongShader;

impl ShadeKernel for PhongShader {
    fn shade(
        &self,
        lights: &ResolvedLighting,
        position: Vec3,
        normal: Vec3,
        surface: [f32; 4],
    ) -> [f32; 4] {
        let ambient = if lights.ao_count > 0 { 0.0 } else { lights.ka };

        let diffuse = if lights.shadows {
            0.0
        } else {
            lights
                .lights
                .iter()
                .map(|l| {
                    let (toward, _) = l.toward(position);
                    normal.dot(toward).max(0.0) * lights.kd
                })
                .sum::<f32>()
        };

        let k = ambient + diffuse;
        [
            surface[0] * k,
            surface[1] * k,
            surface[2] * k,
            surface[3],
        ]
    }
}

/// An infinite plane `normal . x = offset` embedded in the volume.
#[derive(Debug, Clone, Copy)]
pub struct PlaneSurface {
    pub normal: Vec3,
    pub offset: f32,
    pub color: [f32; 4],
    pub opaque: bool,
}

/// Homogeneous participating medium with optional plane surfaces.
/// Opacity accumulates linearly with path length.
#[derive(Debug, Clone)]
pub struct LinearVolumeKernel {
    pub albedo: [f32; 3],
    /// Opacity per unit path length; 0 disables volume accumulation.
    pub extinction: f32,
    pub surfaces: Vec<PlaneSurface>,
}

impl Default for LinearVolumeKernel {
    fn default() -> Self {
        Self {
            albedo: [1.0, 1.0, 1.0],
            extinction: 0.5,
            surfaces: Vec::new(),
        }
    }
}

const OPACITY_CUTOFF: f32 = 0.999;

impl LinearVolumeKernel {
    /// Nearest plane intersection strictly inside `(start, stop]`.
    fn nearest_surface(
        &self,
        origin: Vec3,
        dir: Vec3,
        start: f32,
        stop: f32,
    ) -> Option<(f32, &PlaneSurface)> {
        let mut best: Option<(f32, &PlaneSurface)> = None;
        for s in &self.surfaces {
            let denom = s.normal.dot(dir);
            if denom.abs() < 1e-12 {
                continue;
            }
            let t = (s.offset - s.normal.dot(origin)) / denom;
            if t > start && t <= stop && best.is_none_or(|(bt, _)| t < bt) {
                best = Some((t, s));
            }
        }
        best
    }
}

impl TraceKernel for LinearVolumeKernel {
    fn trace(
        &self,
        ctx: &TraceContext<'_>,
        shade: &dyn ShadeKernel,
        rays: &mut RayList,
        hits: &mut Vec<SurfaceHit>,
    ) {
        for i in 0..rays.len() {
            if rays.ray_type(i) == RayType::Empty {
                continue;
            }

            let origin = rays.origin(i);
            let dir = rays.dir(i);
            if !(origin.is_finite() && dir.is_finite()) || dir.length_squared() == 0.0 {
                // Leave the flags alone; classification drops the ray
                continue;
            }

            let Some((lmin, lmax)) = ctx.local_box.intersect(origin, dir) else {
                // Not in this sub-box at all; hand it to the boundary
                // machinery, which will route or retire it
                rays.set_term(i, rays.term(i) | TermFlags::BOUNDARY);
                continue;
            };

            let start = rays.t(i).max(lmin).max(0.0);
            let t_max = rays.t_max(i);
            let is_secondary = rays.ray_type(i).is_secondary();

            // Secondaries only probe for occlusion
            if is_secondary {
                let stop = t_max.min(lmax);
                if let Some((t_hit, _)) = self.nearest_surface(origin, dir, start, stop) {
                    rays.set_t(i, t_hit);
                    rays.set_term(i, TermFlags::SURFACE);
                } else if lmax < t_max {
                    rays.set_t(i, lmax);
                    rays.set_term(i, TermFlags::BOUNDARY);
                } else {
                    // Survived to the target unoccluded
                    rays.set_t(i, t_max);
                    rays.set_term(i, TermFlags::empty());
                }
                continue;
            }

            let hit = self.nearest_surface(origin, dir, start, lmax.min(t_max));
            let stop = hit.map_or_else(|| lmax.min(t_max), |(t, _)| t);

            // Volume integration over [start, stop]
            let mut acc = rays.color(i);
            if self.extinction > 0.0 && stop > start {
                let seg_o = (self.extinction * (stop - start)).min(1.0);
                let through = 1.0 - acc[3];
                acc[0] += through * seg_o * self.albedo[0];
                acc[1] += through * seg_o * self.albedo[1];
                acc[2] += through * seg_o * self.albedo[2];
                acc[3] += through * seg_o;
            }

            if acc[3] >= OPACITY_CUTOFF {
                rays.set_color(i, acc);
                rays.set_t(i, stop);
                rays.set_term(i, TermFlags::OPAQUE);
                continue;
            }

            if let Some((t_hit, surface)) = hit {
                let position = origin + dir * t_hit;
                let normal = if surface.normal.dot(dir) > 0.0 {
                    -surface.normal
                } else {
                    surface.normal
                };

                let shaded = shade.shade(ctx.lights, position, normal, surface.color);
                let through = 1.0 - acc[3];
                acc[0] += through * shaded[0];
                acc[1] += through * shaded[1];
                acc[2] += through * shaded[2];
                acc[3] += through * if surface.opaque { 1.0 } else { surface.color[3] };

                rays.set_color(i, acc);
                rays.set_t(i, t_hit);
                rays.set_normal(i, normal);
                rays.set_surface_color(i, surface.color);
                let mut term = TermFlags::SURFACE;
                if surface.opaque {
                    term |= TermFlags::OPAQUE;
                }
                rays.set_term(i, term);

                hits.push(SurfaceHit {
                    index: i,
                    position,
                    normal,
                    color: surface.color,
                    opaque: surface.opaque,
                });
                continue;
            }

            rays.set_color(i, acc);
            rays.set_t(i, stop);
            if stop >= t_max {
                // Primary ran out of parametric budget
                rays.set_term(i, TermFlags::TIMEOUT);
            } else {
                rays.set_term(i, TermFlags::BOUNDARY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lighting::Lighting;
    use crate::rays::{Classification, RayListKind};

    fn ctx<'a>(
        vis: &'a Visualization,
        lights: &'a ResolvedLighting,
        local: Box3,
        global: Box3,
    ) -> TraceContext<'a> {
        TraceContext {
            vis,
            lights,
            local_box: local,
            global_box: global,
            epsilon: 1e-4,
            step_limit: 1_000_000,
        }
    }

    fn one_ray(origin: Vec3, dir: Vec3) -> RayList {
        let mut l = RayList::new(1, 2, 3, 1, 1, RayListKind::Primary);
        l.set_origin(0, origin);
        l.set_dir(0, dir);
        l.set_t(0, 0.0);
        l.set_t_max(0, f32::MAX);
        l.set_ray_type(0, RayType::Primary);
        l.set_classification(0, Classification::Undetermined);
        l
    }

    fn no_lights() -> ResolvedLighting {
        Lighting {
            lights: Vec::new(),
            ..Lighting::default()
        }
        .resolve(Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z)
    }

    #[test]
    fn ray_through_medium_reaches_boundary_with_accumulation() {
        let vis = Visualization::default();
        let lights = no_lights();
        let kernel = LinearVolumeKernel {
            albedo: [1.0, 0.5, 0.0],
            extinction: 0.25,
            surfaces: Vec::new(),
        };
        let local = Box3::unit();
        let tctx = ctx(&vis, &lights, local, local);

        let mut rays = one_ray(Vec3::new(0.0, 0.0, 3.0), Vec3::new(0.0, 0.0, -1.0));
        let mut hits = Vec::new();
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);

        assert_eq!(rays.term(0), TermFlags::BOUNDARY);
        // Exit at z = -1, i.e. t = 4
        assert!((rays.t(0) - 4.0).abs() < 1e-5);
        // Two units of path at 0.25 extinction
        let c = rays.color(0);
        assert!((c[3] - 0.5).abs() < 1e-5);
        assert!((c[0] - 0.5).abs() < 1e-5);
        assert!((c[1] - 0.25).abs() < 1e-5);
        assert!(hits.is_empty());
    }

    #[test]
    fn opaque_plane_terminates_and_reports_hit() {
        let vis = Visualization::default();
        let lights = no_lights();
        let kernel = LinearVolumeKernel {
            albedo: [0.0; 3],
            extinction: 0.0,
            surfaces: vec![PlaneSurface {
                normal: Vec3::Z,
                offset: 0.0,
                color: [0.8, 0.2, 0.1, 1.0],
                opaque: true,
            }],
        };
        let local = Box3::unit();
        let tctx = ctx(&vis, &lights, local, local);

        let mut rays = one_ray(Vec3::new(0.2, 0.1, 1.0), Vec3::new(0.0, 0.0, -1.0));
        let mut hits = Vec::new();
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);

        assert!(rays.term(0).contains(TermFlags::SURFACE));
        assert!(rays.term(0).contains(TermFlags::OPAQUE));
        assert!((rays.t(0) - 1.0).abs() < 1e-5);
        assert_eq!(hits.len(), 1);
        // Normal faces the incoming ray
        assert!((hits[0].normal - Vec3::Z).length() < 1e-6);
        assert!((hits[0].position.z).abs() < 1e-5);
    }

    #[test]
    fn shadow_probe_sets_surface_on_occlusion_only() {
        let vis = Visualization::default();
        let lights = no_lights();
        let kernel = LinearVolumeKernel {
            albedo: [0.0; 3],
            extinction: 0.0,
            surfaces: vec![PlaneSurface {
                normal: Vec3::X,
                offset: 0.5,
                color: [0.0, 0.0, 0.0, 1.0],
                opaque: true,
            }],
        };
        let local = Box3::unit();
        let tctx = ctx(&vis, &lights, local, local);

        // Occluded: crosses the x = 0.5 plane before t_max
        let mut rays = one_ray(Vec3::ZERO, Vec3::X);
        rays.set_ray_type(0, RayType::Shadow);
        rays.set_t_max(0, 0.9);
        let mut hits = Vec::new();
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);
        assert_eq!(rays.term(0), TermFlags::SURFACE);
        assert!(hits.is_empty());

        // Unoccluded: target closer than the plane
        let mut rays = one_ray(Vec3::ZERO, Vec3::X);
        rays.set_ray_type(0, RayType::Shadow);
        rays.set_t_max(0, 0.25);
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);
        assert_eq!(rays.term(0), TermFlags::empty());

        // Leaves the sub-box before reaching the target: migrates
        let mut rays = one_ray(Vec3::ZERO, Vec3::NEG_X);
        rays.set_ray_type(0, RayType::Shadow);
        rays.set_t_max(0, 5.0);
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);
        assert_eq!(rays.term(0), TermFlags::BOUNDARY);
    }

    #[test]
    fn saturated_opacity_terminates_opaque() {
        let vis = Visualization::default();
        let lights = no_lights();
        let kernel = LinearVolumeKernel {
            albedo: [1.0; 3],
            extinction: 10.0,
            surfaces: Vec::new(),
        };
        let local = Box3::unit();
        let tctx = ctx(&vis, &lights, local, local);

        let mut rays = one_ray(Vec3::new(0.0, 0.0, 0.9), Vec3::new(0.0, 0.0, -1.0));
        let mut hits = Vec::new();
        kernel.trace(&tctx, &PhongShader, &mut rays, &mut hits);
        assert_eq!(rays.term(0), TermFlags::OPAQUE);
        assert!(rays.color(0)[3] >= 0.999);
    }

    #[test]
    fn shader_moves_terms_onto_secondary_rays() {
        let lighting = Lighting {
            lights: vec![crate::lighting::LightSource::Point(Vec3::new(0.0, 2.0, 0.0))],
            ka: 0.4,
            kd: 0.6,
            shadows: false,
            ao_count: 0,
            ..Lighting::default()
        };
        let resolved = lighting.resolve(Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z);
        let surface = [1.0, 1.0, 1.0, 1.0];

        // Light straight above a +y-facing surface: ka + kd
        let lit = PhongShader.shade(&resolved, Vec3::ZERO, Vec3::Y, surface);
        assert!((lit[0] - 1.0).abs() < 1e-5);

        // Shadows on: diffuse leaves for the shadow rays
        let shadowed = Lighting {
            shadows: true,
            ..lighting.clone()
        }
        .resolve(Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z);
        let lit = PhongShader.shade(&shadowed, Vec3::ZERO, Vec3::Y, surface);
        assert!((lit[0] - 0.4).abs() < 1e-5);

        // AO on: ambient leaves for the AO rays
        let ao = Lighting {
            ao_count: 4,
            ..lighting
        }
        .resolve(Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z);
        let lit = PhongShader.shade(&ao, Vec3::ZERO, Vec3::Y, surface);
        assert!((lit[0] - 0.6).abs() < 1e-5);
    }
}
