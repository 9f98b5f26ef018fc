//! The renderer: per-list trace pipeline and its variants.
//!
//! Each ray list dequeued on a rank runs one pass of
//! Trace -> Classify -> AssignDestinations -> HandleTerminated/Forward ->
//! SpawnSecondaries. Rays that cross an internal partition face are
//! packed into fresh lists and migrated to the face neighbor; terminated
//! rays become pixel contributions routed to the rendering owner;
//! primary surface hits spawn shadow and ambient-occlusion rays that
//! start in the same partition as their parent.

pub mod kernel;
mod sampler;
mod schlieren;

pub use kernel::{
    LinearVolumeKernel, PhongShader, PlaneSurface, ShadeKernel, SurfaceHit, TraceContext,
    TraceKernel,
};
pub use sampler::SampleHit;

use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::camera::CameraBasis;
use crate::comm::{Frame, MessageClass, Pixel, pack_pixels};
use crate::errors::Result;
use crate::lighting::ResolvedLighting;
use crate::partition::Partition;
use crate::rays::{Classification, RayList, RayListKind, RayType, TermFlags};
use crate::registry::{Key, Registry};
use crate::rendering::{DetectorLink, Rendering, RenderingSet};

/// Which terminated-ray semantics a renderer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendererKind {
    /// Terminated rays accumulate their color into the frame buffer.
    Raycast,
    /// Terminated surface hits are extracted as particle positions.
    Sampler,
    /// Terminated rays measure their deflection against the image plane.
    Schlieren,
}

/// Replicated renderer parameters; the wire form of its commit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub kind: RendererKind,
    /// Rays per list; larger lists are split before queueing or sending.
    pub max_rays_per_list: usize,
    /// Offset along the normal (or direction) when restarting rays.
    pub epsilon: f32,
    /// First-hit tolerance for camera-ray clipping.
    pub fuzz: f32,
    /// Randomize pixel order within each spawn rectangle.
    pub permute_pixels: bool,
    /// Per-ray step budget before a TIMEOUT termination.
    pub step_limit: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            kind: RendererKind::Raycast,
            max_rays_per_list: 10_000,
            epsilon: 1e-4,
            fuzz: 1e-6,
            permute_pixels: false,
            step_limit: 1_000_000,
        }
    }
}

/// Per-rank ray-traffic counters, dumped by the Statistics collective.
#[derive(Debug, Default, Clone)]
pub struct RenderStats {
    pub sent_to: Vec<u64>,
    pub received_from: Vec<u64>,
    pub originated: u64,
}

/// What the pipeline needs from the rest of the rank.
pub struct RenderContext<'a> {
    pub registry: &'a Registry,
    pub partition: &'a Partition,
    pub link: &'a Arc<DetectorLink>,
    pub rank: usize,
    pub size: usize,
}

/// The per-rank renderer. Replicated by config; kernels are installed
/// locally.
pub struct Renderer {
    key: Key,
    config: RendererConfig,
    trace_kernel: Arc<dyn TraceKernel>,
    shade_kernel: Arc<dyn ShadeKernel>,
    stats: Mutex<RenderStats>,
    samples: Mutex<Vec<SampleHit>>,
}

impl Renderer {
    #[must_use]
    pub fn new(
        key: Key,
        config: RendererConfig,
        trace_kernel: Arc<dyn TraceKernel>,
        shade_kernel: Arc<dyn ShadeKernel>,
    ) -> Self {
        Self {
            key,
            config,
            trace_kernel,
            shade_kernel,
            stats: Mutex::new(RenderStats::default()),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// A renderer with the built-in kernels, as installed for a config
    /// arriving by commit.
    #[must_use]
    pub fn from_config(key: Key, config: RendererConfig) -> Self {
        Self::new(
            key,
            config,
            Arc::new(LinearVolumeKernel::default()),
            Arc::new(PhongShader),
        )
    }

    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Samples extracted so far by the Sampler variant on this rank.
    #[must_use]
    pub fn take_samples(&self) -> Vec<SampleHit> {
        std::mem::take(&mut *self.samples.lock())
    }

    pub fn record_received(&self, from: usize, count: usize) {
        let mut stats = self.stats.lock();
        if stats.received_from.len() <= from {
            stats.received_from.resize(from + 1, 0);
        }
        stats.received_from[from] += count as u64;
    }

    pub fn record_originated(&self, count: usize) {
        self.stats.lock().originated += count as u64;
    }

    fn record_sent(&self, to: usize, count: usize) {
        let mut stats = self.stats.lock();
        if stats.sent_to.len() <= to {
            stats.sent_to.resize(to + 1, 0);
        }
        stats.sent_to[to] += count as u64;
    }

    #[must_use]
    pub fn stats(&self) -> RenderStats {
        self.stats.lock().clone()
    }

    /// Write this rank's traffic counters next to the image outputs.
    pub fn dump_stats(&self, basename: &str, rank: usize) -> Result<()> {
        let stats = self.stats.lock();
        let mut out = format!("rank {rank}\noriginated {}\n", stats.originated);
        for (to, n) in stats.sent_to.iter().enumerate() {
            out.push_str(&format!("sent_to {to} {n}\n"));
        }
        for (from, n) in stats.received_from.iter().enumerate() {
            out.push_str(&format!("received_from {from} {n}\n"));
        }
        std::fs::write(format!("{basename}_rank{rank}.stats"), out)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // The pipeline
    // ------------------------------------------------------------------

    /// One full pass over a dequeued list. Consumes the list; always
    /// retires its count against the owning set.
    pub fn process_rays(&self, mut list: RayList, ctx: &RenderContext<'_>) {
        let set = match ctx.registry.rendering_set(list.set_key()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("rank {}: dropping ray list: {e}", ctx.rank);
                return;
            }
        };

        if set.should_discard(list.frame()) {
            set.list_retired(ctx.link);
            return;
        }

        let looked_up = (|| {
            let rendering = ctx.registry.rendering(list.rendering_key())?;
            let vis = ctx
                .registry
                .visualization(rendering.meta().visualization_key)?;
            let camera = ctx.registry.camera(rendering.meta().camera_key)?;
            Ok::<_, crate::errors::NebulaError>((rendering, vis, camera))
        })();
        let (rendering, vis, camera) = match looked_up {
            Ok(v) => v,
            Err(e) => {
                log::warn!("rank {}: dropping ray list: {e}", ctx.rank);
                set.list_retired(ctx.link);
                return;
            }
        };

        let basis = camera.basis();
        let lights = vis
            .lighting
            .resolve(basis.eye, basis.right, basis.up, basis.dir);

        let tctx = TraceContext {
            vis: &vis,
            lights: &lights,
            local_box: ctx.partition.local_box(),
            global_box: ctx.partition.global_box(),
            epsilon: self.config.epsilon,
            step_limit: self.config.step_limit,
        };

        // 1. Trace
        let mut hits = Vec::new();
        self.trace_kernel
            .trace(&tctx, &*self.shade_kernel, &mut list, &mut hits);

        // 2 + 3. Classify, then pin destinations on boundary rays
        classify(&mut list, ctx.partition);

        // 4..6. Route the results
        self.finish_list(&list, &hits, &lights, &basis, &set, &rendering, ctx);

        set.list_retired(ctx.link);
    }

    /// Steps 4-6: pixels for terminated rays, migration for boundary
    /// rays, re-issue for translucent-surface rays, and secondary spawn.
    fn finish_list(
        &self,
        list: &RayList,
        hits: &[SurfaceHit],
        lights: &ResolvedLighting,
        basis: &CameraBasis,
        set: &Arc<RenderingSet>,
        rendering: &Arc<Rendering>,
        ctx: &RenderContext<'_>,
    ) {
        let frame = list.frame();
        if set.should_discard(frame) {
            // Reset arrived mid-trace; everything this pass produced is void
            return;
        }

        let mut terminated: Vec<usize> = Vec::new();
        let mut keep_here: Vec<usize> = Vec::new();
        let mut by_dest: FxHashMap<usize, Vec<usize>> = FxHashMap::default();

        for i in 0..list.len() {
            match list.classification(i) {
                Classification::Terminated => terminated.push(i),
                Classification::KeepHere => keep_here.push(i),
                Classification::Send(dest) => by_dest.entry(dest).or_default().push(i),
                Classification::DropOnFloor | Classification::Undetermined => {}
                Classification::Boundary => {
                    // AssignDestinations resolves every boundary ray
                    log::warn!("rank {}: unrouted boundary ray survived", ctx.rank);
                }
            }
        }

        // 4. Terminated rays become contributions (variant semantics)
        let pixels: Vec<Pixel> = match self.config.kind {
            RendererKind::Raycast => terminated
                .iter()
                .map(|&i| {
                    let (x, y) = list.pixel(i);
                    let c = list.color(i);
                    Pixel { x, y, r: c[0], g: c[1], b: c[2], o: c[3] }
                })
                .collect(),
            RendererKind::Sampler => {
                sampler::extract_samples(list, &terminated, &mut self.samples.lock());
                Vec::new()
            }
            RendererKind::Schlieren => schlieren::deflection_pixels(list, &terminated, basis),
        };

        if !pixels.is_empty() {
            if rendering.is_local(ctx.rank) {
                if let Err(e) = rendering.add_local_pixels(&pixels, frame) {
                    log::warn!("rank {}: {e}", ctx.rank);
                }
            } else if set.try_count_pixels_sent(pixels.len(), frame, ctx.link) {
                let owner = rendering.meta().owner;
                let payload = pack_pixels(rendering.key(), set.key(), frame, ctx.rank, &pixels);
                if let Err(e) = ctx
                    .link
                    .group
                    .send(owner, &Frame::new(MessageClass::SendPixels, payload))
                {
                    log::error!("rank {}: pixel send to {owner} failed: {e}", ctx.rank);
                }
            }
        }

        // 5. Forward boundary rays to their face neighbors
        let migration_eps = ctx.partition.epsilon();
        for (dest, indices) in by_dest {
            for chunk in indices.chunks(self.config.max_rays_per_list) {
                let mut out = RayList::new(
                    list.renderer_key(),
                    list.set_key(),
                    list.rendering_key(),
                    chunk.len(),
                    frame,
                    list.kind(),
                );
                for (dst_idx, &src_idx) in chunk.iter().enumerate() {
                    out.copy_ray_from(dst_idx, list, src_idx);
                    // Step just across the face so the neighbor owns the
                    // restart point
                    out.set_t(dst_idx, list.t(src_idx) + migration_eps);
                    out.set_term(dst_idx, TermFlags::empty());
                    out.set_classification(dst_idx, Classification::Undetermined);
                }
                self.record_sent(dest, out.len());
                set.list_sent(ctx.link);
                let frame_msg = Frame::new(MessageClass::SendRays, out.to_wire());
                if let Err(e) = ctx.link.group.send(dest, &frame_msg) {
                    log::error!("rank {}: ray migration to {dest} failed: {e}", ctx.rank);
                }
            }
        }

        // Translucent-surface rays restart just past the surface
        if !keep_here.is_empty() {
            let mut out = RayList::new(
                list.renderer_key(),
                list.set_key(),
                list.rendering_key(),
                keep_here.len(),
                frame,
                list.kind(),
            );
            for (dst_idx, &src_idx) in keep_here.iter().enumerate() {
                out.copy_ray_from(dst_idx, list, src_idx);
                let advanced = list.t(src_idx) + self.config.epsilon;
                let origin = list.origin(src_idx) + list.dir(src_idx) * advanced;
                out.set_origin(dst_idx, origin);
                out.set_t(dst_idx, 0.0);
                let t_max = list.t_max(src_idx);
                if t_max != f32::MAX {
                    out.set_t_max(dst_idx, (t_max - advanced).max(0.0));
                }
                out.set_term(dst_idx, TermFlags::empty());
                out.set_classification(dst_idx, Classification::Undetermined);
            }
            set.enqueue(out, false, ctx.link);
        }

        // 6. Secondaries from primary surface hits
        if self.config.kind == RendererKind::Raycast {
            self.spawn_secondaries(list, hits, lights, set, ctx);
        }
    }

    /// Build the shadow and ambient-occlusion rays requested by this
    /// pass's surface hits and queue them locally.
    fn spawn_secondaries(
        &self,
        list: &RayList,
        hits: &[SurfaceHit],
        lights: &ResolvedLighting,
        set: &Arc<RenderingSet>,
        ctx: &RenderContext<'_>,
    ) {
        let shadow_count = if lights.shadows { lights.lights.len() } else { 0 };
        let ao_count = lights.ao_count as usize;
        if shadow_count + ao_count == 0 || hits.is_empty() {
            return;
        }

        struct Spawn {
            pixel: (i32, i32),
            origin: Vec3,
            dir: Vec3,
            t_max: f32,
            color: [f32; 3],
            ray_type: RayType,
        }

        let mut spawns: Vec<Spawn> = Vec::new();
        for hit in hits {
            if list.ray_type(hit.index) != RayType::Primary {
                continue;
            }
            // A hit on a surface straddling a partition face lost to the
            // face; the neighbor will light it after the migration
            if !matches!(
                list.classification(hit.index),
                Classification::Terminated | Classification::KeepHere
            ) {
                continue;
            }
            let pixel = list.pixel(hit.index);
            let origin = hit.position + hit.normal * self.config.epsilon;
            let surface = hit.color;

            // One shadow ray per light, carrying the diffuse term it
            // unlocks when it reaches the light unoccluded
            for light in lights.lights.iter().take(shadow_count) {
                let (dir, dist) = light.toward(origin);
                let lambert = hit.normal.dot(dir).max(0.0);
                if lambert <= 0.0 {
                    continue;
                }
                let k = lights.kd * lambert;
                spawns.push(Spawn {
                    pixel,
                    origin,
                    dir,
                    t_max: dist,
                    color: [surface[0] * k, surface[1] * k, surface[2] * k],
                    ray_type: RayType::Shadow,
                });
            }

            // AO rays split the ambient term; survivors add it back
            for _ in 0..ao_count {
                let dir = hemisphere_dir(hit.normal);
                let k = lights.ka / ao_count as f32;
                spawns.push(Spawn {
                    pixel,
                    origin,
                    dir,
                    t_max: lights.ao_radius,
                    color: [surface[0] * k, surface[1] * k, surface[2] * k],
                    ray_type: RayType::Ao,
                });
            }
        }

        if spawns.is_empty() {
            return;
        }

        for chunk in spawns.chunks(self.config.max_rays_per_list) {
            let mut out = RayList::new(
                list.renderer_key(),
                list.set_key(),
                list.rendering_key(),
                chunk.len(),
                list.frame(),
                RayListKind::Secondary,
            );
            for (i, s) in chunk.iter().enumerate() {
                out.set_pixel(i, s.pixel.0, s.pixel.1);
                out.set_origin(i, s.origin);
                out.set_dir(i, s.dir);
                out.set_color(i, [s.color[0], s.color[1], s.color[2], 0.0]);
                out.set_surface_color(i, [0.0; 4]);
                out.set_t(i, 0.0);
                out.set_t_max(i, s.t_max);
                out.set_ray_type(i, s.ray_type);
                out.set_term(i, TermFlags::empty());
                out.set_classification(i, Classification::Undetermined);
            }
            set.enqueue(out, false, ctx.link);
        }
    }
}

/// Steps 2 and 3: classify every ray from its termination flags, then
/// resolve each boundary crossing to a destination rank via the exit
/// face. A boundary whose face has no neighbor is an exit from the
/// global box.
pub fn classify(list: &mut RayList, partition: &Partition) {
    // Face lookups repeat heavily within a list
    let neighbors: SmallVec<[Option<usize>; 6]> = partition.neighbors().into_iter().collect();

    for i in 0..list.len() {
        let dir = list.dir(i);
        if !dir.is_finite() || dir.length_squared() == 0.0 {
            list.set_classification(i, Classification::DropOnFloor);
            continue;
        }

        let term = list.term(i);
        let ray_type = list.ray_type(i);

        let class = if term.contains(TermFlags::BOUNDARY) {
            // The partition face wins over any coincident surface
            Classification::Boundary
        } else if term.contains(TermFlags::EXTERNAL_BOUNDARY) {
            Classification::Terminated
        } else if term.contains(TermFlags::TIMEOUT) {
            if ray_type == RayType::Primary {
                Classification::Terminated
            } else {
                Classification::DropOnFloor
            }
        } else if ray_type.is_secondary() {
            if term.contains(TermFlags::SURFACE) {
                // Occluded: the contribution it carried is forfeit
                Classification::DropOnFloor
            } else {
                // Survived to its target; contribution pays out
                Classification::Terminated
            }
        } else if term.contains(TermFlags::SURFACE) {
            if term.contains(TermFlags::OPAQUE) {
                Classification::Terminated
            } else {
                Classification::KeepHere
            }
        } else if term.contains(TermFlags::OPAQUE) {
            Classification::Terminated
        } else {
            Classification::Terminated
        };

        if class == Classification::Boundary {
            let face = partition.exit_face(list.origin(i), dir);
            match neighbors[face] {
                Some(dest) => list.set_classification(i, Classification::Send(dest)),
                None => {
                    list.set_term(i, term | TermFlags::EXTERNAL_BOUNDARY);
                    list.set_classification(i, Classification::Terminated);
                }
            }
        } else {
            list.set_classification(i, class);
        }
    }
}

/// Uniform direction in the hemisphere around `normal`.
fn hemisphere_dir(normal: Vec3) -> Vec3 {
    use rand::RngExt;
    let mut rng = rand::rng();
    loop {
        let v = Vec3::new(
            rng.random_range(-1.0f32..1.0),
            rng.random_range(-1.0f32..1.0),
            rng.random_range(-1.0f32..1.0),
        );
        let len2 = v.length_squared();
        if len2 > 1e-6 && len2 <= 1.0 {
            let d = v / len2.sqrt();
            return if d.dot(normal) < 0.0 { -d } else { d };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Box3;
    use crate::partition::PartitionMeta;

    fn two_rank_partition() -> (Partition, Partition) {
        let meta = PartitionMeta {
            global_box: Box3::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0)),
            n_partitions: 2,
        };
        (Partition::new(&meta, 0), Partition::new(&meta, 1))
    }

    fn list_of(n: usize) -> RayList {
        let mut l = RayList::new(1, 2, 3, n, 1, RayListKind::Primary);
        for i in 0..n {
            l.set_dir(i, Vec3::X);
            l.set_ray_type(i, RayType::Primary);
            l.set_t_max(i, f32::MAX);
        }
        l
    }

    #[test]
    fn boundary_ray_routes_to_neighbor() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(1);
        l.set_origin(0, Vec3::new(-0.5, 0.0, 0.0));
        l.set_term(0, TermFlags::BOUNDARY);
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::Send(1));
    }

    #[test]
    fn boundary_through_external_face_terminates() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(1);
        l.set_origin(0, Vec3::new(-0.5, 0.0, 0.0));
        l.set_dir(0, Vec3::NEG_X);
        l.set_term(0, TermFlags::BOUNDARY);
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::Terminated);
        assert!(l.term(0).contains(TermFlags::EXTERNAL_BOUNDARY));
    }

    #[test]
    fn partition_face_wins_over_surface() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(1);
        l.set_origin(0, Vec3::new(-0.5, 0.0, 0.0));
        l.set_term(0, TermFlags::BOUNDARY | TermFlags::SURFACE);
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::Send(1));
    }

    #[test]
    fn nan_direction_drops_on_floor() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(1);
        l.set_dir(0, Vec3::new(f32::NAN, 0.0, 0.0));
        l.set_term(0, TermFlags::BOUNDARY);
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::DropOnFloor);
    }

    #[test]
    fn secondary_outcomes() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(3);
        for i in 0..3 {
            l.set_ray_type(i, RayType::Shadow);
            l.set_origin(i, Vec3::new(-0.5, 0.0, 0.0));
        }
        l.set_term(0, TermFlags::SURFACE); // occluded
        l.set_term(1, TermFlags::empty()); // reached the light
        l.set_term(2, TermFlags::TIMEOUT); // budget blown
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::DropOnFloor);
        assert_eq!(l.classification(1), Classification::Terminated);
        assert_eq!(l.classification(2), Classification::DropOnFloor);
    }

    #[test]
    fn translucent_surface_keeps_ray_here() {
        let (p0, _) = two_rank_partition();
        let mut l = list_of(2);
        l.set_origin(0, Vec3::new(-0.5, 0.0, 0.0));
        l.set_origin(1, Vec3::new(-0.5, 0.0, 0.0));
        l.set_term(0, TermFlags::SURFACE);
        l.set_term(1, TermFlags::SURFACE | TermFlags::OPAQUE);
        classify(&mut l, &p0);
        assert_eq!(l.classification(0), Classification::KeepHere);
        assert_eq!(l.classification(1), Classification::Terminated);
    }
}
