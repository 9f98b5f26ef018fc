//! The per-rank engine: message dispatch, object commits, and the
//! render drivers.
//!
//! One [`Engine`] is a rank's whole runtime: the peer group and its
//! receive thread, the worker pool, the ray queue and its manager
//! thread, the object registry, and the committed renderer/partition.
//! The driver program runs on rank 0 and steers the group through
//! collective commits and render calls; every other rank just serves
//! messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::camera::{Camera, SpawnArgs, generate_initial_rays};
use crate::comm::{
    AckRaysPayload, ChannelTransport, Frame, GroupComm, MessageClass, MessageDelegate,
    NewDistributedPayload, PeerGroup, PropagateStatePayload, RenderPayload, ResetPayload,
    SaveImagesRequest, StatisticsRequest, SyncCheckPayload, Transport, unpack_pixels,
};
use crate::datasets::Datasets;
use crate::errors::{NebulaError, Result};
use crate::exec::ThreadPool;
use crate::image_writer;
use crate::partition::{Partition, PartitionMeta};
use crate::rays::{RayList, RayQueue, RayQueueManager};
use crate::registry::{CommitBody, CommitEnvelope, Key, Registry, SharedObject};
use crate::renderer::{RenderContext, Renderer, RendererConfig};
use crate::rendering::{DetectorLink, Rendering, RenderingMeta, RenderingSet, RenderingSetMeta};
use crate::vis::Visualization;

/// Shared state of one rank.
pub struct EngineCore {
    rank: usize,
    size: usize,
    registry: Registry,
    link: Arc<DetectorLink>,
    partition: RwLock<Option<Arc<Partition>>>,
    renderer: RwLock<Option<Arc<Renderer>>>,
    frame_counter: AtomicI32,
}

/// One rank of the engine. Dropping without [`Engine::shutdown`] leaks
/// the service threads; the driver owns the lifecycle.
pub struct Engine {
    core: Arc<EngineCore>,
    recv_thread: Option<std::thread::JoinHandle<()>>,
    queue_manager: RayQueueManager,
}

impl Engine {
    /// Build a whole in-process peer group of `n` ranks, each with
    /// `workers` trace threads.
    #[must_use]
    pub fn create_group(n: usize, workers: usize) -> Vec<Engine> {
        ChannelTransport::group(n)
            .into_iter()
            .map(|t| Engine::start(Arc::new(t), workers))
            .collect()
    }

    /// Bring up one rank on an established transport.
    pub fn start(transport: Arc<dyn Transport>, workers: usize) -> Engine {
        let rank = transport.rank();
        let size = transport.size();
        let group = PeerGroup::new(transport);
        let link = Arc::new(DetectorLink {
            group: group.clone(),
            pool: Arc::new(ThreadPool::new(workers, &format!("trace-{rank}"))),
            queue: Arc::new(RayQueue::new()),
        });

        let core = Arc::new(EngineCore {
            rank,
            size,
            registry: Registry::new(rank),
            link: link.clone(),
            partition: RwLock::new(None),
            renderer: RwLock::new(None),
            frame_counter: AtomicI32::new(0),
        });

        let recv_thread = group.start(core.clone());

        let mgr_core = core.clone();
        let queue_manager = RayQueueManager::start(link.queue.clone(), move |list| {
            let core = mgr_core.clone();
            let pool = core.link.pool.clone();
            pool.add_task(move || {
                core.trace_list(list);
                0
            });
        });

        Engine {
            core,
            recv_thread: Some(recv_thread),
            queue_manager,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.core.rank
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.core.size
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    #[must_use]
    pub fn renderer(&self) -> Option<Arc<Renderer>> {
        self.core.renderer.read().clone()
    }

    #[must_use]
    pub fn partition(&self) -> Option<Arc<Partition>> {
        self.core.partition.read().clone()
    }

    // ------------------------------------------------------------------
    // Driver-side object management (rank 0)
    // ------------------------------------------------------------------

    /// Commit an object to every rank. Allocates a key when `key` is
    /// `None`; returns the key the object lives under.
    pub fn commit(&self, key: Option<Key>, body: CommitBody) -> Result<Key> {
        let key = key.unwrap_or_else(|| self.core.registry.allocate_key());
        let env = CommitEnvelope { key, body };
        let payload = serde_json::to_vec(&env)?;
        self.core
            .link
            .group
            .broadcast_collective(&Frame::new(MessageClass::Commit, payload))?;
        Ok(key)
    }

    pub fn commit_camera(&self, camera: Camera) -> Result<Key> {
        self.commit(None, CommitBody::Camera(camera))
    }

    pub fn commit_visualization(&self, vis: Visualization) -> Result<Key> {
        self.commit(None, CommitBody::Visualization(vis))
    }

    pub fn commit_datasets(&self, datasets: Datasets) -> Result<Key> {
        self.commit(None, CommitBody::Datasets(datasets))
    }

    pub fn commit_partition(&self, meta: PartitionMeta) -> Result<Key> {
        self.commit(None, CommitBody::Partition(meta))
    }

    pub fn commit_renderer(&self, config: RendererConfig) -> Result<Key> {
        self.commit(None, CommitBody::Renderer(config))
    }

    pub fn commit_rendering(&self, meta: RenderingMeta) -> Result<Key> {
        self.commit(None, CommitBody::Rendering(meta))
    }

    pub fn commit_rendering_set(&self, rendering_keys: Vec<Key>) -> Result<Key> {
        self.commit(
            None,
            CommitBody::RenderingSet(RenderingSetMeta { rendering_keys }),
        )
    }

    /// Swap this rank's kernels, keeping the committed renderer config.
    /// Kernels are local installations; every rank installs its own.
    pub fn install_kernels(
        &self,
        trace: Arc<dyn crate::renderer::TraceKernel>,
        shade: Arc<dyn crate::renderer::ShadeKernel>,
    ) -> Result<()> {
        let mut slot = self.core.renderer.write();
        let current = slot
            .clone()
            .ok_or_else(|| NebulaError::Config("no renderer committed".into()))?;
        let renderer = Arc::new(Renderer::new(current.key(), *current.config(), trace, shade));
        let primary = self.core.registry.is_primary(current.key());
        self.core.registry.insert(
            current.key(),
            SharedObject::Renderer(renderer.clone()),
            primary,
        );
        *slot = Some(renderer);
        Ok(())
    }

    /// Remove an object's replicas everywhere.
    pub fn drop_object(&self, key: Key) -> Result<()> {
        let payload = bytemuck::bytes_of(&crate::comm::DropPayload { key }).to_vec();
        self.core
            .link
            .group
            .broadcast_collective(&Frame::new(MessageClass::Drop, payload))
    }

    // ------------------------------------------------------------------
    // Rendering drivers (rank 0)
    // ------------------------------------------------------------------

    /// Start a frame on every rank. Returns the frame number issued.
    pub fn render(&self, set_key: Key) -> Result<i32> {
        let frame = self.core.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = RenderPayload {
            set_key,
            frame,
            _pad: 0,
        };
        self.core.link.group.broadcast_collective(&Frame::new(
            MessageClass::Render,
            bytemuck::bytes_of(&payload).to_vec(),
        ))?;
        Ok(frame)
    }

    /// Block until the set's termination detector declares the frame
    /// done.
    pub fn wait_for_done(&self, set_key: Key) -> Result<()> {
        let set = self.core.registry.rendering_set(set_key)?;
        set.wait_for_done();
        Ok(())
    }

    /// Abandon all in-flight work for the set on every rank.
    pub fn reset(&self, set_key: Key) -> Result<()> {
        let payload = ResetPayload { set_key };
        self.core.link.group.broadcast_collective(&Frame::new(
            MessageClass::Reset,
            bytemuck::bytes_of(&payload).to_vec(),
        ))
    }

    /// Have each owner rank write its frame buffers to disk.
    pub fn save_images(&self, set_key: Key, basename: &str, as_float: bool) -> Result<()> {
        let req = SaveImagesRequest {
            set_key,
            basename: basename.to_string(),
            as_float,
        };
        self.core
            .link
            .group
            .broadcast_collective(&Frame::new(MessageClass::SaveImages, serde_json::to_vec(&req)?))
    }

    /// Have each rank write its ray-traffic statistics.
    pub fn dump_statistics(&self, basename: &str) -> Result<()> {
        let renderer = self
            .renderer()
            .ok_or_else(|| NebulaError::Config("no renderer committed".into()))?;
        let req = StatisticsRequest {
            renderer_key: renderer.key(),
            basename: basename.to_string(),
        };
        self.core
            .link
            .group
            .broadcast_collective(&Frame::new(MessageClass::Statistics, serde_json::to_vec(&req)?))
    }

    /// Group barrier; every rank must call this.
    pub fn barrier(&self) -> Result<()> {
        self.core.link.group.barrier()
    }

    /// Start interactive-mode ageing on a locally owned rendering.
    pub fn start_ager(&self, rendering_key: Key, max_age: Duration, fadeout: Duration) -> Result<()> {
        let rendering = self.core.registry.rendering(rendering_key)?;
        rendering.start_ager(max_age, fadeout);
        Ok(())
    }

    /// Stop this rank: drain the ray queue, stop the manager and
    /// receive threads, and release the pool.
    pub fn shutdown(mut self) {
        self.core.link.queue.shutdown();
        self.queue_manager.join();
        let _ = self.core.link.group.quit_local();
        if let Some(t) = self.recv_thread.take() {
            let _ = t.join();
        }
    }
}

impl EngineCore {
    /// Trace-task body: run the full pipeline over one dequeued list.
    fn trace_list(&self, list: RayList) {
        let renderer = self.renderer.read().clone();
        let partition = self.partition.read().clone();
        let (Some(renderer), Some(partition)) = (renderer, partition) else {
            log::warn!(
                "rank {}: ray list arrived before renderer/partition commit",
                self.rank
            );
            if let Ok(set) = self.registry.rendering_set(list.set_key()) {
                set.list_retired(&self.link);
            }
            return;
        };

        let ctx = RenderContext {
            registry: &self.registry,
            partition: &partition,
            link: &self.link,
            rank: self.rank,
            size: self.size,
        };
        renderer.process_rays(list, &ctx);
    }

    /// Body of the Render collective: arm the set, then spawn camera
    /// rays for every rendering whose sub-box projection is non-empty.
    fn local_render(&self, set: &Arc<RenderingSet>, frame: i32) -> Result<()> {
        set.begin_frame(frame);

        if let Some(frame) = set.need_initial_rays() {
            let renderer = self
                .renderer
                .read()
                .clone()
                .ok_or_else(|| NebulaError::Config("render before renderer commit".into()))?;
            let partition = self
                .partition
                .read()
                .clone()
                .ok_or_else(|| NebulaError::Config("render before partition commit".into()))?;

            for rendering in set.renderings() {
                let camera = self.registry.camera(rendering.meta().camera_key)?;
                let args = Arc::new(SpawnArgs {
                    renderer: renderer.clone(),
                    set: set.clone(),
                    rendering: rendering.clone(),
                    camera: (*camera).clone(),
                    local_box: partition.local_box(),
                    global_box: partition.global_box(),
                    frame,
                    link: self.link.clone(),
                });
                generate_initial_rays(&args);
            }
        }

        // Ranks with nothing to spawn still owe the tree their idle edge
        set.after_event(&self.link);
        Ok(())
    }

    /// Install a committed object, replacing any previous replica.
    fn install(&self, env: CommitEnvelope, source: usize) -> Result<()> {
        let primary = source == self.rank;
        let key = env.key;
        match env.body {
            CommitBody::Camera(c) => {
                self.registry
                    .insert(key, SharedObject::Camera(Arc::new(c)), primary);
            }
            CommitBody::Visualization(v) => {
                self.registry
                    .insert(key, SharedObject::Visualization(Arc::new(v)), primary);
            }
            CommitBody::Datasets(d) => {
                self.registry
                    .insert(key, SharedObject::Datasets(Arc::new(d)), primary);
            }
            CommitBody::Partition(meta) => {
                let partition = Arc::new(Partition::new(&meta, self.rank));
                *self.partition.write() = Some(partition);
                self.registry
                    .insert(key, SharedObject::Partition(meta), primary);
            }
            CommitBody::Rendering(meta) => {
                let rendering = Arc::new(Rendering::new(key, meta));
                rendering.allocate(self.rank);
                self.registry
                    .insert(key, SharedObject::Rendering(rendering), primary);
            }
            CommitBody::RenderingSet(meta) => {
                let renderings = meta
                    .rendering_keys
                    .iter()
                    .map(|k| self.registry.rendering(*k))
                    .collect::<Result<Vec<_>>>()?;
                let set = Arc::new(RenderingSet::new(key, renderings, self.rank, self.size));
                self.registry
                    .insert(key, SharedObject::RenderingSet(set), primary);
            }
            CommitBody::Renderer(config) => {
                let renderer = Arc::new(Renderer::from_config(key, config));
                *self.renderer.write() = Some(renderer.clone());
                self.registry
                    .insert(key, SharedObject::Renderer(renderer), primary);
            }
        }
        Ok(())
    }
}

impl MessageDelegate for EngineCore {
    fn handle(&self, frame: &Frame, group: &Arc<PeerGroup>) -> Result<()> {
        match frame.class {
            MessageClass::SendRays => {
                let list = RayList::from_wire(&frame.payload)?;
                let set_key = list.set_key();

                if let Some(renderer) = self.renderer.read().as_ref() {
                    renderer.record_received(frame.source, list.len());
                }

                let enqueue_result = self
                    .registry
                    .rendering_set(set_key)
                    .map(|set| set.enqueue(list, false, &self.link));

                // The sender's in-flight count drains on the ack whether
                // or not the list survived a reset here
                let ack = AckRaysPayload { set_key };
                group.send(
                    frame.source,
                    &Frame::new(MessageClass::AckRays, bytemuck::bytes_of(&ack).to_vec()),
                )?;

                match enqueue_result {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!("rank {}: discarded migrated list for reset set", self.rank);
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }
            MessageClass::AckRays => {
                let payload: AckRaysPayload = frame.payload_as()?;
                let set = self.registry.rendering_set(payload.set_key)?;
                set.ack_received(&self.link);
                Ok(())
            }
            MessageClass::SendPixels => {
                let (hdr, pixels) = unpack_pixels(&frame.payload)?;
                let set = self.registry.rendering_set(hdr.set_key)?;
                if !set.try_count_pixels_received(pixels.len(), hdr.frame, &self.link) {
                    log::debug!("rank {}: discarded pixels for reset set", self.rank);
                    return Ok(());
                }
                let rendering = self.registry.rendering(hdr.rendering_key)?;
                rendering.add_local_pixels(&pixels, hdr.frame)?;
                Ok(())
            }
            MessageClass::PropagateState => {
                let payload: PropagateStatePayload = frame.payload_as()?;
                let set = self.registry.rendering_set(payload.set_key)?;
                set.update_child_state(frame.source, payload.busy != 0, &self.link);
                Ok(())
            }
            MessageClass::NewDistributed => {
                // Placeholder creation: reserve the key so replica-side
                // allocations never collide; the commit carries content
                let payload: NewDistributedPayload = frame.payload_as()?;
                self.registry.reserve_key(payload.key);
                Ok(())
            }
            other => Err(NebulaError::Protocol(format!(
                "unexpected point-to-point class {other:?}"
            ))),
        }
    }

    fn handle_collective(
        &self,
        frame: &Frame,
        _group: &Arc<PeerGroup>,
        comm: &GroupComm<'_>,
    ) -> Result<()> {
        match frame.class {
            MessageClass::Commit => {
                let env: CommitEnvelope = frame.payload_json()?;
                self.install(env, frame.source)
            }
            MessageClass::Drop => {
                let payload: crate::comm::DropPayload = frame.payload_as()?;
                if let Err(e) = self.registry.remove(payload.key) {
                    log::warn!("rank {}: drop: {e}", self.rank);
                }
                Ok(())
            }
            MessageClass::Render => {
                let payload: RenderPayload = frame.payload_as()?;
                match self.registry.rendering_set(payload.set_key) {
                    Ok(set) => self.local_render(&set, payload.frame),
                    Err(e) => {
                        log::warn!("rank {}: render: {e}", self.rank);
                        Ok(())
                    }
                }
            }
            MessageClass::SynchronousCheck => {
                let payload: SyncCheckPayload = frame.payload_as()?;
                match self.registry.rendering_set(payload.set_key) {
                    Ok(set) => set.run_synchronous_check(comm, &self.link),
                    Err(e) => {
                        log::warn!("rank {}: synchronous check: {e}", self.rank);
                        Ok(())
                    }
                }
            }
            MessageClass::Reset => {
                let payload: ResetPayload = frame.payload_as()?;
                match self.registry.rendering_set(payload.set_key) {
                    Ok(set) => {
                        set.local_reset(&self.link);
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("rank {}: reset: {e}", self.rank);
                        Ok(())
                    }
                }
            }
            MessageClass::Statistics => {
                let req: StatisticsRequest = frame.payload_json()?;
                match self.registry.renderer(req.renderer_key) {
                    Ok(renderer) => renderer.dump_stats(&req.basename, self.rank),
                    Err(e) => {
                        log::warn!("rank {}: statistics: {e}", self.rank);
                        Ok(())
                    }
                }
            }
            MessageClass::SaveImages => {
                let req: SaveImagesRequest = frame.payload_json()?;
                let set = match self.registry.rendering_set(req.set_key) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("rank {}: save images: {e}", self.rank);
                        return Ok(());
                    }
                };
                for (index, rendering) in set.renderings().iter().enumerate() {
                    if !rendering.is_local(self.rank) {
                        continue;
                    }
                    let annotation = self
                        .registry
                        .visualization(rendering.meta().visualization_key)
                        .map(|v| v.annotation.clone())
                        .unwrap_or_default();
                    let base = image_writer::image_basename(&req.basename, index, &annotation);
                    let wrote = rendering.with_buffer(|fb| {
                        if req.as_float {
                            image_writer::write_fits(fb, &base)
                        } else {
                            image_writer::write_png(fb, format!("{base}.png"))
                        }
                    });
                    if let Some(Err(e)) = wrote {
                        log::error!("rank {}: writing {base}: {e}", self.rank);
                    }
                }
                Ok(())
            }
            MessageClass::Barrier => Ok(()),
            other => Err(NebulaError::Protocol(format!(
                "unexpected collective class {other:?}"
            ))),
        }
    }
}
