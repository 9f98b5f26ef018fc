//! Rendering sets and distributed termination detection.
//!
//! A rendering set is the unit of frame completion. Each rank keeps a
//! small counter block for the set; every state-changing event (list
//! enqueued or finished, list sent or acknowledged, pixels sent or
//! received, camera tile started or finished) recomputes a busy bit.
//! Busy edges propagate eagerly up a binary tree rooted at rank 0; when
//! the root's bit falls idle it triggers a synchronous collective sweep
//! that pauses the ray queues, sum-reduces the counters, and declares
//! the frame done only when every residual is zero. The eager phase can
//! report busy spuriously, never idle spuriously.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::comm::{
    Frame, GroupComm, MessageClass, PeerGroup, PropagateStatePayload, SyncCheckPayload,
};
use crate::errors::Result;
use crate::exec::ThreadPool;
use crate::rays::{RayList, RayQueue};
use crate::registry::Key;
use crate::rendering::Rendering;

/// Replicated metadata of a rendering set; the wire form of its commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderingSetMeta {
    pub rendering_keys: Vec<Key>,
}

/// The substrate handles the detector needs to move state around:
/// the peer group for sends, the pool to launch the synchronous sweep
/// off the receive thread, and the ray queue it pauses.
pub struct DetectorLink {
    pub group: Arc<PeerGroup>,
    pub pool: Arc<ThreadPool>,
    pub queue: Arc<RayQueue>,
}

/// Snapshot of the per-rank counter block, for drain assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCounters {
    pub raylists: i64,
    pub inflight: i64,
    pub pixels_sent: i64,
    pub pixels_received: i64,
    pub active_cameras: i64,
}

struct SetState {
    current_frame: i32,
    next_frame: i32,
    /// Work tagged with frames below this is abandoned (set by reset).
    discard_before_frame: i32,

    active_camera_count: i64,
    local_raylist_count: i64,
    local_inflight_count: i64,
    n_pix_sent: i64,
    n_pix_received: i64,
    spawned_ray_count: i64,

    /// Acks, trace completions, and camera-tile completions swallowed
    /// after a reset.
    absorb_acks: i64,
    absorb_list_decrements: i64,
    absorb_camera_decrements: i64,

    left_busy: bool,
    right_busy: bool,
    currently_busy: bool,
    last_reported_busy: bool,
    done: bool,
}

enum EdgeAction {
    /// Non-root rank whose busy bit flipped: tell the parent.
    Report(bool),
    /// Root went idle: kick off the synchronous sweep.
    RootIdle,
}

/// The set of renderings produced by one render call, plus this rank's
/// termination-detection state.
pub struct RenderingSet {
    key: Key,
    renderings: Vec<Arc<Rendering>>,
    rank: usize,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    state: Mutex<SetState>,
    done_cv: Condvar,
}

impl RenderingSet {
    #[must_use]
    pub fn new(key: Key, renderings: Vec<Arc<Rendering>>, rank: usize, size: usize) -> Self {
        let left = (2 * rank + 1 < size).then_some(2 * rank + 1);
        let right = (2 * rank + 2 < size).then_some(2 * rank + 2);
        let parent = (rank > 0).then_some((rank - 1) / 2);

        Self {
            key,
            renderings,
            rank,
            left,
            right,
            parent,
            state: Mutex::new(SetState {
                current_frame: 0,
                next_frame: 0,
                discard_before_frame: 0,
                active_camera_count: 0,
                local_raylist_count: 0,
                local_inflight_count: 0,
                n_pix_sent: 0,
                n_pix_received: 0,
                spawned_ray_count: 0,
                absorb_acks: 0,
                absorb_list_decrements: 0,
                absorb_camera_decrements: 0,
                left_busy: false,
                right_busy: false,
                currently_busy: false,
                last_reported_busy: false,
                done: false,
            }),
            done_cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn renderings(&self) -> &[Arc<Rendering>] {
        &self.renderings
    }

    /// Tree neighbors of this rank: (parent, left, right).
    #[must_use]
    pub fn tree_info(&self) -> (Option<usize>, Option<usize>, Option<usize>) {
        (self.parent, self.left, self.right)
    }

    // ------------------------------------------------------------------
    // Frame bookkeeping
    // ------------------------------------------------------------------

    /// Arm the set for a new frame. Runs inside the Render collective
    /// before any rays exist, so the tree starts from all-busy and
    /// cannot report a false idle while cameras are still spawning.
    pub fn begin_frame(&self, frame: i32) {
        let mut s = self.state.lock();
        s.next_frame = frame;
        s.done = false;
        s.currently_busy = true;
        s.last_reported_busy = true;
        s.left_busy = self.left.is_some();
        s.right_busy = self.right.is_some();
    }

    /// The frame to generate initial rays for, or `None` when a later
    /// frame's rays have already been seen here.
    #[must_use]
    pub fn need_initial_rays(&self) -> Option<i32> {
        let mut s = self.state.lock();
        if s.next_frame > s.current_frame {
            s.current_frame = s.next_frame;
            Some(s.current_frame)
        } else {
            None
        }
    }

    /// Whether `frame` is the active frame. Seeing a later frame
    /// advances the set, retiring spawn work still queued for earlier
    /// ones.
    #[must_use]
    pub fn is_active(&self, frame: i32) -> bool {
        let mut s = self.state.lock();
        if frame > s.current_frame {
            s.current_frame = frame;
        }
        frame == s.current_frame
    }

    #[must_use]
    pub fn current_frame(&self) -> i32 {
        self.state.lock().current_frame
    }

    /// Whether work tagged with `frame` was invalidated by a reset.
    #[must_use]
    pub fn should_discard(&self, frame: i32) -> bool {
        frame < self.state.lock().discard_before_frame
    }

    // ------------------------------------------------------------------
    // Counter events
    // ------------------------------------------------------------------

    /// Queue a ray list for tracing on this rank. Returns `false` when
    /// the list was invalidated by a reset and dropped. `silent` skips
    /// the eager propagation, used during initial camera spawning where
    /// the camera count already pins this rank busy.
    pub fn enqueue(&self, list: RayList, silent: bool, link: &DetectorLink) -> bool {
        {
            let mut s = self.state.lock();
            if list.frame() < s.discard_before_frame {
                return false;
            }
            if list.frame() > s.current_frame {
                s.current_frame = list.frame();
            }
            s.local_raylist_count += 1;
        }
        link.queue.enqueue(list);
        if !silent {
            self.after_event(link);
        }
        true
    }

    /// A trace task finished consuming a list.
    pub fn list_retired(&self, link: &DetectorLink) {
        {
            let mut s = self.state.lock();
            if s.absorb_list_decrements > 0 {
                s.absorb_list_decrements -= 1;
                return;
            }
            s.local_raylist_count -= 1;
            debug_assert!(s.local_raylist_count >= 0);
        }
        self.after_event(link);
    }

    /// A list was handed to the fabric bound for another rank.
    pub fn list_sent(&self, link: &DetectorLink) {
        self.state.lock().local_inflight_count += 1;
        self.after_event(link);
    }

    /// The destination acknowledged a migrated list.
    pub fn ack_received(&self, link: &DetectorLink) {
        {
            let mut s = self.state.lock();
            if s.absorb_acks > 0 {
                s.absorb_acks -= 1;
                return;
            }
            s.local_inflight_count -= 1;
            debug_assert!(s.local_inflight_count >= 0);
        }
        self.after_event(link);
    }

    /// Count pixels about to leave for the owner. Refuses (and the
    /// caller must not send) when `frame` was invalidated by a reset:
    /// the check and the count are atomic so a reset can never zero a
    /// counter between them and strand the group unbalanced.
    #[must_use]
    pub fn try_count_pixels_sent(&self, count: usize, frame: i32, link: &DetectorLink) -> bool {
        {
            let mut s = self.state.lock();
            if frame < s.discard_before_frame {
                return false;
            }
            s.n_pix_sent += count as i64;
        }
        self.after_event(link);
        true
    }

    /// Count pixels arriving from a peer. Refuses (and the caller must
    /// not accumulate) when `frame` was invalidated by a reset; the
    /// matching send was zeroed by the same reset.
    #[must_use]
    pub fn try_count_pixels_received(&self, count: usize, frame: i32, link: &DetectorLink) -> bool {
        {
            let mut s = self.state.lock();
            if frame < s.discard_before_frame {
                return false;
            }
            s.n_pix_received += count as i64;
        }
        self.after_event(link);
        true
    }

    /// A camera spawn tile was scheduled.
    pub fn camera_started(&self) {
        self.state.lock().active_camera_count += 1;
    }

    /// A camera spawn tile finished, having emitted `spawned` rays.
    pub fn camera_finished(&self, spawned: usize, link: &DetectorLink) {
        {
            let mut s = self.state.lock();
            if s.absorb_camera_decrements > 0 {
                s.absorb_camera_decrements -= 1;
                return;
            }
            s.active_camera_count -= 1;
            s.spawned_ray_count += spawned as i64;
        }
        self.after_event(link);
    }

    #[must_use]
    pub fn spawned_ray_count(&self) -> i64 {
        self.state.lock().spawned_ray_count
    }

    /// A child in the reduction tree reported a busy edge.
    pub fn update_child_state(&self, child: usize, busy: bool, link: &DetectorLink) {
        {
            let mut s = self.state.lock();
            if Some(child) == self.left {
                s.left_busy = busy;
            } else if Some(child) == self.right {
                s.right_busy = busy;
            } else {
                log::warn!(
                    "rank {}: busy report from {child}, which is not a tree child",
                    self.rank
                );
                return;
            }
        }
        self.after_event(link);
    }

    /// Current counter snapshot.
    #[must_use]
    pub fn counters(&self) -> SetCounters {
        let s = self.state.lock();
        SetCounters {
            raylists: s.local_raylist_count,
            inflight: s.local_inflight_count,
            pixels_sent: s.n_pix_sent,
            pixels_received: s.n_pix_received,
            active_cameras: s.active_camera_count,
        }
    }

    // ------------------------------------------------------------------
    // Eager propagation
    // ------------------------------------------------------------------

    /// Local busy bit. Pixel balance is deliberately absent: sent and
    /// received land on different ranks, so a per-rank comparison would
    /// pin the sender busy forever. In-flight pixels are instead caught
    /// by the group-wide residual in the synchronous sweep, which
    /// re-arms itself until they land.
    fn busy_of(&self, s: &SetState) -> bool {
        s.active_camera_count > 0
            || s.local_raylist_count > 0
            || s.local_inflight_count > 0
            || s.left_busy
            || s.right_busy
    }

    /// Recompute the busy bit and act on an edge. Never holds the state
    /// lock across a send.
    pub fn after_event(&self, link: &DetectorLink) {
        let action = {
            let mut s = self.state.lock();
            let busy = self.busy_of(&s);
            s.currently_busy = busy;
            if busy == s.last_reported_busy {
                None
            } else {
                s.last_reported_busy = busy;
                if self.rank == 0 {
                    (!busy).then_some(EdgeAction::RootIdle)
                } else {
                    Some(EdgeAction::Report(busy))
                }
            }
        };

        match action {
            None => {}
            Some(EdgeAction::Report(busy)) => {
                let parent = self.parent.expect("non-root has a parent");
                let payload = PropagateStatePayload {
                    set_key: self.key,
                    busy: i32::from(busy),
                    _pad: 0,
                };
                let frame = Frame::new(
                    MessageClass::PropagateState,
                    bytemuck::bytes_of(&payload).to_vec(),
                );
                if let Err(e) = link.group.send(parent, &frame) {
                    log::error!("rank {}: busy report to {parent} failed: {e}", self.rank);
                }
            }
            Some(EdgeAction::RootIdle) => self.schedule_global_check(link, false),
        }
    }

    /// The root looks idle; verify with the collective sweep. Runs on
    /// the pool so the caller (often the receive thread) never blocks in
    /// a collective it must itself serve. `paced` adds a short delay,
    /// used when re-arming after a sweep that found residual traffic.
    fn schedule_global_check(&self, link: &DetectorLink, paced: bool) {
        let group = link.group.clone();
        let payload = SyncCheckPayload { set_key: self.key };
        link.pool.add_task(move || {
            if paced {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            let frame = Frame::new(
                MessageClass::SynchronousCheck,
                bytemuck::bytes_of(&payload).to_vec(),
            );
            match group.broadcast_collective(&frame) {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("synchronous check broadcast failed: {e}");
                    -1
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Synchronous verification
    // ------------------------------------------------------------------

    /// Body of the `SynchronousCheck` collective. Pauses the queue,
    /// re-reads the counters, and sum-reduces the residuals; zero
    /// everywhere means the frame is provably drained. A non-zero
    /// residual is not an error: the set simply stays in the eager
    /// phase.
    pub fn run_synchronous_check(&self, comm: &GroupComm<'_>, link: &DetectorLink) -> Result<()> {
        link.queue.pause();

        // Active cameras ride along so a sweep scheduled before a new
        // frame cannot declare that frame done while its spawn tiles
        // are still computing and nothing is queued yet
        let locals = {
            let s = self.state.lock();
            [
                s.local_raylist_count,
                s.local_inflight_count,
                s.active_camera_count,
                s.n_pix_sent - s.n_pix_received,
            ]
        };
        let sums = comm.reduce_sum(&locals)?;

        if sums.iter().all(|&v| v == 0) {
            self.finalize();
        } else {
            log::debug!(
                "set {}: residual after sweep: lists {} inflight {} cameras {} pixels {}",
                self.key,
                sums[0],
                sums[1],
                sums[2],
                sums[3]
            );
            // Pixels still in flight leave no counter edge behind to
            // re-trigger the root, so the root re-arms the sweep itself
            if self.rank == 0 && sums[0] == 0 && sums[1] == 0 && sums[2] == 0 {
                self.schedule_global_check(link, true);
            }
        }

        link.queue.resume();
        Ok(())
    }

    fn finalize(&self) {
        let mut s = self.state.lock();
        s.done = true;
        s.currently_busy = false;
        s.last_reported_busy = false;
        self.done_cv.notify_all();
    }

    /// Block until the frame is declared done by the synchronous check.
    pub fn wait_for_done(&self) {
        let mut s = self.state.lock();
        while !s.done {
            self.done_cv.wait(&mut s);
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Local body of the `Reset` collective: drop queued lists, zero the
    /// counters, absorb whatever acknowledgments and trace completions
    /// are still in flight, and clear the frame buffers.
    pub fn local_reset(&self, link: &DetectorLink) {
        let dropped = link.queue.discard_set(self.key) as i64;
        {
            let mut s = self.state.lock();
            // Lists being traced right now will still retire later
            s.absorb_list_decrements += (s.local_raylist_count - dropped).max(0);
            s.absorb_acks += s.local_inflight_count;
            s.absorb_camera_decrements += s.active_camera_count;
            s.local_raylist_count = 0;
            s.local_inflight_count = 0;
            s.n_pix_sent = 0;
            s.n_pix_received = 0;
            s.active_camera_count = 0;
            s.spawned_ray_count = 0;
            s.discard_before_frame = s.current_frame + 1;
            s.done = false;
            s.currently_busy = false;
            s.last_reported_busy = false;
            s.left_busy = false;
            s.right_busy = false;
        }
        for r in &self.renderings {
            r.clear();
        }
    }
}
