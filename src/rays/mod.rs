//! Ray batches and their per-process queue.
//!
//! A [`RayList`] is the unit of work and of migration: a struct-of-arrays
//! batch of rays sharing one frame and one rendering set. The
//! [`RayQueue`] holds lists awaiting trace on this rank.

mod list;
mod queue;

pub use list::{
    Classification, LanesMut, MAX_RAYS_PER_LIST, RayList, RayListHeader, RayListKind, RayType,
    TermFlags,
};
pub use queue::{RayQueue, RayQueueManager};
