//! Renderings and rendering sets.
//!
//! A [`Rendering`] is one image for one camera x visualization pair,
//! owned by exactly one rank; its buffer exists only there, and every
//! other rank routes contributions to it. A [`RenderingSet`] groups the
//! renderings of one render call and carries the distributed
//! termination-detection state.

mod ager;
mod buffer;
mod set;

pub use ager::Ager;
pub use buffer::FrameBuffer;
pub use set::{DetectorLink, RenderingSet, RenderingSetMeta, SetCounters};

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::comm::Pixel;
use crate::errors::{NebulaError, Result};
use crate::registry::Key;

/// Replicated metadata of a rendering; the wire form of its commit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderingMeta {
    pub owner: usize,
    pub width: usize,
    pub height: usize,
    pub camera_key: Key,
    pub visualization_key: Key,
    pub datasets_key: Key,
}

/// One image target. The frame buffer is allocated only on the owner.
pub struct Rendering {
    key: Key,
    meta: RenderingMeta,
    fb: Mutex<Option<FrameBuffer>>,
    ager: Mutex<Option<Ager>>,
}

impl Rendering {
    #[must_use]
    pub fn new(key: Key, meta: RenderingMeta) -> Self {
        Self {
            key,
            meta,
            fb: Mutex::new(None),
            ager: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn meta(&self) -> &RenderingMeta {
        &self.meta
    }

    #[must_use]
    pub fn is_local(&self, rank: usize) -> bool {
        self.meta.owner == rank
    }

    /// Allocate the buffer if this rank is the owner. Called at commit.
    pub fn allocate(&self, rank: usize) {
        if self.is_local(rank) {
            let mut fb = self.fb.lock();
            if fb.is_none() {
                *fb = Some(FrameBuffer::new(self.meta.width, self.meta.height));
            }
        }
    }

    /// Accumulate contributions. Only valid on the owner.
    pub fn add_local_pixels(&self, pixels: &[Pixel], frame: i32) -> Result<()> {
        let mut fb = self.fb.lock();
        let fb = fb.as_mut().ok_or_else(|| {
            NebulaError::Protocol(format!(
                "pixels for rendering {} arrived at a non-owner",
                self.key
            ))
        })?;
        fb.add_pixels(pixels, frame);
        Ok(())
    }

    /// Run `f` against the buffer if this rank owns one.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> Option<R> {
        self.fb.lock().as_ref().map(f)
    }

    /// Mutable variant of [`Self::with_buffer`].
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut FrameBuffer) -> R) -> Option<R> {
        self.fb.lock().as_mut().map(f)
    }

    /// Zero the accumulation state (owner only; no-op elsewhere).
    pub fn clear(&self) {
        if let Some(fb) = self.fb.lock().as_mut() {
            fb.clear();
        }
    }

    /// Start the interactive-mode ageing task on the owner.
    pub fn start_ager(self: &std::sync::Arc<Self>, max_age: Duration, fadeout: Duration) {
        if self.fb.lock().is_none() {
            return;
        }
        let mut ager = self.ager.lock();
        if ager.is_none() {
            *ager = Some(Ager::start(self.clone(), max_age, fadeout));
        }
    }

    /// Stop the ageing task if one is running.
    pub fn stop_ager(&self) {
        self.ager.lock().take();
    }
}
