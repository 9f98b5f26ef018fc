//! Sampler variant: terminated-ray handling that extracts geometry
//! instead of color.
//!
//! Where the raycast renderer turns a terminated ray into a pixel
//! contribution, the sampler keeps the hit itself: the world-space
//! position where the ray found a surface, plus the data value sampled
//! there. Samples stay on the rank that found them; no pixels travel.

use glam::Vec3;

use crate::rays::{RayList, TermFlags};

/// One extracted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleHit {
    pub position: Vec3,
    pub value: f32,
    /// The pixel whose ray produced this sample.
    pub pixel: (i32, i32),
}

/// Pull samples out of the terminated rays of a list. Only rays that
/// actually found a surface sample; rays retired at the global boundary
/// or by timeout found nothing.
pub(crate) fn extract_samples(list: &RayList, terminated: &[usize], out: &mut Vec<SampleHit>) {
    for &i in terminated {
        if !list.term(i).contains(TermFlags::SURFACE) {
            continue;
        }
        out.push(SampleHit {
            position: list.origin(i) + list.dir(i) * list.t(i),
            value: list.sample(i),
            pixel: list.pixel(i),
        });
    }
}
