//! The ray list: a struct-of-arrays batch of rays over one contiguous
//! backing buffer.
//!
//! Layout is a fixed 64-byte header followed by 20 f32 lanes and 5 i32
//! lanes. Every lane is padded to a multiple of 16 entries so a
//! vectorized kernel can process full gangs without tail handling. The
//! whole thing lives in a single allocation, which is also the wire form
//! used when a list migrates to a neighbor rank.

use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::errors::{NebulaError, Result};
use crate::registry::Key;

/// Default cap on rays per list; lists above this are split before they
/// are queued or sent.
pub const MAX_RAYS_PER_LIST: usize = 1_000_000;

const HEADER_BYTES: usize = 64;
const FLOAT_LANES: usize = 20;
const INT_LANES: usize = 5;
const LANES: usize = FLOAT_LANES + INT_LANES;

static NEXT_LIST_ID: AtomicI32 = AtomicI32::new(1);

bitflags! {
    /// Per-ray termination flags written by the trace kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TermFlags: i32 {
        /// The ray hit a surface.
        const SURFACE = 0x01;
        /// The accumulated opacity saturated, or the surface hit is opaque.
        const OPAQUE = 0x02;
        /// The ray crossed a face of the local sub-box.
        const BOUNDARY = 0x04;
        /// The ray exceeded its step budget.
        const TIMEOUT = 0x08;
        /// The crossed face lies on the outside of the global box.
        const EXTERNAL_BOUNDARY = 0x10;
    }
}

/// Per-ray kind stored in the `ray_type` lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RayType {
    Primary = 0x1,
    Shadow = 0x2,
    Ao = 0x4,
    Empty = 0x8,
}

impl RayType {
    #[must_use]
    pub fn from_i32(v: i32) -> Self {
        match v {
            0x1 => RayType::Primary,
            0x2 => RayType::Shadow,
            0x4 => RayType::Ao,
            _ => RayType::Empty,
        }
    }

    /// Whether this ray was spawned from a primary hit.
    #[must_use]
    pub fn is_secondary(self) -> bool {
        matches!(self, RayType::Shadow | RayType::Ao)
    }
}

/// List-level kind, used for queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RayListKind {
    Primary = 0,
    Secondary = 1,
}

impl RayListKind {
    #[must_use]
    pub fn from_i32(v: i32) -> Self {
        if v == 0 {
            RayListKind::Primary
        } else {
            RayListKind::Secondary
        }
    }
}

/// Result of the classification pass, stored in the classification lane.
///
/// Non-negative values are destination ranks assigned to boundary rays;
/// the named states are small negative codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Undetermined,
    Terminated,
    DropOnFloor,
    KeepHere,
    Boundary,
    Send(usize),
}

impl Classification {
    #[must_use]
    pub fn to_i32(self) -> i32 {
        match self {
            Classification::Undetermined => -1,
            Classification::Terminated => -2,
            Classification::DropOnFloor => -3,
            Classification::KeepHere => -4,
            Classification::Boundary => -5,
            Classification::Send(rank) => rank as i32,
        }
    }

    #[must_use]
    pub fn from_i32(v: i32) -> Self {
        match v {
            -2 => Classification::Terminated,
            -3 => Classification::DropOnFloor,
            -4 => Classification::KeepHere,
            -5 => Classification::Boundary,
            v if v >= 0 => Classification::Send(v as usize),
            _ => Classification::Undetermined,
        }
    }
}

/// Fixed 64-byte header at the front of the backing buffer. This is the
/// exact wire header of `SendRaysMsg`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RayListHeader {
    pub renderer_key: Key,
    pub rendering_key: Key,
    pub set_key: Key,
    pub frame: i32,
    pub kind: i32,
    pub size: i32,
    pub aligned_size: i32,
    pub id: i32,
    pub _pad: [i32; 5],
}

// Float lane order within the buffer.
const L_OX: usize = 0;
const L_OY: usize = 1;
const L_OZ: usize = 2;
const L_DX: usize = 3;
const L_DY: usize = 4;
const L_DZ: usize = 5;
const L_NX: usize = 6;
const L_NY: usize = 7;
const L_NZ: usize = 8;
const L_SAMPLE: usize = 9;
const L_R: usize = 10;
const L_G: usize = 11;
const L_B: usize = 12;
const L_O: usize = 13;
const L_SR: usize = 14;
const L_SG: usize = 15;
const L_SB: usize = 16;
const L_SO: usize = 17;
const L_T: usize = 18;
const L_TMAX: usize = 19;

// Int lane order, counted after the float lanes.
const L_PX: usize = 0;
const L_PY: usize = 1;
const L_TYPE: usize = 2;
const L_TERM: usize = 3;
const L_CLASS: usize = 4;

/// A batch of rays over one contiguous, 8-byte-aligned backing buffer.
pub struct RayList {
    buf: Vec<u64>,
}

/// Mutable struct-of-arrays view handed to trace kernels.
pub struct LanesMut<'a> {
    pub ox: &'a mut [f32],
    pub oy: &'a mut [f32],
    pub oz: &'a mut [f32],
    pub dx: &'a mut [f32],
    pub dy: &'a mut [f32],
    pub dz: &'a mut [f32],
    pub nx: &'a mut [f32],
    pub ny: &'a mut [f32],
    pub nz: &'a mut [f32],
    pub sample: &'a mut [f32],
    pub r: &'a mut [f32],
    pub g: &'a mut [f32],
    pub b: &'a mut [f32],
    pub o: &'a mut [f32],
    pub sr: &'a mut [f32],
    pub sg: &'a mut [f32],
    pub sb: &'a mut [f32],
    pub so: &'a mut [f32],
    pub t: &'a mut [f32],
    pub t_max: &'a mut [f32],
    pub px: &'a mut [i32],
    pub py: &'a mut [i32],
    pub ray_type: &'a mut [i32],
    pub term: &'a mut [i32],
    pub class: &'a mut [i32],
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}

fn buffer_words(aligned: usize) -> usize {
    // 64-byte header + 25 lanes of 4-byte entries; aligned is a multiple
    // of 16 so the byte count divides evenly by 8.
    (HEADER_BYTES + aligned * LANES * 4) / 8
}

impl RayList {
    /// Allocate a list of `nrays` rays, lanes zeroed.
    #[must_use]
    pub fn new(
        renderer_key: Key,
        set_key: Key,
        rendering_key: Key,
        nrays: usize,
        frame: i32,
        kind: RayListKind,
    ) -> Self {
        let aligned = align16(nrays.max(1));
        let buf = vec![0u64; buffer_words(aligned)];
        let mut list = Self { buf };
        *list.header_mut() = RayListHeader {
            renderer_key,
            rendering_key,
            set_key,
            frame,
            kind: kind as i32,
            size: nrays as i32,
            aligned_size: aligned as i32,
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            _pad: [0; 5],
        };
        list
    }

    #[must_use]
    pub fn header(&self) -> &RayListHeader {
        bytemuck::from_bytes(&bytemuck::cast_slice::<u64, u8>(&self.buf)[..HEADER_BYTES])
    }

    fn header_mut(&mut self) -> &mut RayListHeader {
        bytemuck::from_bytes_mut(
            &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.buf)[..HEADER_BYTES],
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.header().size as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn aligned_size(&self) -> usize {
        self.header().aligned_size as usize
    }

    #[must_use]
    pub fn frame(&self) -> i32 {
        self.header().frame
    }

    #[must_use]
    pub fn kind(&self) -> RayListKind {
        RayListKind::from_i32(self.header().kind)
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.header().id
    }

    #[must_use]
    pub fn renderer_key(&self) -> Key {
        self.header().renderer_key
    }

    #[must_use]
    pub fn rendering_key(&self) -> Key {
        self.header().rendering_key
    }

    #[must_use]
    pub fn set_key(&self) -> Key {
        self.header().set_key
    }

    pub fn set_kind(&mut self, kind: RayListKind) {
        self.header_mut().kind = kind as i32;
    }

    // ------------------------------------------------------------------
    // Lane access
    // ------------------------------------------------------------------

    fn floats(&self) -> &[f32] {
        bytemuck::cast_slice(&self.buf)
    }

    fn floats_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.buf)
    }

    fn ints(&self) -> &[i32] {
        bytemuck::cast_slice(&self.buf)
    }

    fn ints_mut(&mut self) -> &mut [i32] {
        bytemuck::cast_slice_mut(&mut self.buf)
    }

    fn flane_start(&self, lane: usize) -> usize {
        HEADER_BYTES / 4 + lane * self.aligned_size()
    }

    fn ilane_start(&self, lane: usize) -> usize {
        HEADER_BYTES / 4 + (FLOAT_LANES + lane) * self.aligned_size()
    }

    fn f(&self, lane: usize, i: usize) -> f32 {
        self.floats()[self.flane_start(lane) + i]
    }

    fn set_f(&mut self, lane: usize, i: usize, v: f32) {
        let at = self.flane_start(lane) + i;
        self.floats_mut()[at] = v;
    }

    fn int(&self, lane: usize, i: usize) -> i32 {
        self.ints()[self.ilane_start(lane) + i]
    }

    fn set_int(&mut self, lane: usize, i: usize, v: i32) {
        let at = self.ilane_start(lane) + i;
        self.ints_mut()[at] = v;
    }

    /// Chop the backing buffer into one mutable slice per lane.
    pub fn lanes_mut(&mut self) -> LanesMut<'_> {
        let aligned = self.aligned_size();
        let floats = bytemuck::cast_slice_mut::<u64, f32>(&mut self.buf);
        let (_, rest) = floats.split_at_mut(HEADER_BYTES / 4);
        let (fpart, ipart) = rest.split_at_mut(FLOAT_LANES * aligned);

        let mut fiter = fpart.chunks_exact_mut(aligned);
        let mut next_f = || fiter.next().expect("float lane");

        let ints = bytemuck::cast_slice_mut::<f32, i32>(ipart);
        let mut iiter = ints.chunks_exact_mut(aligned);
        let mut next_i = || iiter.next().expect("int lane");

        LanesMut {
            ox: next_f(),
            oy: next_f(),
            oz: next_f(),
            dx: next_f(),
            dy: next_f(),
            dz: next_f(),
            nx: next_f(),
            ny: next_f(),
            nz: next_f(),
            sample: next_f(),
            r: next_f(),
            g: next_f(),
            b: next_f(),
            o: next_f(),
            sr: next_f(),
            sg: next_f(),
            sb: next_f(),
            so: next_f(),
            t: next_f(),
            t_max: next_f(),
            px: next_i(),
            py: next_i(),
            ray_type: next_i(),
            term: next_i(),
            class: next_i(),
        }
    }

    // ------------------------------------------------------------------
    // Per-ray convenience accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn origin(&self, i: usize) -> Vec3 {
        Vec3::new(self.f(L_OX, i), self.f(L_OY, i), self.f(L_OZ, i))
    }

    pub fn set_origin(&mut self, i: usize, v: Vec3) {
        self.set_f(L_OX, i, v.x);
        self.set_f(L_OY, i, v.y);
        self.set_f(L_OZ, i, v.z);
    }

    #[must_use]
    pub fn dir(&self, i: usize) -> Vec3 {
        Vec3::new(self.f(L_DX, i), self.f(L_DY, i), self.f(L_DZ, i))
    }

    pub fn set_dir(&mut self, i: usize, v: Vec3) {
        self.set_f(L_DX, i, v.x);
        self.set_f(L_DY, i, v.y);
        self.set_f(L_DZ, i, v.z);
    }

    #[must_use]
    pub fn normal(&self, i: usize) -> Vec3 {
        Vec3::new(self.f(L_NX, i), self.f(L_NY, i), self.f(L_NZ, i))
    }

    pub fn set_normal(&mut self, i: usize, v: Vec3) {
        self.set_f(L_NX, i, v.x);
        self.set_f(L_NY, i, v.y);
        self.set_f(L_NZ, i, v.z);
    }

    #[must_use]
    pub fn sample(&self, i: usize) -> f32 {
        self.f(L_SAMPLE, i)
    }

    pub fn set_sample(&mut self, i: usize, v: f32) {
        self.set_f(L_SAMPLE, i, v);
    }

    /// Accumulated color and opacity `(r, g, b, o)`.
    #[must_use]
    pub fn color(&self, i: usize) -> [f32; 4] {
        [self.f(L_R, i), self.f(L_G, i), self.f(L_B, i), self.f(L_O, i)]
    }

    pub fn set_color(&mut self, i: usize, c: [f32; 4]) {
        self.set_f(L_R, i, c[0]);
        self.set_f(L_G, i, c[1]);
        self.set_f(L_B, i, c[2]);
        self.set_f(L_O, i, c[3]);
    }

    /// Color and opacity of the last translucent surface encountered.
    #[must_use]
    pub fn surface_color(&self, i: usize) -> [f32; 4] {
        [
            self.f(L_SR, i),
            self.f(L_SG, i),
            self.f(L_SB, i),
            self.f(L_SO, i),
        ]
    }

    pub fn set_surface_color(&mut self, i: usize, c: [f32; 4]) {
        self.set_f(L_SR, i, c[0]);
        self.set_f(L_SG, i, c[1]);
        self.set_f(L_SB, i, c[2]);
        self.set_f(L_SO, i, c[3]);
    }

    #[must_use]
    pub fn t(&self, i: usize) -> f32 {
        self.f(L_T, i)
    }

    pub fn set_t(&mut self, i: usize, v: f32) {
        self.set_f(L_T, i, v);
    }

    #[must_use]
    pub fn t_max(&self, i: usize) -> f32 {
        self.f(L_TMAX, i)
    }

    pub fn set_t_max(&mut self, i: usize, v: f32) {
        self.set_f(L_TMAX, i, v);
    }

    /// Target pixel `(x, y)`.
    #[must_use]
    pub fn pixel(&self, i: usize) -> (i32, i32) {
        (self.int(L_PX, i), self.int(L_PY, i))
    }

    pub fn set_pixel(&mut self, i: usize, x: i32, y: i32) {
        self.set_int(L_PX, i, x);
        self.set_int(L_PY, i, y);
    }

    #[must_use]
    pub fn ray_type(&self, i: usize) -> RayType {
        RayType::from_i32(self.int(L_TYPE, i))
    }

    pub fn set_ray_type(&mut self, i: usize, t: RayType) {
        self.set_int(L_TYPE, i, t as i32);
    }

    #[must_use]
    pub fn term(&self, i: usize) -> TermFlags {
        TermFlags::from_bits_truncate(self.int(L_TERM, i))
    }

    pub fn set_term(&mut self, i: usize, t: TermFlags) {
        self.set_int(L_TERM, i, t.bits());
    }

    #[must_use]
    pub fn classification(&self, i: usize) -> Classification {
        Classification::from_i32(self.int(L_CLASS, i))
    }

    pub fn set_classification(&mut self, i: usize, c: Classification) {
        self.set_int(L_CLASS, i, c.to_i32());
    }

    /// Deep-copy ray `src_idx` of `src` into ray `dst_idx` of `self`.
    pub fn copy_ray_from(&mut self, dst_idx: usize, src: &RayList, src_idx: usize) {
        for lane in 0..FLOAT_LANES {
            let v = src.f(lane, src_idx);
            self.set_f(lane, dst_idx, v);
        }
        for lane in 0..INT_LANES {
            let v = src.int(lane, src_idx);
            self.set_int(lane, dst_idx, v);
        }
    }

    // ------------------------------------------------------------------
    // Shape changes
    // ------------------------------------------------------------------

    /// Shrink the list to its first `n` rays by allocating a fresh buffer
    /// and copying. Growing is done by building additional lists, never
    /// in place.
    pub fn truncate(&mut self, n: usize) {
        if n >= self.len() {
            return;
        }
        let hdr = *self.header();
        let mut out = RayList::new(
            hdr.renderer_key,
            hdr.set_key,
            hdr.rendering_key,
            n,
            hdr.frame,
            RayListKind::from_i32(hdr.kind),
        );
        for i in 0..n {
            out.copy_ray_from(i, self, i);
        }
        self.buf = out.buf;
    }

    /// Slice this list into lists of at most `rmax` rays. The last list
    /// carries the remainder.
    #[must_use]
    pub fn split(self, rmax: usize) -> Vec<RayList> {
        if self.len() <= rmax {
            return vec![self];
        }
        let hdr = *self.header();
        let mut out = Vec::new();
        let mut start = 0;
        while start < self.len() {
            let count = rmax.min(self.len() - start);
            let mut sub = RayList::new(
                hdr.renderer_key,
                hdr.set_key,
                hdr.rendering_key,
                count,
                hdr.frame,
                RayListKind::from_i32(hdr.kind),
            );
            for i in 0..count {
                sub.copy_ray_from(i, &self, start + i);
            }
            out.push(sub);
            start += count;
        }
        out
    }

    // ------------------------------------------------------------------
    // Wire form
    // ------------------------------------------------------------------

    /// The wire form: header then the 20 float lanes then the 5 int
    /// lanes, each of `aligned_size` entries.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        bytemuck::cast_slice::<u64, u8>(&self.buf).to_vec()
    }

    /// Rebuild a list from its wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(NebulaError::Protocol(format!(
                "ray list frame too short: {} bytes",
                bytes.len()
            )));
        }
        let hdr: RayListHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_BYTES]);
        let aligned = hdr.aligned_size as usize;
        if hdr.aligned_size <= 0
            || aligned % 16 != 0
            || hdr.size < 0
            || hdr.size as usize > aligned
        {
            return Err(NebulaError::Protocol(format!(
                "bad ray list header: size {} aligned {}",
                hdr.size, hdr.aligned_size
            )));
        }
        let expect = HEADER_BYTES + aligned * LANES * 4;
        if bytes.len() != expect {
            return Err(NebulaError::Protocol(format!(
                "ray list frame length {} does not match header ({expect})",
                bytes.len()
            )));
        }
        let mut buf = vec![0u64; buffer_words(aligned)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut buf).copy_from_slice(bytes);
        Ok(Self { buf })
    }
}

impl std::fmt::Debug for RayList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        f.debug_struct("RayList")
            .field("id", &h.id)
            .field("frame", &h.frame)
            .field("kind", &self.kind())
            .field("size", &h.size)
            .field("set", &h.set_key)
            .finish_non_exhaustive()
    }
}
