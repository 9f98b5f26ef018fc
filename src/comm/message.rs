//! Message classes, frame encoding, and the fixed payload layouts.
//!
//! The wire surface between peers is the set of classes below, framed as
//! `(4-byte class tag, 4-byte length, payload)` on a reliable byte
//! stream. Payloads with fixed layout are `#[repr(C)]` Pod structs cast
//! directly; variable payloads (commits, image requests) are JSON.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::errors::{NebulaError, Result};
use crate::registry::Key;

/// Closed set of peer message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageClass {
    /// Replicate a newly created or updated keyed object. Collective.
    Commit = 1,
    /// Placeholder creation on non-primary ranks.
    NewDistributed = 2,
    /// Remove the replicas of a keyed object. Collective.
    Drop = 3,
    /// Start a frame. Collective.
    Render = 4,
    /// Migrate a ray list to a face neighbor.
    SendRays = 5,
    /// Acknowledge receipt of a migrated ray list.
    AckRays = 6,
    /// Route pixel contributions to the rendering owner.
    SendPixels = 7,
    /// Busy-edge report from a child to its parent in the reduction tree.
    PropagateState = 8,
    /// Quiescence verification sweep. Collective.
    SynchronousCheck = 9,
    /// Abandon all in-flight work for a rendering set. Collective.
    Reset = 10,
    /// Each rank writes its rendering statistics. Collective.
    Statistics = 11,
    /// Owner ranks write their frame buffers to disk. Collective.
    SaveImages = 12,
    /// Group barrier marker. Collective, no payload.
    Barrier = 13,
    /// Substrate-internal: a rank finished a collective action.
    CollectiveDone = 14,
    /// Substrate-internal: stop this rank's receive thread.
    Quit = 15,
}

impl MessageClass {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Commit,
            2 => Self::NewDistributed,
            3 => Self::Drop,
            4 => Self::Render,
            5 => Self::SendRays,
            6 => Self::AckRays,
            7 => Self::SendPixels,
            8 => Self::PropagateState,
            9 => Self::SynchronousCheck,
            10 => Self::Reset,
            11 => Self::Statistics,
            12 => Self::SaveImages,
            13 => Self::Barrier,
            14 => Self::CollectiveDone,
            15 => Self::Quit,
            _ => return None,
        })
    }

    /// Whether recipients run this class under the group communicator,
    /// with the sender blocked until every rank has finished.
    #[must_use]
    pub fn is_collective(self) -> bool {
        matches!(
            self,
            Self::Commit
                | Self::Drop
                | Self::Render
                | Self::SynchronousCheck
                | Self::Reset
                | Self::Statistics
                | Self::SaveImages
                | Self::Barrier
        )
    }
}

/// One framed message. `source` is assigned by the transport on
/// delivery; it is not part of the frame bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub class: MessageClass,
    pub source: usize,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(class: MessageClass, payload: Vec<u8>) -> Self {
        Self {
            class,
            source: 0,
            payload,
        }
    }

    /// Encode as `(tag, len, payload)`, little-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.extend_from_slice(&(self.class as u32).to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one frame. The length field must match the buffer exactly.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(NebulaError::Protocol(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        let tag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let class = MessageClass::from_u32(tag)
            .ok_or_else(|| NebulaError::Protocol(format!("unknown message class {tag}")))?;
        if bytes.len() != 8 + len {
            return Err(NebulaError::Protocol(format!(
                "frame length mismatch: header says {len}, got {}",
                bytes.len() - 8
            )));
        }
        Ok(Self {
            class,
            source: 0,
            payload: bytes[8..].to_vec(),
        })
    }

    /// Read the payload as one Pod struct. Copies; payload bytes carry
    /// no alignment guarantee.
    pub fn payload_as<T: Pod>(&self) -> Result<T> {
        if self.payload.len() != size_of::<T>() {
            return Err(NebulaError::Protocol(format!(
                "bad {:?} payload: {} bytes, expected {}",
                self.class,
                self.payload.len(),
                size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&self.payload))
    }

    /// Parse a JSON payload.
    pub fn payload_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ============================================================================
// Fixed payload layouts
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderPayload {
    pub set_key: Key,
    pub frame: i32,
    pub _pad: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AckRaysPayload {
    pub set_key: Key,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PropagateStatePayload {
    pub set_key: Key,
    /// 0 = idle, 1 = busy.
    pub busy: i32,
    pub _pad: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SyncCheckPayload {
    pub set_key: Key,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ResetPayload {
    pub set_key: Key,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DropPayload {
    pub key: Key,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct NewDistributedPayload {
    pub key: Key,
    pub class_tag: u32,
    pub _pad: u32,
}

/// One pixel contribution on the wire and in the accumulation path.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Pixel {
    pub x: i32,
    pub y: i32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub o: f32,
}

/// Header of `SendPixels`, followed by `count` [`Pixel`] records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PixelMsgHeader {
    pub rendering_key: Key,
    pub set_key: Key,
    pub frame: i32,
    pub source: i32,
    pub count: i32,
    pub _pad: i32,
}

/// Build a `SendPixels` payload.
#[must_use]
pub fn pack_pixels(
    rendering_key: Key,
    set_key: Key,
    frame: i32,
    source: usize,
    pixels: &[Pixel],
) -> Vec<u8> {
    let hdr = PixelMsgHeader {
        rendering_key,
        set_key,
        frame,
        source: source as i32,
        count: pixels.len() as i32,
        _pad: 0,
    };
    let mut out = Vec::with_capacity(size_of::<PixelMsgHeader>() + size_of_val(pixels));
    out.extend_from_slice(bytemuck::bytes_of(&hdr));
    out.extend_from_slice(bytemuck::cast_slice(pixels));
    out
}

/// Split a `SendPixels` payload into its header and pixel records.
/// Copies out of the unaligned payload bytes.
pub fn unpack_pixels(payload: &[u8]) -> Result<(PixelMsgHeader, Vec<Pixel>)> {
    let hdr_len = size_of::<PixelMsgHeader>();
    if payload.len() < hdr_len {
        return Err(NebulaError::Protocol("pixel message too short".into()));
    }
    let hdr: PixelMsgHeader = bytemuck::pod_read_unaligned(&payload[..hdr_len]);
    let body = &payload[hdr_len..];
    if hdr.count < 0 || body.len() != hdr.count as usize * size_of::<Pixel>() {
        return Err(NebulaError::Protocol(format!(
            "pixel message body {} bytes does not hold {} pixels",
            body.len(),
            hdr.count
        )));
    }
    let pixels = body
        .chunks_exact(size_of::<Pixel>())
        .map(bytemuck::pod_read_unaligned)
        .collect();
    Ok((hdr, pixels))
}

// ============================================================================
// JSON payloads
// ============================================================================

/// `Statistics` collective: each rank writes its own statistics file
/// derived from `basename`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsRequest {
    pub renderer_key: Key,
    pub basename: String,
}

/// `SaveImages` collective: owner ranks write their frame buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveImagesRequest {
    pub set_key: Key,
    pub basename: String,
    pub as_float: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let f = Frame::new(MessageClass::AckRays, bytemuck::bytes_of(&AckRaysPayload { set_key: 9 }).to_vec());
        let bytes = f.encode();
        let back = Frame::decode(&bytes).unwrap();
        assert_eq!(back.class, MessageClass::AckRays);
        assert_eq!(back.payload_as::<AckRaysPayload>().unwrap().set_key, 9);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Frame::decode(&[1, 2, 3]).is_err());
        let mut bytes = Frame::new(MessageClass::Drop, vec![0; 8]).encode();
        bytes.truncate(12);
        assert!(Frame::decode(&bytes).is_err());
        // unknown class tag
        let bad = [0xFFu8, 0, 0, 0, 0, 0, 0, 0];
        assert!(Frame::decode(&bad).is_err());
    }

    #[test]
    fn pixels_round_trip() {
        let pix = vec![
            Pixel { x: 1, y: 2, r: 0.5, g: 0.25, b: 0.125, o: 1.0 },
            Pixel { x: 3, y: 4, r: 0.0, g: 1.0, b: 0.0, o: 0.5 },
        ];
        let payload = pack_pixels(7, 8, 3, 2, &pix);
        let (hdr, body) = unpack_pixels(&payload).unwrap();
        assert_eq!(hdr.rendering_key, 7);
        assert_eq!(hdr.set_key, 8);
        assert_eq!(hdr.frame, 3);
        assert_eq!(hdr.source, 2);
        assert_eq!(body, pix);
    }

    #[test]
    fn collective_classes() {
        assert!(MessageClass::Render.is_collective());
        assert!(MessageClass::SynchronousCheck.is_collective());
        assert!(!MessageClass::SendRays.is_collective());
        assert!(!MessageClass::PropagateState.is_collective());
    }
}
