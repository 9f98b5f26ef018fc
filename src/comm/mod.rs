//! Peer-to-peer messaging substrate.
//!
//! Every inter-rank interaction rides on framed messages: a 4-byte class
//! tag, a 4-byte length, and a payload. [`PeerGroup`] provides
//! point-to-point sends, fan-out and collective broadcasts, and a group
//! barrier on top of a [`Transport`]. The bundled [`ChannelTransport`]
//! wires a whole peer group inside one process, one receive thread per
//! rank.

mod group;
mod message;
mod transport;

pub use group::{GroupComm, MessageDelegate, PeerGroup};
pub use message::{
    AckRaysPayload, DropPayload, Frame, MessageClass, NewDistributedPayload, Pixel,
    PixelMsgHeader, PropagateStatePayload, RenderPayload, ResetPayload, SaveImagesRequest,
    StatisticsRequest, SyncCheckPayload, pack_pixels, unpack_pixels,
};
pub use transport::{ChannelTransport, CollPacket, Transport};
