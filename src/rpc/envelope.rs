//! RPC envelope and framing
//!
//! Every frame on the pipe is a 4-byte big-endian length followed by a
//! protobuf-encoded [`RpcEnvelope`]. The [`Framer`] accumulates bytes
//! and yields complete payloads; truncated input is simply "not yet a
//! frame", never an error.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;

use crate::rpc::RpcError;

/// Maximum accepted frame payload. Larger length prefixes are treated
/// as a protocol violation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Wire status of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcStatus {
    Success = 0,
    Failed = 1,
    NotFound = 2,
}

/// Version information exchanged in the first frame.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VersionInfo {
    #[prost(uint32, tag = "1")]
    pub vmajor: u32,
    #[prost(uint32, tag = "2")]
    pub vminor: u32,
}

/// The tagged request/response envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcEnvelope {
    #[prost(uint32, tag = "1")]
    pub tag: u32,
    #[prost(uint32, tag = "2")]
    pub msgtype: u32,
    #[prost(bool, tag = "3")]
    pub isresponse: bool,
    #[prost(enumeration = "RpcStatus", tag = "4")]
    pub status: i32,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub payload: Option<Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub errordescription: Option<String>,
    #[prost(message, optional, tag = "7")]
    pub versioninfo: Option<VersionInfo>,
}

impl RpcEnvelope {
    pub fn status_decoded(&self) -> RpcStatus {
        RpcStatus::try_from(self.status).unwrap_or(RpcStatus::Failed)
    }

    /// Serialize with the length prefix prepended.
    pub fn to_frame(&self) -> Vec<u8> {
        let body = self.encode_to_vec();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, RpcError> {
        RpcEnvelope::decode(body).map_err(RpcError::Decode)
    }
}

/// Incremental length-prefix decoder.
///
/// Feed arbitrary chunks with [`Framer::extend`]; [`Framer::next_frame`]
/// returns the next complete payload or `None` while more data is
/// wanted.
#[derive(Default)]
pub struct Framer {
    buffer: BytesMut,
    /// Parsed length of the frame currently being assembled.
    want: Option<usize>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame payload, if any.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, RpcError> {
        if self.want.is_none() {
            if self.buffer.len() < 4 {
                return Ok(None);
            }
            let mut header = [0u8; 4];
            header.copy_from_slice(&self.buffer[..4]);
            let length = u32::from_be_bytes(header);
            if length > MAX_FRAME_SIZE {
                return Err(RpcError::FrameTooLarge(length));
            }
            self.buffer.advance(4);
            self.want = Some(length as usize);
        }

        let want = self.want.unwrap_or(0);
        if self.buffer.len() < want {
            return Ok(None);
        }
        self.want = None;
        Ok(Some(self.buffer.split_to(want).freeze()))
    }

    /// Drop any partially assembled frame (transport reset).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.want = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(tag: u32) -> RpcEnvelope {
        RpcEnvelope {
            tag,
            msgtype: 104,
            isresponse: false,
            status: RpcStatus::Success as i32,
            payload: Some(vec![1, 2, 3]),
            errordescription: None,
            versioninfo: None,
        }
    }

    #[test]
    fn frame_round_trip() {
        let env = envelope(7);
        let frame = env.to_frame();

        let mut framer = Framer::new();
        framer.extend(&frame);
        let body = framer.next_frame().unwrap().expect("complete frame");
        assert_eq!(RpcEnvelope::decode_body(&body).unwrap(), env);
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn truncated_input_wants_more_data() {
        let frame = envelope(1).to_frame();
        let mut framer = Framer::new();

        let (head, tail) = frame.split_at(frame.len() - 1);
        for chunk in head.chunks(3) {
            framer.extend(chunk);
            assert!(framer.next_frame().unwrap().is_none());
        }
        framer.extend(tail);
        assert!(framer.next_frame().unwrap().is_some());
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut bytes = envelope(1).to_frame();
        bytes.extend_from_slice(&envelope(2).to_frame());

        let mut framer = Framer::new();
        framer.extend(&bytes);
        let first = framer.next_frame().unwrap().unwrap();
        let second = framer.next_frame().unwrap().unwrap();
        assert_eq!(RpcEnvelope::decode_body(&first).unwrap().tag, 1);
        assert_eq!(RpcEnvelope::decode_body(&second).unwrap().tag, 2);
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn zero_length_payload_is_legal() {
        let mut framer = Framer::new();
        framer.extend(&0u32.to_be_bytes());
        let body = framer.next_frame().unwrap().expect("empty frame");
        assert!(body.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut framer = Framer::new();
        framer.extend(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(framer.next_frame().is_err());
    }
}
