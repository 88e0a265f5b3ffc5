//! Port frames and routing.
//!
//! A port frame is the envelope an external collaborator uses to hand a
//! tagged byte buffer to the graph:
//!
//! ```text
//! [port_id: u8][timestamp_micros: u64 LE][len: u32 LE][data: len bytes]
//! ```

use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::PortId;
use crate::{Error, Result};

/// Fixed part of a frame before the data.
pub const FRAME_HEADER_LEN: usize = 1 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFrame {
    pub port_id: PortId,
    pub timestamp_micros: u64,
    pub data: Vec<u8>,
}

impl PortFrame {
    /// Frame stamped with the current time.
    pub fn new(port_id: PortId, data: impl Into<Vec<u8>>) -> Self {
        let micros = Utc::now().timestamp_micros().max(0) as u64;
        Self { port_id, timestamp_micros: micros, data: data.into() }
    }

    pub fn with_timestamp(port_id: PortId, timestamp_micros: u64, data: impl Into<Vec<u8>>) -> Self {
        Self { port_id, timestamp_micros, data: data.into() }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp_micros).ok().and_then(DateTime::from_timestamp_micros)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.data.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Error::InvalidFrame(format!("data of {} bytes", self.data.len())))?;
        let mut out = Vec::new();
        out.try_reserve(self.encoded_len())
            .map_err(|e| Error::AllocationFailure(format!("frame buffer: {e}")))?;
        out.put_u8(self.port_id);
        out.put_u64_le(self.timestamp_micros);
        out.put_u32_le(len);
        out.put_slice(&self.data);
        Ok(out)
    }

    /// Decode exactly one frame; trailing bytes are rejected.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < FRAME_HEADER_LEN {
            return Err(Error::InvalidFrame(format!(
                "{} bytes, header needs {FRAME_HEADER_LEN}",
                buf.remaining()
            )));
        }
        let port_id = buf.get_u8();
        let timestamp_micros = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() != len {
            return Err(Error::InvalidFrame(format!(
                "declared {len} data bytes, found {}",
                buf.remaining()
            )));
        }
        Ok(Self { port_id, timestamp_micros, data: buf.to_vec() })
    }
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRoute {
    pub input: PortId,
    pub output: PortId,
}

/// Input port -> output port table. Unrouted ports map to themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortRouting {
    pub routes: Vec<PortRoute>,
}

impl PortRouting {
    pub fn with_route(mut self, input: PortId, output: PortId) -> Self {
        self.routes.retain(|r| r.input != input);
        self.routes.push(PortRoute { input, output });
        self
    }

    pub fn output_for(&self, input: PortId) -> PortId {
        self.routes.iter().find(|r| r.input == input).map_or(input, |r| r.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_layout() {
        let frame = PortFrame::with_timestamp(2, 0x0102, b"hi".to_vec());
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 2);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..9], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[9..13], &2u32.to_le_bytes());
        assert_eq!(&bytes[13..], b"hi");
        assert_eq!(PortFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(matches!(PortFrame::decode(&[1, 2, 3]), Err(Error::InvalidFrame(_))));

        let mut bytes = PortFrame::with_timestamp(1, 0, b"abc".to_vec()).encode().unwrap();
        bytes.pop();
        assert!(matches!(PortFrame::decode(&bytes), Err(Error::InvalidFrame(_))));
        bytes.extend_from_slice(b"cd");
        assert!(matches!(PortFrame::decode(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_new_frame_has_timestamp() {
        let frame = PortFrame::new(1, b"x".to_vec());
        assert!(frame.timestamp().is_some());
    }

    #[test]
    fn test_routing() {
        let routing = PortRouting::default().with_route(1, 4).with_route(1, 5);
        assert_eq!(routing.output_for(1), 5);
        assert_eq!(routing.output_for(3), 3);
        assert_eq!(routing.routes.len(), 1);
    }
}
