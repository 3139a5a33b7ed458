//! Fixed-layout 256-byte header encode/decode.
//!
//! Every multi-byte field is native-endian by design: FPC frames never
//! leave the host they were written on, so there is no wire-compatibility
//! reason to pay for byte-swapping.

use crate::flags::FrameFlags;
use crate::limits::HEADER_SIZE;

/// The header fields of one frame, already validated against the current
/// protocol version by the time a caller sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub message_id: u32,
    pub correlation_id: u64,
    pub payload_length: u32,
    pub descriptor_count: u8,
    pub version: u8,
    pub flags: FrameFlags,
}

impl WireHeader {
    /// Writes this header into a 256-byte buffer at the fixed offsets.
    /// Bytes 19..256 are left zeroed.
    pub fn encode_into(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(&self.message_id.to_ne_bytes());
        buf[4..12].copy_from_slice(&self.correlation_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_ne_bytes());
        buf[16] = self.descriptor_count;
        buf[17] = self.version;
        buf[18] = self.flags.bits();
    }

    /// Reads a header out of its fixed-offset fields. This does not perform
    /// cross-field validation (payload length vs. frame length, OOL
    /// consistency, etc.) — that lives in [`crate::frame`], which has the
    /// whole frame to check against.
    pub fn decode_from(buf: &[u8; HEADER_SIZE]) -> WireHeader {
        let message_id = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let correlation_id = u64::from_ne_bytes(buf[4..12].try_into().unwrap());
        let payload_length = u32::from_ne_bytes(buf[12..16].try_into().unwrap());
        let descriptor_count = buf[16];
        let version = buf[17];
        let flags = FrameFlags::from_bits_truncate(buf[18]);
        WireHeader {
            message_id,
            correlation_id,
            payload_length,
            descriptor_count,
            version,
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_fixed_offsets() {
        let header = WireHeader {
            message_id: 7,
            correlation_id: 0xdead_beef_0000_0001,
            payload_length: 42,
            descriptor_count: 3,
            version: 0,
            flags: FrameFlags::OOL_PAYLOAD,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        assert_eq!(WireHeader::decode_from(&buf), header);
    }

    #[test]
    fn reserved_tail_is_zeroed() {
        let header = WireHeader {
            message_id: 1,
            correlation_id: 1,
            payload_length: 0,
            descriptor_count: 0,
            version: 0,
            flags: FrameFlags::empty(),
        };
        let mut buf = [0xffu8; HEADER_SIZE];
        header.encode_into(&mut buf);
        assert!(buf[19..].iter().all(|&b| b == 0));
    }
}
