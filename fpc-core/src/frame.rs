//! Frame codec (C2): fixed 256-byte header + payload + fixed 256-byte
//! trailer, and the structural validation that runs at decode time.

use crate::descriptor::DescriptorKind;
use crate::error::FpcError;
use crate::flags::FrameFlags;
use crate::header::WireHeader;
use crate::limits::{FRAME_OVERHEAD, HEADER_SIZE, MAX_DESCRIPTORS, OOL_TAG, PROTOCOL_VERSION, TRAILER_SIZE};
use crate::message::{CorrelationId, MessageId};

/// A frame after decode-time structural validation: header, owned payload
/// bytes, and the raw 256-byte trailer (descriptor-kind tags plus its two
/// reserved bytes).
#[derive(Debug)]
pub struct DecodedFrame {
    pub header: WireHeader,
    pub payload: Vec<u8>,
    pub trailer: [u8; TRAILER_SIZE],
}

impl DecodedFrame {
    /// The descriptor-kind tag recorded for descriptor index `i`. Does not
    /// itself interpret tag 255 — callers decide whether index 0 being 255
    /// means "this frame carries an OOL payload" or is malformed.
    pub fn trailer_tag(&self, i: usize) -> u8 {
        self.trailer[i]
    }

    pub fn is_ool(&self) -> bool {
        self.header.flags.contains(FrameFlags::OOL_PAYLOAD)
    }
}

/// Encodes a frame from its header fields, payload bytes, and one
/// descriptor-kind tag per descriptor (in order). `descriptor_tags.len()`
/// must equal `header.descriptor_count`; this is an internal invariant
/// enforced by callers (`ool.rs`, `endpoint.rs`), not re-checked here.
pub fn encode(header: &WireHeader, payload: &[u8], descriptor_tags: &[u8]) -> Vec<u8> {
    debug_assert_eq!(descriptor_tags.len(), header.descriptor_count as usize);
    debug_assert_eq!(payload.len(), header.payload_length as usize);

    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());

    let mut header_buf = [0u8; HEADER_SIZE];
    header.encode_into(&mut header_buf);
    out.extend_from_slice(&header_buf);

    out.extend_from_slice(payload);

    let mut trailer = [0u8; TRAILER_SIZE];
    trailer[..descriptor_tags.len()].copy_from_slice(descriptor_tags);
    out.extend_from_slice(&trailer);

    out
}

/// Convenience constructor for the header of an outgoing frame.
pub fn build_header(
    message_id: MessageId,
    correlation_id: CorrelationId,
    payload_length: u32,
    descriptor_count: u8,
    is_ool: bool,
) -> WireHeader {
    let mut flags = FrameFlags::empty();
    if is_ool {
        flags |= FrameFlags::OOL_PAYLOAD;
    }
    WireHeader {
        message_id: message_id.0,
        correlation_id,
        payload_length,
        descriptor_count,
        version: PROTOCOL_VERSION,
        flags,
    }
}

/// Decodes and structurally validates a complete frame (header + payload +
/// trailer) read as one SEQPACKET datagram.
///
/// Checks performed, in the order the spec lists them (the fd-count cross
/// check against the header's `descriptor_count` is deferred to
/// [`validate_descriptor_count`] since the caller only learns the actual
/// ancillary fd count from the socket layer):
/// 1. total length >= 512
/// 2. version matches
/// 3. descriptor_count <= 254
/// 4. total length == 512 + payload_length
/// 5. (deferred — see `validate_descriptor_count`)
/// 6. OOL flag implies payload_length == 0, descriptor_count >= 1, trailer[0] == 255
/// 7. trailer tag 255 never appears at an index other than 0
pub fn decode(bytes: &[u8]) -> Result<DecodedFrame, FpcError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FpcError::InvalidMessageFormat);
    }

    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&bytes[0..HEADER_SIZE]);
    let header = WireHeader::decode_from(&header_buf);

    if header.version != PROTOCOL_VERSION {
        return Err(FpcError::UnsupportedVersion(header.version));
    }

    if header.descriptor_count as usize > MAX_DESCRIPTORS {
        return Err(FpcError::InvalidMessageFormat);
    }

    let expected_len = FRAME_OVERHEAD + header.payload_length as usize;
    if bytes.len() != expected_len {
        return Err(FpcError::InvalidMessageFormat);
    }

    let payload = bytes[HEADER_SIZE..HEADER_SIZE + header.payload_length as usize].to_vec();

    let mut trailer = [0u8; TRAILER_SIZE];
    trailer.copy_from_slice(&bytes[HEADER_SIZE + header.payload_length as usize..]);

    let is_ool = header.flags.contains(FrameFlags::OOL_PAYLOAD);
    if is_ool {
        if header.payload_length != 0 || header.descriptor_count == 0 || trailer[0] != OOL_TAG {
            return Err(FpcError::InvalidMessageFormat);
        }
    }

    // Per spec: the OOL tag never appears at trailer index > 0, whether or
    // not that index falls within `descriptor_count` — a peer setting a
    // reserved byte to 255 is malformed too, not just one of the declared
    // descriptor slots.
    if trailer[1..TRAILER_SIZE - 2].iter().any(|&tag| tag == OOL_TAG) {
        return Err(FpcError::InvalidMessageFormat);
    }

    Ok(DecodedFrame {
        header,
        payload,
        trailer,
    })
}

/// Cross-checks the number of ancillary descriptors actually received
/// against the header's `descriptor_count` (step 5 of decode validation,
/// deferred because the socket layer hands descriptors back separately from
/// the frame bytes).
pub fn validate_descriptor_count(frame: &DecodedFrame, actual: usize) -> Result<(), FpcError> {
    if actual != frame.header.descriptor_count as usize {
        return Err(FpcError::InvalidMessageFormat);
    }
    Ok(())
}

/// Maps a decoded trailer's non-OOL tags to their descriptor kinds, in
/// order. The OOL marker tag at index 0 (if present) is excluded — callers
/// strip the OOL descriptor from the application-visible list before this
/// runs, per the receive-path contract in `ool.rs`.
pub fn decode_trailer_kinds(trailer: &[u8; TRAILER_SIZE], count: usize) -> Vec<DescriptorKind> {
    trailer[..count].iter().map(|&tag| DescriptorKind::from_tag(tag)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_frame_roundtrips() {
        let header = build_header(MessageId(1), 42, 3, 1, false);
        let tags = [DescriptorKind::File.to_tag()];
        let bytes = encode(&header, &[0xaa, 0xbb, 0xcc], &tags);
        assert_eq!(bytes.len(), FRAME_OVERHEAD + 3);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload, vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(decoded.trailer_tag(0), DescriptorKind::File.to_tag());
        validate_descriptor_count(&decoded, 1).unwrap();
    }

    #[test]
    fn frame_shorter_than_overhead_is_invalid() {
        let bytes = vec![0u8; FRAME_OVERHEAD - 1];
        assert!(matches!(decode(&bytes), Err(FpcError::InvalidMessageFormat)));
    }

    #[test]
    fn wrong_total_length_is_invalid() {
        let header = build_header(MessageId(1), 0, 10, 0, false);
        let mut bytes = encode(&header, &[0u8; 10], &[]);
        bytes.pop();
        assert!(matches!(decode(&bytes), Err(FpcError::InvalidMessageFormat)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut header = build_header(MessageId(1), 0, 0, 0, false);
        header.version = 1;
        let bytes = encode(&header, &[], &[]);
        assert!(matches!(decode(&bytes), Err(FpcError::UnsupportedVersion(1))));
    }

    #[test]
    fn ool_tag_at_nonzero_index_is_invalid() {
        let header = build_header(MessageId(1), 0, 0, 2, false);
        let bytes = encode(&header, &[], &[1, OOL_TAG]);
        assert!(matches!(decode(&bytes), Err(FpcError::InvalidMessageFormat)));
    }

    #[test]
    fn ool_tag_in_reserved_trailer_region_is_invalid() {
        // descriptor_count = 1, but a byte past the declared descriptors
        // (still within the trailer's reserved padding) is set to 255. The
        // invariant in spec §3 ("a frame with tag 255 at any trailer index
        // != 0 is malformed") applies to the whole trailer, not just the
        // declared descriptor slots.
        let header = build_header(MessageId(1), 0, 0, 1, false);
        let mut bytes = encode(&header, &[], &[DescriptorKind::File.to_tag()]);
        let trailer_start = bytes.len() - TRAILER_SIZE;
        bytes[trailer_start + 100] = OOL_TAG;
        assert!(matches!(decode(&bytes), Err(FpcError::InvalidMessageFormat)));
    }

    #[test]
    fn ool_frame_with_nonzero_payload_is_invalid() {
        let mut header = build_header(MessageId(1), 0, 3, 1, true);
        header.payload_length = 3;
        let bytes = encode(&header, &[1, 2, 3], &[OOL_TAG]);
        assert!(matches!(decode(&bytes), Err(FpcError::InvalidMessageFormat)));
    }

    #[test]
    fn ool_frame_decodes_when_well_formed() {
        let header = build_header(MessageId(1), 0, 0, 1, true);
        let bytes = encode(&header, &[], &[OOL_TAG]);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.is_ool());
        assert_eq!(decoded.trailer_tag(0), OOL_TAG);
    }
}
