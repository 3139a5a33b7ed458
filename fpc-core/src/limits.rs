//! Wire-format size constants and the inline/OOL payload threshold.

use std::sync::OnceLock;

/// Size in bytes of the fixed header.
pub const HEADER_SIZE: usize = 256;

/// Size in bytes of the fixed trailer.
pub const TRAILER_SIZE: usize = 256;

/// `HEADER_SIZE + TRAILER_SIZE`; every frame is this many bytes plus payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Maximum number of descriptors a single frame may carry.
pub const MAX_DESCRIPTORS: usize = 254;

/// Trailer/descriptor-kind tag reserved to mark "this descriptor is the
/// out-of-line payload body", never an application descriptor kind.
pub const OOL_TAG: u8 = 255;

/// Wire protocol version this implementation understands.
pub const PROTOCOL_VERSION: u8 = 0;

/// Computes `MAX_INLINE_PAYLOAD = max(0, kernel_seqpacket_max - FRAME_OVERHEAD)`.
///
/// Queries the kernel's SEQPACKET maximum datagram size via the
/// `net.local.seqpacket.maxdgram`-style sysctl through `/proc/sys` on Linux
/// (`net/core/wmem_max` is the closest portable analogue for a unix socket
/// send buffer ceiling); falls back to a conservative default if the sysctl
/// can't be read. The result is cached process-wide — the kernel limit does
/// not change at runtime.
pub fn max_inline_payload() -> usize {
    static CACHE: OnceLock<usize> = OnceLock::new();
    *CACHE.get_or_init(compute_max_inline_payload)
}

/// Default used when the kernel's limit can't be queried. Conservative: most
/// Linux systems default `net.core.wmem_max` well above this.
const FALLBACK_SEQPACKET_MAX: usize = 212_992;

fn compute_max_inline_payload() -> usize {
    let kernel_max = read_seqpacket_max().unwrap_or(FALLBACK_SEQPACKET_MAX);
    kernel_max.saturating_sub(FRAME_OVERHEAD)
}

fn read_seqpacket_max() -> Option<usize> {
    let raw = std::fs::read_to_string("/proc/sys/net/core/wmem_max").ok()?;
    raw.trim().parse::<usize>().ok()
}

/// Largest possible frame on the wire: an inline frame carrying exactly
/// `MAX_INLINE_PAYLOAD` bytes. OOL frames are always smaller (their payload
/// is empty), so this bound is safe to size a single-datagram receive buffer
/// with — `SOCK_SEQPACKET` silently drops anything past the buffer the
/// reader supplied, so under-sizing this would corrupt, not just slow,
/// receives.
pub fn max_frame_size() -> usize {
    FRAME_OVERHEAD + max_inline_payload()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_inline_payload_is_stable_across_calls() {
        assert_eq!(max_inline_payload(), max_inline_payload());
    }

    #[test]
    fn max_inline_payload_never_underflows() {
        // Whatever the kernel reports, subtracting FRAME_OVERHEAD must saturate
        // at zero rather than wrap.
        assert!(max_inline_payload() < usize::MAX / 2);
    }
}
