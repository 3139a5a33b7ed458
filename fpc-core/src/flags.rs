//! Header flag bits.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in header byte 18. Bits 1..7 are reserved and must be
    /// zero on send; unknown bits are ignored on decode rather than
    /// rejected, so a future version can add flags without breaking old
    /// readers of the *current* version (the version byte still gates
    /// structural changes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// The payload for this frame was too large to ride inline and was
        /// instead delivered via an attached shared-memory descriptor.
        const OOL_PAYLOAD = 0b0000_0001;
    }
}
