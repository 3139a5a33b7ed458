//! Descriptor-kind codec (C1) and the owned-descriptor reference type.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::limits::OOL_TAG;

/// The closed set of semantic roles a descriptor passed alongside a frame can
/// play. `Unknown` is the decode-time fallback for tags this implementation
/// doesn't recognize — future protocol versions may add kinds, and an old
/// reader should not fail just because it can't name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DescriptorKind {
    Unknown,
    File,
    Directory,
    Device,
    Process,
    Kqueue,
    Socket,
    Pipe,
    JailNonOwning,
    JailOwning,
    Shm,
    Event,
}

impl DescriptorKind {
    /// Maps a kind to its wire tag. Total: every variant has a tag.
    pub fn to_tag(self) -> u8 {
        match self {
            DescriptorKind::Unknown => 0,
            DescriptorKind::File => 1,
            DescriptorKind::Directory => 2,
            DescriptorKind::Device => 3,
            DescriptorKind::Process => 4,
            DescriptorKind::Kqueue => 5,
            DescriptorKind::Socket => 6,
            DescriptorKind::Pipe => 7,
            DescriptorKind::JailNonOwning => 8,
            DescriptorKind::JailOwning => 9,
            DescriptorKind::Shm => 10,
            DescriptorKind::Event => 11,
        }
    }

    /// Maps a wire tag back to a kind. Total: unrecognized tags (other than
    /// the reserved OOL marker, which callers must strip before reaching
    /// here) decode to `Unknown` rather than failing.
    pub fn from_tag(tag: u8) -> DescriptorKind {
        match tag {
            1 => DescriptorKind::File,
            2 => DescriptorKind::Directory,
            3 => DescriptorKind::Device,
            4 => DescriptorKind::Process,
            5 => DescriptorKind::Kqueue,
            6 => DescriptorKind::Socket,
            7 => DescriptorKind::Pipe,
            8 => DescriptorKind::JailNonOwning,
            9 => DescriptorKind::JailOwning,
            10 => DescriptorKind::Shm,
            11 => DescriptorKind::Event,
            _ => DescriptorKind::Unknown,
        }
    }
}

/// A kernel file descriptor tagged with its semantic kind.
///
/// Owns the descriptor: dropping an `OpaqueDescriptorRef` closes the fd
/// unless [`OpaqueDescriptorRef::into_owned_fd`] has already taken it.
#[derive(Debug)]
pub struct OpaqueDescriptorRef {
    kind: DescriptorKind,
    fd: Option<OwnedFd>,
}

impl OpaqueDescriptorRef {
    /// Wraps an owned descriptor with its semantic kind.
    pub fn new(kind: DescriptorKind, fd: OwnedFd) -> Self {
        Self { kind, fd: Some(fd) }
    }

    /// The descriptor's semantic kind.
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Borrows the raw descriptor number without transferring ownership.
    ///
    /// Returns `None` if ownership was already taken.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Takes ownership of the underlying descriptor. After this call the
    /// `OpaqueDescriptorRef` no longer closes anything on drop.
    pub fn into_owned_fd(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

/// Encodes a trailer tag for one outgoing descriptor, given its kind and
/// whether it occupies the OOL marker slot (index 0 of a frame carrying an
/// out-of-line payload).
pub fn trailer_tag_for(kind: DescriptorKind, is_ool_marker: bool) -> u8 {
    if is_ool_marker {
        OOL_TAG
    } else {
        kind.to_tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_for_all_known_kinds() {
        let kinds = [
            DescriptorKind::File,
            DescriptorKind::Directory,
            DescriptorKind::Device,
            DescriptorKind::Process,
            DescriptorKind::Kqueue,
            DescriptorKind::Socket,
            DescriptorKind::Pipe,
            DescriptorKind::JailNonOwning,
            DescriptorKind::JailOwning,
            DescriptorKind::Shm,
            DescriptorKind::Event,
        ];
        for kind in kinds {
            assert_eq!(DescriptorKind::from_tag(kind.to_tag()), kind);
        }
    }

    #[test]
    fn tag_zero_is_unknown() {
        assert_eq!(DescriptorKind::from_tag(0), DescriptorKind::Unknown);
    }

    #[test]
    fn unrecognized_tag_decodes_to_unknown() {
        assert_eq!(DescriptorKind::from_tag(200), DescriptorKind::Unknown);
    }
}
