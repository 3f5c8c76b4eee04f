//! Scalar types shared by every crate in the offload engine workspace.

use std::fmt;

pub use digit_layout::DigitLayout as DType;
pub use half::f16;

/// Identifies the accelerator a buffer lives on. Opaque outside `device*`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceId(pub usize);

/// Forward-time layer index a captured tensor belongs to.
///
/// `GroupId::STRAY` is the reserved sentinel used to tag symbolic/fake
/// tensors that must pass through the engine untouched.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct GroupId(pub i64);

impl GroupId {
    pub const STRAY: Self = Self(-1);

    #[inline]
    pub const fn is_stray(self) -> bool {
        self.0 == Self::STRAY.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_stray() {
            write!(f, "stray")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// `(group_id, intra_group_seq)`, totally ordered and unique within the
/// lifetime of one forward/backward session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Tag {
    pub group: GroupId,
    pub seq: u64,
}

impl Tag {
    #[inline]
    pub const fn new(group: GroupId, seq: u64) -> Self {
        Self { group, seq }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.group, self.seq)
    }
}
