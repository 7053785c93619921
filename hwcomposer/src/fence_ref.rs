use std::os::fd::OwnedFd;

use crate::timeline::{Fence, NativeFence};

/// Either unspecified, a native fd slot, or an extended fence.
pub enum FenceReference<'a> {
    Unspecified,
    Native(&'a mut Option<NativeFence>),
    Extended(&'a Fence),
}

impl<'a> FenceReference<'a> {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, FenceReference::Unspecified)
    }

    /// Write `fence` through to the underlying slot. For a native slot this
    /// closes any fd already present and replaces it. For an extended slot
    /// this merges, leaving prior contributors intact.
    pub fn publish(&mut self, fence: NativeFence) {
        match self {
            FenceReference::Unspecified => drop(fence),
            FenceReference::Native(slot) => **slot = Some(fence),
            FenceReference::Extended(f) => f.merge(fence),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, FenceReference::Extended(_))
    }
}

/// Owned variant used when a snapshot must retain the reference beyond the
/// producer's stack frame. The queue retains `Extended` release-fence
/// references but not `Native` ones.
#[derive(Debug)]
pub enum OwnedFenceReference {
    Unspecified,
    Native,
    Extended(std::sync::Arc<Fence>),
}

impl OwnedFenceReference {
    pub fn from_ref(reference: &FenceReference<'_>) -> Self {
        match reference {
            FenceReference::Unspecified => OwnedFenceReference::Unspecified,
            FenceReference::Native(_) => OwnedFenceReference::Native,
            FenceReference::Extended(_) => {
                // Callers that need retention construct `Extended` directly
                // from their own Arc<Fence>; borrowing here would outlive
                // the reference's lifetime.
                OwnedFenceReference::Unspecified
            }
        }
    }

    pub fn publish(&self, fence: NativeFence) {
        match self {
            OwnedFenceReference::Extended(f) => f.merge(fence),
            OwnedFenceReference::Unspecified | OwnedFenceReference::Native => drop(fence),
        }
    }

    /// Cancel an extended fence's contribution without waiting for it to
    /// signal. A no-op for `Unspecified`/`Native`, which have nothing to
    /// cancel.
    pub fn cancel(&self) {
        if let OwnedFenceReference::Extended(f) = self {
            f.cancel();
        }
    }
}

#[allow(unused)]
fn _assert_send_sync()
where
    OwnedFd: Send,
{
}
