// The per-frame content snapshot: `Layer`, `LayerStack`, `DisplayConfig`,
// `GlobalScaling`, `FrameId`.

use std::os::fd::OwnedFd;

use crate::fence_ref::OwnedFenceReference;

/// Opaque handle into the graphics allocator. The core never interprets its
/// bits; it is a lookup key into [`crate::buffer_manager::BufferManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Kernel display-controller framebuffer id. `0` means "not importable",
/// signalling the layer must be composed upstream before it can reach a
/// plane.
pub type DeviceId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Rot90,
    Rot180,
    Rot270,
    FlipH,
    FlipV,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    None,
    Premultiplied,
    Coverage,
}

/// A layer as it exists once captured into a [`Frame`] snapshot, the only
/// form the queue ever holds.
#[derive(Debug)]
pub struct Layer {
    pub handle: Option<BufferHandle>,
    pub device_id: DeviceId,
    pub src_rect: Rect,
    pub dst_rect: IRect,
    pub transform: Transform,
    pub blend_mode: BlendMode,
    pub plane_alpha: f32,
    pub is_video: bool,
    pub is_encrypted: bool,
    pub is_front_buffer_rendered: bool,
    pub acquire_fence: Option<OwnedFd>,
    pub release_fence_ref: OwnedFenceReference,
}

impl Layer {
    /// Geometry/format equality ignoring the buffer handle, plus whether the
    /// handle itself also matched.
    pub fn matches(&self, other: &Layer) -> (bool, bool) {
        let geometry_matches = self.src_rect == other.src_rect
            && self.dst_rect == other.dst_rect
            && self.transform == other.transform
            && self.blend_mode == other.blend_mode
            && self.plane_alpha == other.plane_alpha
            && self.is_video == other.is_video
            && self.is_encrypted == other.is_encrypted;
        let handle_matches = self.handle == other.handle;
        (geometry_matches, handle_matches)
    }
}

/// Ordered sequence of layers; z-order is index order.
pub type LayerStack = Vec<Layer>;

/// Compare two layer stacks for a full geometry+handle match. Mirrors the
/// *correct* (non-inverted) comparator in the original codebase.
pub fn layer_stack_matches(ours: &LayerStack, theirs: &LayerStack) -> (bool, bool) {
    if ours.len() != theirs.len() {
        return (false, false);
    }
    let mut handles_match = true;
    for (a, b) in ours.iter().zip(theirs.iter()) {
        let (geom, handle) = a.matches(b);
        if !geom {
            return (false, false);
        }
        handles_match &= handle;
    }
    (true, handles_match)
}

/// Top-level, multi-display content match check.
///
/// This replicates a quirk carried over verbatim from the reference
/// implementation: the size comparison below is inverted relative to every
/// other `matches` in this module (it should read `!=`, and does everywhere
/// else). Preserved exactly rather than "fixed", since the original intent
/// is not recoverable from the source alone; callers that need a true
/// equality check should use [`layer_stack_matches`] directly instead of
/// this function.
pub fn content_matches(ours: &[LayerStack], theirs: &[LayerStack]) -> bool {
    if ours.len() == theirs.len() {
        return false;
    }
    ours.iter().zip(theirs.iter()).all(|(a, b)| layer_stack_matches(a, b).0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub global_scaling: GlobalScaling,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlobalScaling {
    pub enabled: bool,
    pub src_w: u32,
    pub src_h: u32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_w: u32,
    pub dst_h: u32,
}

/// A display's attachment to the kernel controller. The display owns its
/// active connection exclusively; a hotplug thread
/// keeps a shadow copy for change detection only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub pipe_index: u32,
    pub has_pipe: bool,
    pub connected: bool,
}

/// Frame identity: `(timeline slot, sequence, receive-time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId {
    pub timeline_index: u32,
    pub hwc_index: u32,
    pub received_time_ns: u64,
    pub valid: bool,
}

impl FrameId {
    pub fn invalid() -> Self {
        Self { timeline_index: 0, hwc_index: 0, received_time_ns: 0, valid: false }
    }

    pub fn new(timeline_index: u32, hwc_index: u32, received_time_ns: u64) -> Self {
        Self { timeline_index, hwc_index, received_time_ns, valid: true }
    }

    /// Assert (in debug) that `future` does not precede `self`, using
    /// wraparound-safe signed-delta comparison.
    pub fn validate_future_frame(&self, future: &FrameId) {
        let hwc_delta = (future.hwc_index.wrapping_sub(self.hwc_index)) as i32;
        let timeline_delta = (future.timeline_index.wrapping_sub(self.timeline_index)) as i32;
        debug_assert!(
            hwc_delta >= 0 && timeline_delta >= 0,
            "future frame {future:?} must not precede current {self:?}"
        );
    }

    /// `self <= other`, wraparound-safe.
    pub fn precedes_or_eq(&self, other: &FrameId) -> bool {
        (other.timeline_index.wrapping_sub(self.timeline_index) as i32) >= 0
    }
}

impl Default for FrameId {
    fn default() -> Self {
        Self::invalid()
    }
}
