// Capability traits at the seams between the core and its collaborators.
// Virtual-inheritance abstract base classes in the reference implementation
// become traits here.

use std::fmt;

use crate::content::{BufferHandle, DeviceId, LayerStack};
use crate::timeline::NativeFence;

bitflags::bitflags! {
    /// Usage hints threaded through to the allocator at end-of-frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const GL = 1 << 0;
        const VPP = 1 << 1;
        const DISPLAY = 1 << 2;
    }
}

/// Cached, allocator-reported metadata for a buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferDetails {
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    pub usage: u32,
    pub pitch: u32,
    pub size_bytes: u64,
    pub tiling: u32,
    pub compression: u32,
    pub pavp_session: Option<u32>,
    pub is_encrypted: bool,
    pub is_key_frame: bool,
}

/// The buffer allocator collaborator.
pub trait BufferAllocator: Send + Sync {
    fn query_details(&self, handle: BufferHandle) -> Option<BufferDetails>;

    /// Import `details` as a kernel framebuffer id for the given blend
    /// requirement. `Err` means the format cannot be scanned out directly;
    /// not fatal, `device_id` stays 0.
    fn import_framebuffer(&self, details: &BufferDetails, wants_blend: bool) -> Result<DeviceId, String>;

    fn hint_usage(&self, handle: BufferHandle, usage: BufferUsage);
    fn fallocate_uncommit(&self, handle: BufferHandle);
    fn fallocate_commit(&self, handle: BufferHandle);
}

/// DPMS power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dpms {
    On,
    Standby,
    Suspend,
    Off,
    AsyncOn,
    AsyncOff,
}

/// Panel-fitter modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelFitter {
    Off,
    Auto,
    Pillarbox,
    Letterbox,
    Manual,
}

/// Per-platform capability bits, probed once at startup.
#[derive(Debug, Clone, Copy)]
pub struct DisplayCaps {
    pub atomic_commit: bool,
    /// True if any sprite plane may carry the flip-completion event, not
    /// just the main plane.
    pub flip_event_from_any_plane: bool,
    pub max_planes: u32,
}

/// A single plane's program for one commit.
#[derive(Debug, Clone)]
pub struct PlaneCommit {
    pub plane_id: u32,
    pub fb_id: DeviceId,
    pub src_rect: (u32, u32, u32, u32),
    pub dst_rect: (i32, i32, i32, i32),
    /// Whether this plane's ioctl completion should be treated as the
    /// commit's flip-completion event (legacy path only).
    pub carries_event: bool,
}

/// A full display-controller program for one frame.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub crtc_id: u32,
    pub planes: Vec<PlaneCommit>,
    pub panel_fitter: Option<PanelFitter>,
}

/// The kernel display controller collaborator. One implementation commits
/// atomically; legacy hardware commits per-plane. Both are modeled behind
/// this single trait so [`crate::page_flip::PageFlipHandler`] does not need
/// to know which.
pub trait DisplayController: Send + Sync + fmt::Debug {
    fn caps(&self) -> DisplayCaps;

    /// Program the controller. Returns `Ok(true)` iff a flip-complete event
    /// was validly requested and will arrive later on the controller's event
    /// thread.
    fn commit(&self, request: &CommitRequest) -> Result<bool, String>;

    fn set_dpms(&self, mode: Dpms) -> Result<(), String>;

    /// Program blanking (a commit with no enabled planes) and return
    /// immediately; used by shutdown/suspend.
    fn blank(&self) -> Result<(), String>;

    fn create_framebuffer(&self, details: &BufferDetails, wants_blend: bool) -> Result<DeviceId, String>;

    fn destroy_framebuffer(&self, id: DeviceId);
}

/// Selects which layers go on which plane, explicitly out of scope for the
/// core; it only needs to know a `Composer` exists and can be asked to
/// prepare a [`LayerStack`] into a [`CommitRequest`]'s planes.
pub trait Composer: Send + Sync {
    fn prepare(&self, layers: &LayerStack) -> Vec<PlaneCommit>;
}

/// Abstracts GPU-rendering-complete waits for a layer's acquire fence so the
/// queue worker does not hardcode a fence API.
pub trait PlatformOps: Send + Sync {
    /// Block up to `timeout_ms` for `fence` (if any) to be signalled.
    /// `None` is immediately "ready".
    fn wait_acquire_fence(&self, fence: Option<&std::os::fd::OwnedFd>, timeout_ms: u32) -> bool;
}

/// Dup a native fence fd.
pub fn dup_fence(fence: &std::os::fd::OwnedFd) -> std::io::Result<NativeFence> {
    use std::os::fd::AsFd;
    fence.as_fd().try_clone_to_owned()
}
