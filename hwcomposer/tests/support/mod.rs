// Fakes shared by the end-to-end scenario tests. No real DRM device or
// allocator is required to exercise the queue/page-flip/buffer-manager
// pipeline end to end.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use hwcomposer::content::LayerStack;
use hwcomposer::traits::{
    BufferAllocator, BufferDetails, BufferUsage, CommitRequest, Composer, DisplayCaps, DisplayController, Dpms, PlaneCommit,
};

#[derive(Debug, Default)]
pub struct FakeController {
    pub event_on_commit: AtomicBool,
    pub commits: Mutex<Vec<CommitRequest>>,
    pub dpms_history: Mutex<Vec<Dpms>>,
}

impl FakeController {
    pub fn new(event_on_commit: bool) -> Self {
        Self { event_on_commit: AtomicBool::new(event_on_commit), ..Default::default() }
    }
}

impl DisplayController for FakeController {
    fn caps(&self) -> DisplayCaps {
        DisplayCaps { atomic_commit: true, flip_event_from_any_plane: true, max_planes: 4 }
    }

    fn commit(&self, request: &CommitRequest) -> Result<bool, String> {
        self.commits.lock().unwrap().push(request.clone());
        Ok(self.event_on_commit.load(Ordering::SeqCst))
    }

    fn set_dpms(&self, mode: Dpms) -> Result<(), String> {
        self.dpms_history.lock().unwrap().push(mode);
        Ok(())
    }

    fn blank(&self) -> Result<(), String> {
        Ok(())
    }

    fn create_framebuffer(&self, _details: &BufferDetails, _wants_blend: bool) -> Result<u64, String> {
        Ok(1)
    }

    fn destroy_framebuffer(&self, _id: u64) {}
}

#[derive(Default)]
pub struct FakeAllocator {
    next_fb: AtomicU64,
}

impl BufferAllocator for FakeAllocator {
    fn query_details(&self, _handle: hwcomposer::content::BufferHandle) -> Option<BufferDetails> {
        Some(BufferDetails::default())
    }

    fn import_framebuffer(&self, _details: &BufferDetails, _wants_blend: bool) -> Result<u64, String> {
        Ok(self.next_fb.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn hint_usage(&self, _handle: hwcomposer::content::BufferHandle, _usage: BufferUsage) {}
    fn fallocate_uncommit(&self, _handle: hwcomposer::content::BufferHandle) {}
    fn fallocate_commit(&self, _handle: hwcomposer::content::BufferHandle) {}
}

pub struct NullComposer;

impl Composer for NullComposer {
    fn prepare(&self, _layers: &LayerStack) -> Vec<PlaneCommit> {
        Vec::new()
    }
}

/// A pipe whose read end is the "acquire fence" a layer carries. `signal()`
/// makes it readable, simulating GPU rendering completion.
pub struct FenceSource {
    pub read_end: Option<OwnedFd>,
    write_end: OwnedFd,
}

impl FenceSource {
    pub fn new() -> Self {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        Self { read_end: Some(read_end), write_end }
    }

    pub fn new_signalled() -> Self {
        let source = Self::new();
        source.signal();
        source
    }

    pub fn signal(&self) {
        let _ = nix::unistd::write(&self.write_end, &[0u8]);
    }

    pub fn take_fd(&mut self) -> OwnedFd {
        self.read_end.take().expect("fence already taken")
    }
}
