// Cache mapping opaque allocator handles to kernel framebuffer ids,
// GPU-memory purge/realise bookkeeping, and per-buffer tags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::content::{BufferHandle, DeviceId};
use crate::error::BufferError;
use crate::traits::{BufferAllocator, BufferDetails, BufferUsage};

static NEXT_GPU_OBJECT: AtomicU32 = AtomicU32::new(1);

const TAG_MAX_CHARS: usize = 16;

/// A tracked buffer. Lives behind `Arc` so frames holding a reference keep
/// it alive even once the allocator has freed the underlying handle
/// ("orphaned").
#[derive(Debug)]
pub struct ManagedBuffer {
    pub handle: BufferHandle,
    gpu_object: u32,
    fb_blend: AtomicU32,
    fb_opaque: AtomicU32,
    size_bytes: u64,
    purged: std::sync::atomic::AtomicBool,
    surface_flinger_display: Mutex<Option<u32>>,
    last_used_frame: AtomicU64,
    usage_bits: AtomicU32,
    orphaned: std::sync::atomic::AtomicBool,
    tag: Mutex<String>,
    details: BufferDetails,
}

impl ManagedBuffer {
    fn new(handle: BufferHandle, details: BufferDetails) -> Self {
        Self {
            handle,
            gpu_object: NEXT_GPU_OBJECT.fetch_add(1, Ordering::SeqCst),
            fb_blend: AtomicU32::new(0),
            fb_opaque: AtomicU32::new(0),
            size_bytes: details.size_bytes,
            purged: std::sync::atomic::AtomicBool::new(false),
            surface_flinger_display: Mutex::new(None),
            last_used_frame: AtomicU64::new(0),
            usage_bits: AtomicU32::new(0),
            orphaned: std::sync::atomic::AtomicBool::new(false),
            tag: Mutex::new(String::new()),
            details,
        }
    }

    pub fn gpu_object(&self) -> u32 {
        self.gpu_object
    }

    pub fn fb_for_blend(&self, wants_blend: bool) -> DeviceId {
        let id = if wants_blend { &self.fb_blend } else { &self.fb_opaque };
        id.load(Ordering::SeqCst) as DeviceId
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }

    pub fn is_purged(&self) -> bool {
        self.purged.load(Ordering::SeqCst)
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::SeqCst)
    }

    pub fn details(&self) -> &BufferDetails {
        &self.details
    }

    pub fn set_tag(&self, tag: &str) {
        let mut t = self.tag.lock().unwrap();
        t.clear();
        t.push_str(&tag.chars().take(TAG_MAX_CHARS).collect::<String>());
    }

    pub fn tag(&self) -> String {
        self.tag.lock().unwrap().clone()
    }
}

/// Callback interface forwarded allocator add/free notifications; other
/// subsystems register to invalidate their own caches.
pub trait Tracker: Send + Sync {
    fn on_buffer_added(&self, handle: BufferHandle);
    fn on_buffer_freed(&self, handle: BufferHandle);
}

pub struct BufferManager {
    allocator: Arc<dyn BufferAllocator>,
    buffers: Mutex<HashMap<BufferHandle, Arc<ManagedBuffer>>>,
    trackers: Mutex<Vec<Arc<dyn Tracker>>>,
    /// How many frames must elapse since a tagged buffer's last use before
    /// it becomes eligible for purge.
    purge_frame_threshold: u64,
}

impl BufferManager {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            buffers: Mutex::new(HashMap::new()),
            trackers: Mutex::new(Vec::new()),
            purge_frame_threshold: 4,
        }
    }

    pub fn register_tracker(&self, tracker: Arc<dyn Tracker>) {
        self.trackers.lock().unwrap().push(tracker);
    }

    /// Called when the allocator reports a new buffer.
    pub fn on_allocate(&self, handle: BufferHandle, details: BufferDetails) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(handle)
            .or_insert_with(|| Arc::new(ManagedBuffer::new(handle, details)));
        drop(buffers);
        for t in self.trackers.lock().unwrap().iter() {
            t.on_buffer_added(handle);
        }
    }

    /// Called when the allocator reports a buffer has been freed. The
    /// record is only actually dropped once its refcount also reaches zero.
    pub fn on_free(&self, handle: BufferHandle) {
        let should_drop = {
            let buffers = self.buffers.lock().unwrap();
            if let Some(buf) = buffers.get(&handle) {
                buf.orphaned.store(true, Ordering::SeqCst);
                Arc::strong_count(buf) <= 1
            } else {
                false
            }
        };
        if should_drop {
            self.buffers.lock().unwrap().remove(&handle);
        }
        for t in self.trackers.lock().unwrap().iter() {
            t.on_buffer_freed(handle);
        }
    }

    /// Cached, always-safe metadata lookup.
    pub fn get_layer_buffer_details(&self, handle: BufferHandle) -> Option<BufferDetails> {
        self.buffers.lock().unwrap().get(&handle).map(|b| b.details.clone())
    }

    /// Acquire a strong reference, creating a just-in-time orphaned record
    /// if the handle is unknown.
    pub fn acquire_buffer(&self, handle: BufferHandle) -> Arc<ManagedBuffer> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(existing) = buffers.get(&handle) {
            return existing.clone();
        }
        trace!(?handle, "acquire_buffer: unknown handle, creating orphaned record");
        let details = self.allocator.query_details(handle).unwrap_or_default();
        let buf = Arc::new(ManagedBuffer::new(handle, details));
        buf.orphaned.store(true, Ordering::SeqCst);
        buffers.insert(handle, buf.clone());
        buf
    }

    /// Release a previously-acquired reference. Buffers are kept alive by
    /// `Arc` refcounting; this exists for symmetry and bookkeeping of
    /// `last_used_frame`.
    pub fn touch(&self, buf: &Arc<ManagedBuffer>, frame_index: u64) {
        buf.last_used_frame.store(frame_index, Ordering::SeqCst);
    }

    pub fn set_buffer_usage(&self, handle: BufferHandle, usage: BufferUsage) {
        if let Some(buf) = self.buffers.lock().unwrap().get(&handle) {
            buf.usage_bits.fetch_or(usage.bits(), Ordering::SeqCst);
        }
    }

    pub fn set_surface_flinger_rt(&self, handle: BufferHandle, display_index: u32) {
        if let Some(buf) = self.buffers.lock().unwrap().get(&handle) {
            *buf.surface_flinger_display.lock().unwrap() = Some(display_index);
        }
    }

    /// Lazily create (or return) the framebuffer id for `handle`, importing
    /// separately for blended vs. opaque use.
    /// Returns `0` (and records the buffer as tracked-but-unimportable) if
    /// the format cannot be scanned out directly.
    pub fn fb_id_for(&self, handle: BufferHandle, wants_blend: bool) -> Result<DeviceId, BufferError> {
        let buf = self.acquire_buffer(handle);
        let existing = buf.fb_for_blend(wants_blend);
        if existing != 0 {
            return Ok(existing);
        }
        match self.allocator.import_framebuffer(&buf.details, wants_blend) {
            Ok(fb) => {
                let slot = if wants_blend { &buf.fb_blend } else { &buf.fb_opaque };
                slot.store(fb as u32, Ordering::SeqCst);
                debug!(?handle, wants_blend, fb, "imported framebuffer");
                Ok(fb)
            }
            Err(reason) => {
                debug!(?handle, wants_blend, %reason, "framebuffer import rejected, layer needs upstream composition");
                Ok(0)
            }
        }
    }

    /// Release or restore the physical backing of the host compositor's
    /// render-target buffers for `display_index`. At most one buffer is
    /// touched per call, smearing the cost across frames.
    pub fn purge_surface_flinger_rts(&self, display_index: u32, current_frame: u64) {
        self.smear_one(display_index, current_frame, true);
    }

    pub fn realize_surface_flinger_rts(&self, display_index: u32, current_frame: u64) {
        self.smear_one(display_index, current_frame, false);
    }

    fn smear_one(&self, display_index: u32, current_frame: u64, purge: bool) {
        let buffers = self.buffers.lock().unwrap();
        let candidate = buffers.values().find(|b| {
            *b.surface_flinger_display.lock().unwrap() == Some(display_index)
                && b.is_purged() != purge
                && current_frame.saturating_sub(b.last_used_frame()) >= self.purge_frame_threshold
        }).cloned();
        drop(buffers);
        if let Some(buf) = candidate {
            buf.purged.store(purge, Ordering::SeqCst);
            if purge {
                self.allocator.fallocate_uncommit(buf.handle);
            } else {
                self.allocator.fallocate_commit(buf.handle);
            }
        }
    }

    /// Sweep accumulated usage bits and push compression hints to the
    /// allocator.
    pub fn on_end_of_frame(&self) {
        let buffers = self.buffers.lock().unwrap();
        for buf in buffers.values() {
            let bits = buf.usage_bits.swap(0, Ordering::SeqCst);
            if bits != 0 {
                self.allocator.hint_usage(buf.handle, BufferUsage::from_bits_truncate(bits));
            }
        }
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
