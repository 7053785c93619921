// Frames are drawn from a fixed-size pool rather than allocated per-submit.
// Submission blocks only when the pool is at its soft limit; the pool hard
// limit exists purely to bound memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::content::{Connection, DisplayConfig, FrameId, LayerStack};
use crate::error::QueueError;
use crate::timeline::Timeline;

const POOL_SIZE: usize = 10;
const SOFT_LIMIT: usize = 5;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const GPU_WAIT_TIMEOUT_MS: u32 = 3_000;
const NOT_READY_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Queued,
    LockedForDisplay,
    Free,
}

/// Lifecycle events, serialised through the queue alongside frames so their
/// ordering against in-flight work is explicit.
#[derive(Debug, Clone)]
pub enum Event {
    Startup { connection: Connection, is_new: bool },
    Shutdown { release_timeline: u32 },
    Suspend { release_timeline: u32, use_dpms: bool, deactivate: bool },
    Resume,
}

/// A queued frame. Drawn from [`DisplayQueue`]'s fixed pool; `state`/`valid`
/// are mutated in place under the queue's lock rather than by replacing the
/// pool slot.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub z_order: i32,
    pub layers: LayerStack,
    pub config: DisplayConfig,
    pub state: FrameState,
    pub valid: bool,
    /// Timeline slot this frame's retire fence was allocated against.
    pub retire_slot: u32,
}

impl Frame {
    fn reset(&mut self) {
        self.layers.clear();
        self.state = FrameState::Free;
        self.valid = false;
        self.id = FrameId::invalid();
        self.retire_slot = 0;
    }
}

pub type FrameHandle = Arc<Mutex<Frame>>;

/// Diagnostic snapshot of one frame, as captured by [`DisplayQueue::debug_snapshot`].
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub id: FrameId,
    pub z_order: i32,
    pub state: FrameState,
    pub valid: bool,
}

/// Diagnostic snapshot of an entire queue's live contents.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub display: String,
    pub frames: Vec<FrameSnapshot>,
    pub last_queued: FrameId,
    pub last_issued: FrameId,
}

enum WorkKind {
    Frame(FrameHandle),
    Event(Event),
}

struct WorkItem {
    kind: WorkKind,
    effective_frame: FrameId,
}

/// Display-specific behaviour the queue's worker loop drives. Implemented by
/// [`crate::display::PhysicalDisplay`]; kept as a trait so the queue itself
/// stays free of controller/page-flip details.
pub trait QueueDelegate: Send + Sync {
    /// False while the controller cannot accept more work (e.g. mid mode-set,
    /// or waiting for a previous flip's completion).
    fn ready_for_next_work(&self) -> bool;

    /// Block up to [`GPU_WAIT_TIMEOUT_MS`] for `frame`'s layers to finish
    /// rendering. Returns false on timeout, which is fatal to the frame but
    /// not the pipeline.
    fn wait_gpu_ready(&self, frame: &Frame, timeout_ms: u32) -> bool;

    /// True once a later, already-GPU-ready frame makes `frame` redundant.
    fn gpu_ready_now(&self, frame: &Frame) -> bool;

    /// Present `frame`. Returns true iff it was actually flipped (false means
    /// retired without display, e.g. invalidated by a failed flush).
    fn present(&self, frame: &FrameHandle) -> bool;

    /// Retire `frame` without presenting (invalid frame, or queue_drop).
    fn retire(&self, frame: &FrameHandle);

    fn consume_event(&self, event: &Event);
}

struct Pool {
    slots: Vec<FrameHandle>,
    free: VecDeque<usize>,
}

impl Pool {
    fn new() -> Self {
        let slots: Vec<FrameHandle> = (0..POOL_SIZE)
            .map(|_| {
                Arc::new(Mutex::new(Frame {
                    id: FrameId::invalid(),
                    z_order: 0,
                    layers: Vec::new(),
                    config: DisplayConfig { width: 0, height: 0, refresh_hz: 0, global_scaling: Default::default() },
                    state: FrameState::Free,
                    valid: false,
                    retire_slot: 0,
                }))
            })
            .collect();
        let free = (0..POOL_SIZE).collect();
        Self { slots, free }
    }

    fn in_use(&self) -> usize {
        POOL_SIZE - self.free.len()
    }

    fn acquire_free(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    fn release(&mut self, idx: usize) {
        self.slots[idx].lock().reset();
        self.free.push_back(idx);
    }
}

/// The bounded, ordered per-display work queue.
pub struct DisplayQueue {
    name: String,
    timeline: Arc<Timeline>,
    pool: Mutex<Pool>,
    slot_order: Mutex<VecDeque<usize>>,
    items: Mutex<VecDeque<WorkItem>>,
    not_empty: Condvar,
    drained: Condvar,
    ready: Condvar,
    last_queued: Mutex<FrameId>,
    last_issued: Mutex<FrameId>,
    consumer_blocked: AtomicBool,
    worker_thread: Mutex<Option<std::thread::ThreadId>>,
    running: AtomicBool,
    queued_count: AtomicUsize,
    released_count: AtomicUsize,
}

impl DisplayQueue {
    pub fn new(name: impl Into<String>, timeline: Arc<Timeline>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            timeline,
            pool: Mutex::new(Pool::new()),
            slot_order: Mutex::new(VecDeque::new()),
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            ready: Condvar::new(),
            last_queued: Mutex::new(FrameId::invalid()),
            last_issued: Mutex::new(FrameId::invalid()),
            consumer_blocked: AtomicBool::new(false),
            worker_thread: Mutex::new(None),
            running: AtomicBool::new(true),
            queued_count: AtomicUsize::new(0),
            released_count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of [`DisplayQueue::release_frame`] calls observed so far.
    pub fn released_count(&self) -> usize {
        self.released_count.load(Ordering::SeqCst)
    }

    pub fn last_queued(&self) -> FrameId {
        *self.last_queued.lock()
    }

    pub fn last_issued(&self) -> FrameId {
        *self.last_issued.lock()
    }

    /// A point-in-time dump of queued frames for diagnostics, not wired to
    /// any IPC surface.
    pub fn debug_snapshot(&self) -> QueueSnapshot {
        let items = self.items.lock();
        let frames = items
            .iter()
            .filter_map(|item| match &item.kind {
                WorkKind::Frame(f) => {
                    let f = f.lock();
                    Some(FrameSnapshot { id: f.id, z_order: f.z_order, state: f.state, valid: f.valid })
                }
                WorkKind::Event(_) => None,
            })
            .collect();
        QueueSnapshot { display: self.name.clone(), frames, last_queued: self.last_queued(), last_issued: self.last_issued() }
    }

    /// Spawn the always-running worker thread for this display. `delegate`
    /// is shared with the caller (typically `PhysicalDisplay` registers
    /// itself).
    pub fn spawn_worker(self: &Arc<Self>, delegate: Arc<dyn QueueDelegate>) -> std::thread::JoinHandle<()> {
        let queue = self.clone();
        std::thread::Builder::new()
            .name(format!("hwc-{}", self.name))
            .spawn(move || {
                let span = tracing::info_span!("display_queue_worker", display = %queue.name);
                let _enter = span.enter();
                *queue.worker_thread.lock() = Some(std::thread::current().id());
                queue.worker_loop(&delegate);
            })
            .expect("failed to spawn display worker thread")
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.not_empty.notify_all();
        self.ready.notify_all();
    }

    fn worker_loop(&self, delegate: &Arc<dyn QueueDelegate>) {
        while self.running.load(Ordering::SeqCst) {
            self.drop_redundant_frames(delegate);

            if !delegate.ready_for_next_work() {
                let mut items = self.items.lock();
                self.ready.wait_for(&mut items, NOT_READY_POLL);
                continue;
            }

            let item = {
                let mut items = self.items.lock();
                if items.is_empty() {
                    self.not_empty.wait(&mut items);
                    continue;
                }
                items.pop_front().unwrap()
            };
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            self.drained.notify_all();
            self.consume(item, delegate);
        }
    }

    fn consume(&self, item: WorkItem, delegate: &Arc<dyn QueueDelegate>) {
        match item.kind {
            WorkKind::Event(event) => {
                trace!(?event, "consuming event");
                delegate.consume_event(&event);
                *self.last_issued.lock() = item.effective_frame;
            }
            WorkKind::Frame(frame) => {
                frame.lock().state = FrameState::LockedForDisplay;

                let ready = {
                    let snapshot_valid = frame.lock().valid;
                    snapshot_valid && delegate.wait_gpu_ready(&frame.lock(), GPU_WAIT_TIMEOUT_MS)
                };

                self.drop_redundant_frames(delegate);

                let flipped = if ready && frame.lock().valid {
                    delegate.present(&frame)
                } else {
                    delegate.retire(&frame);
                    false
                };
                trace!(flipped, "frame consumed");
                *self.last_issued.lock() = item.effective_frame;
                let _ = flipped;
            }
        }
    }

    /// Snapshot `stack`, assign a `FrameId`, acquire a retire-fence slot, and
    /// append to the queue.
    pub fn queue_frame(
        &self,
        id: FrameId,
        z_order: i32,
        layers: LayerStack,
        config: DisplayConfig,
    ) -> Result<(u32, std::os::fd::OwnedFd), QueueError> {
        self.wait_for_drain_if_needed();

        let (fence, slot) = self.timeline.create_fence()?;

        let idx = match self.pool.lock().acquire_free() {
            Some(idx) => idx,
            None => self.evict_oldest_queued_frame().ok_or(QueueError::NoFreeFrame)?,
        };
        {
            let mut pool = self.pool.lock();
            let mut f = pool.slots[idx].lock();
            f.id = id;
            f.z_order = z_order;
            f.layers = layers;
            f.config = config;
            f.state = FrameState::Queued;
            f.valid = true;
            f.retire_slot = slot;
        }
        let handle = self.pool.lock().slots[idx].clone();

        self.slot_order.lock().push_back(idx);
        {
            let mut last = self.last_queued.lock();
            last.validate_future_frame(&id);
            *last = id;
        }
        self.push_item(WorkItem { kind: WorkKind::Frame(handle), effective_frame: id });
        debug!(?id, slot, "queue_frame");
        Ok((slot, fence))
    }

    /// Append an event item.
    pub fn queue_event(&self, event: Event) {
        let effective = *self.last_queued.lock();
        debug!(?event, ?effective, "queue_event");
        self.push_item(WorkItem { kind: WorkKind::Event(event), effective_frame: effective });
    }

    /// Producer-side drop.
    pub fn queue_drop(&self, id: FrameId) {
        let mut items = self.items.lock();
        if let Some(last) = items.back_mut() {
            last.effective_frame = id;
            debug!(?id, "queue_drop coalesced into last queued item");
        } else {
            drop(items);
            *self.last_issued.lock() = id;
            debug!(?id, "queue_drop with empty queue, advancing issued immediately");
        }
        let mut last_queued = self.last_queued.lock();
        last_queued.validate_future_frame(&id);
        *last_queued = id;
    }

    fn push_item(&self, item: WorkItem) {
        self.items.lock().push_back(item);
        self.queued_count.fetch_add(1, Ordering::SeqCst);
        self.not_empty.notify_one();
    }

    fn wait_for_drain_if_needed(&self) {
        if self.pool.lock().in_use() < SOFT_LIMIT {
            return;
        }
        warn!("frame pool at soft limit, waiting for drain");
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            if self.pool.lock().in_use() < SOFT_LIMIT {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("drain wait timed out, dropping oldest frame");
                self.evict_oldest_queued_frame();
                return;
            }
            // `items` is only held across the condvar wait itself: evicting
            // below re-locks it, and parking_lot's Mutex is not reentrant.
            let mut items = self.items.lock();
            if self.pool.lock().in_use() < SOFT_LIMIT {
                return;
            }
            let timed_out = self.drained.wait_for(&mut items, remaining).timed_out();
            drop(items);
            if timed_out {
                warn!("drain wait timed out, dropping oldest frame");
                self.evict_oldest_queued_frame();
                return;
            }
        }
    }

    /// Resource-exhaustion path: drop the oldest non-locked *queued* frame,
    /// removing its `WorkItem` so a stale reference never survives in the
    /// queue, and retire its fence immediately so callers still observe
    /// exactly one signal even though the frame itself is discarded.
    fn evict_oldest_queued_frame(&self) -> Option<usize> {
        let evicted = {
            let mut items = self.items.lock();
            let pos = items.iter().position(|item| match &item.kind {
                WorkKind::Frame(f) => !matches!(f.lock().state, FrameState::LockedForDisplay),
                WorkKind::Event(_) => false,
            })?;
            let item = items.remove(pos).unwrap();
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            match item.kind {
                WorkKind::Frame(f) => Some(f),
                WorkKind::Event(_) => unreachable!("position() only matched WorkKind::Frame"),
            }
        }?;

        let retire_slot = evicted.lock().retire_slot;
        if let Err(e) = self.timeline.advance_to(retire_slot) {
            warn!(error = %e, "timeline advance on eviction failed");
        }

        let mut order = self.slot_order.lock();
        let pool = self.pool.lock();
        let pos = order.iter().position(|&slot_idx| Arc::ptr_eq(&pool.slots[slot_idx], &evicted))?;
        drop(pool);
        let slot_idx = order.remove(pos).unwrap();
        drop(order);
        self.pool.lock().slots[slot_idx].lock().reset();
        warn!(id = ?evicted.lock().id, "evicted oldest queued frame under pool pressure");
        Some(slot_idx)
    }

    /// Remove all non-locked queued frames, releasing and cancelling their
    /// fences. Frames already `LockedForDisplay` are left in place; they are
    /// still in flight and must run through the normal flip/retire path.
    pub fn drop_all_frames(&self) {
        let dropped: Vec<FrameHandle> = {
            let mut items = self.items.lock();
            let mut remaining = VecDeque::with_capacity(items.len());
            let mut dropped = Vec::new();
            for item in items.drain(..) {
                match item.kind {
                    WorkKind::Frame(frame) => {
                        let locked = matches!(frame.lock().state, FrameState::LockedForDisplay);
                        if locked {
                            remaining.push_back(WorkItem { kind: WorkKind::Frame(frame), effective_frame: item.effective_frame });
                        } else {
                            dropped.push(frame);
                        }
                    }
                    other => remaining.push_back(WorkItem { kind: other, effective_frame: item.effective_frame }),
                }
            }
            *items = remaining;
            self.queued_count.store(items.len(), Ordering::SeqCst);
            dropped
        };

        for frame in &dropped {
            self.invalidate_and_release(frame);
        }
        info!(count = dropped.len(), "drop_all_frames completed");
    }

    /// Walk newest-to-oldest, dropping frames made redundant by a newer,
    /// GPU-ready frame.
    pub fn drop_redundant_frames(&self, delegate: &Arc<dyn QueueDelegate>) {
        let frames: Vec<FrameHandle> = {
            let items = self.items.lock();
            items
                .iter()
                .filter_map(|item| match &item.kind {
                    WorkKind::Frame(f) => Some(f.clone()),
                    WorkKind::Event(_) => None,
                })
                .collect()
        };
        if frames.len() < 2 {
            return;
        }
        let mut found_ready = false;
        for frame in frames.iter().rev() {
            let (locked, valid) = {
                let f = frame.lock();
                (matches!(f.state, FrameState::LockedForDisplay), f.valid)
            };
            if locked || !valid {
                continue;
            }
            if !found_ready {
                if delegate.gpu_ready_now(&frame.lock()) {
                    found_ready = true;
                }
                continue;
            }
            debug!(id = ?frame.lock().id, "dropping redundant older frame");
            frame.lock().valid = false;
        }
    }

    /// Block until `last_issued >= frame_index`, or all queued work drains
    /// when `frame_index` is invalid.
    pub fn flush(&self, frame_index: FrameId, timeout: Duration) -> Result<(), QueueError> {
        if let Some(tid) = *self.worker_thread.lock() {
            if tid == std::thread::current().id() {
                return Err(QueueError::FlushFromWorker);
            }
        }
        if self.consumer_blocked.load(Ordering::SeqCst) {
            self.invalidate_all_queued();
            return Err(QueueError::ConsumerBlocked);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let satisfied = if frame_index.valid {
                self.last_issued.lock().precedes_or_eq(&frame_index)
            } else {
                self.items.lock().is_empty()
            };
            if satisfied {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.invalidate_all_queued();
                return Err(QueueError::ConsumerBlocked);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn invalidate_all_queued(&self) {
        let items = self.items.lock();
        for item in items.iter() {
            if let WorkKind::Frame(f) = &item.kind {
                f.lock().valid = false;
            }
        }
    }

    /// Invalidate a queued, non-locked frame and give back everything it
    /// holds: advance the timeline to its retire slot so its retire fence
    /// signals, cancel its layers' release-fence references, and return its
    /// pool slot (which closes its acquire fences, via `Frame::reset`).
    fn invalidate_and_release(&self, frame: &FrameHandle) {
        let retire_slot = {
            let mut f = frame.lock();
            f.valid = false;
            for layer in &f.layers {
                layer.release_fence_ref.cancel();
            }
            f.retire_slot
        };
        if let Err(e) = self.timeline.advance_to(retire_slot) {
            warn!(error = %e, "timeline advance on frame drop failed");
        }

        let mut order = self.slot_order.lock();
        let pool = self.pool.lock();
        let pos = order.iter().position(|&idx| Arc::ptr_eq(&pool.slots[idx], frame));
        drop(pool);
        if let Some(pos) = pos {
            let idx = order.remove(pos).unwrap();
            drop(order);
            self.pool.lock().release(idx);
        }
    }

    pub fn consumer_blocked(&self) {
        self.consumer_blocked.store(true, Ordering::SeqCst);
    }

    pub fn consumer_unblocked(&self) {
        self.consumer_blocked.store(false, Ordering::SeqCst);
        self.ready.notify_all();
    }

    /// Return a previously-acquired pool slot.
    pub fn release_frame(&self, frame: &FrameHandle) {
        let mut order = self.slot_order.lock();
        let pool = self.pool.lock();
        if let Some(pos) = order.iter().position(|&idx| Arc::ptr_eq(&pool.slots[idx], frame)) {
            let idx = order.remove(pos).unwrap();
            drop(pool);
            self.release_slot(idx);
        }
    }

    fn release_slot(&self, idx: usize) {
        self.pool.lock().release(idx);
        self.released_count.fetch_add(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn queued_len(&self) -> usize {
        self.items.lock().len()
    }

    #[cfg(test)]
    pub fn pool_in_use(&self) -> usize {
        self.pool.lock().in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::PipeSyncBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    struct AlwaysReady {
        presented: StdMutex<Vec<FrameId>>,
        retired: StdMutex<Vec<FrameId>>,
        events: StdMutex<Vec<Event>>,
    }

    impl AlwaysReady {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                presented: StdMutex::new(Vec::new()),
                retired: StdMutex::new(Vec::new()),
                events: StdMutex::new(Vec::new()),
            })
        }
    }

    impl QueueDelegate for AlwaysReady {
        fn ready_for_next_work(&self) -> bool {
            true
        }
        fn wait_gpu_ready(&self, _frame: &Frame, _timeout_ms: u32) -> bool {
            true
        }
        fn gpu_ready_now(&self, _frame: &Frame) -> bool {
            true
        }
        fn present(&self, frame: &FrameHandle) -> bool {
            self.presented.lock().unwrap().push(frame.lock().id);
            true
        }
        fn retire(&self, frame: &FrameHandle) {
            self.retired.lock().unwrap().push(frame.lock().id);
        }
        fn consume_event(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn make_queue(name: &str) -> Arc<DisplayQueue> {
        let backend = PipeSyncBackend::new();
        let timeline = Arc::new(Timeline::new(name, backend));
        DisplayQueue::new(name, timeline)
    }

    fn frame_id(n: u32) -> FrameId {
        FrameId::new(n, n, 0)
    }

    fn blank_config() -> DisplayConfig {
        DisplayConfig { width: 0, height: 0, refresh_hz: 0, global_scaling: Default::default() }
    }

    #[test]
    fn queue_drop_coalesces_into_last_queued_item() {
        let queue = make_queue("drop-coalesce");
        queue.queue_frame(frame_id(10), 0, Vec::new(), blank_config()).unwrap();
        queue.queue_drop(frame_id(11));
        assert_eq!(queue.queued_len(), 1, "drop does not add a separate item");
        assert_eq!(queue.last_queued(), frame_id(11));
    }

    #[test]
    fn queue_drop_with_empty_queue_advances_issued_immediately() {
        let queue = make_queue("drop-empty");
        queue.queue_drop(frame_id(3));
        assert_eq!(queue.last_issued(), frame_id(3));
        assert_eq!(queue.queued_len(), 0);
    }

    #[test]
    fn worker_flips_sequential_frames_in_order() {
        let queue = make_queue("sequential");
        let delegate = AlwaysReady::new();
        for n in 0..5 {
            queue.queue_frame(frame_id(n), 0, Vec::new(), blank_config()).unwrap();
        }
        queue.spawn_worker(delegate.clone());
        let deadline = Instant::now() + Duration::from_secs(2);
        while delegate.presented.lock().unwrap().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        queue.stop();
        let presented = delegate.presented.lock().unwrap();
        assert_eq!(presented.len(), 5);
        for (i, id) in presented.iter().enumerate() {
            assert_eq!(*id, frame_id(i as u32));
        }
    }

    #[test]
    fn flush_on_idle_queue_completes_immediately() {
        let queue = make_queue("flush-idle");
        let delegate = AlwaysReady::new();
        let join = queue.spawn_worker(delegate);
        let result = queue.flush(FrameId::invalid(), Duration::from_millis(200));
        assert!(result.is_ok());
        queue.stop();
        let _ = join.join();
    }

    #[test]
    fn flush_while_consumer_blocked_invalidates_queued_frames() {
        let queue = make_queue("flush-blocked");
        let (_slot, _fence) = queue.queue_frame(frame_id(1), 0, Vec::new(), blank_config()).unwrap();
        queue.consumer_blocked();
        let err = queue.flush(frame_id(1), Duration::from_millis(50));
        assert!(matches!(err, Err(QueueError::ConsumerBlocked)));
    }

    fn blank_layer_with(release_fence_ref: crate::fence_ref::OwnedFenceReference) -> crate::content::Layer {
        use crate::content::{BlendMode, BufferHandle, IRect, Layer, Rect, Transform};
        Layer {
            handle: Some(BufferHandle(1)),
            device_id: 0,
            src_rect: Rect { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            dst_rect: IRect { x: 0, y: 0, w: 1, h: 1 },
            transform: Transform::Identity,
            blend_mode: BlendMode::None,
            plane_alpha: 1.0,
            is_video: false,
            is_encrypted: false,
            is_front_buffer_rendered: false,
            acquire_fence: None,
            release_fence_ref,
        }
    }

    #[test]
    fn drop_all_frames_returns_pool_slots_and_cancels_release_fences() {
        use crate::fence_ref::OwnedFenceReference;
        use crate::timeline::Fence;

        let queue = make_queue("drop-all");
        let backend = PipeSyncBackend::new();
        let fence_timeline = Timeline::new("drop-all-fences", backend);
        let (native, _) = fence_timeline.create_fence().unwrap();
        let release_fence = Arc::new(Fence::new());
        release_fence.merge(native);
        assert_eq!(release_fence.bound_refs(), 1);

        let layers = vec![blank_layer_with(OwnedFenceReference::Extended(release_fence.clone()))];
        queue.queue_frame(frame_id(1), 0, layers, blank_config()).unwrap();
        queue.queue_frame(frame_id(2), 0, Vec::new(), blank_config()).unwrap();
        assert_eq!(queue.pool_in_use(), 2);

        queue.drop_all_frames();

        assert_eq!(queue.queued_len(), 0);
        assert_eq!(queue.pool_in_use(), 0, "pool slots must be returned, not just reset in place");
        assert_eq!(release_fence.bound_refs(), 0, "release fence reference must be cancelled");
    }

    #[test]
    fn drop_all_frames_leaves_locked_frames_queued() {
        let queue = make_queue("drop-all-locked");
        let (_slot, _fence) = queue.queue_frame(frame_id(1), 0, Vec::new(), blank_config()).unwrap();
        {
            let items = queue.items.lock();
            if let WorkKind::Frame(f) = &items.front().unwrap().kind {
                f.lock().state = FrameState::LockedForDisplay;
            }
        }
        queue.drop_all_frames();
        assert_eq!(queue.queued_len(), 1, "a locked frame must not be removed from the queue");
    }
}
