use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer_manager::BufferManager;
use crate::content::{Connection, FrameId};
use crate::error::ComposerError;
use crate::page_flip::PageFlipHandler;
use crate::queue::{DisplayQueue, Event, Frame, FrameHandle, QueueDelegate};
use crate::timeline::{poll_readable, Timeline};
use crate::traits::{Composer, DisplayController, Dpms};

/// Default window a hotplug transition gets to drain through the worker
/// before its synthesised event is considered stuck. Zero would never give
/// the worker thread a chance to actually dequeue the event it just queued.
const HOTPLUG_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Unknown,
    PendingStart,
    Available,
    Suspended,
    Shutdown,
}

/// Exclusive, cross-display acquisition of the panel fitter hardware,
/// shared by every display on the same controller family.
#[derive(Default)]
pub struct GlobalScalingArbiter {
    owner: Mutex<Option<u32>>,
}

impl GlobalScalingArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire on behalf of `display_id`. Fails if another display already
    /// holds it; the caller must then pre-scale via a renderer instead.
    pub fn acquire(&self, display_id: u32) -> bool {
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current != display_id => false,
            _ => {
                *owner = Some(display_id);
                true
            }
        }
    }

    pub fn release(&self, display_id: u32) {
        let mut owner = self.owner.lock();
        if *owner == Some(display_id) {
            *owner = None;
        }
    }
}

/// One physical display's full pipeline: queue, page-flip handler, and
/// lifecycle state. Constructed behind `Arc` so it can register itself as
/// the queue's [`QueueDelegate`] without a reference cycle (the queue only
/// borrows the delegate for the lifetime of its worker thread).
pub struct PhysicalDisplay {
    pub id: u32,
    name: String,
    queue: Arc<DisplayQueue>,
    page_flip: PageFlipHandler,
    buffer_manager: Arc<BufferManager>,
    scaling: Arc<GlobalScalingArbiter>,
    /// Whether this display currently holds `scaling`. Tracked locally
    /// because only the holder knows when to give it back.
    scaling_held: AtomicBool,
    status: Mutex<DisplayStatus>,
    connection: Mutex<Option<Connection>>,
    recovering: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PhysicalDisplay {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        controller: Arc<dyn DisplayController>,
        composer: Arc<dyn Composer>,
        buffer_manager: Arc<BufferManager>,
        scaling: Arc<GlobalScalingArbiter>,
    ) -> Arc<Self> {
        let name = name.into();
        let backend = crate::timeline::PipeSyncBackend::new();
        let timeline = Arc::new(Timeline::new(name.clone(), backend));
        let queue = DisplayQueue::new(name.clone(), timeline.clone());
        let page_flip = PageFlipHandler::new(timeline, controller, composer);
        Arc::new(Self {
            id,
            name,
            queue,
            page_flip,
            buffer_manager,
            scaling,
            scaling_held: AtomicBool::new(false),
            status: Mutex::new(DisplayStatus::Unknown),
            connection: Mutex::new(None),
            recovering: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn status(&self) -> DisplayStatus {
        *self.status.lock()
    }

    pub fn queue(&self) -> &Arc<DisplayQueue> {
        &self.queue
    }

    /// Start the worker thread. Must be called once, after construction,
    /// with `self` already wrapped in an `Arc` (the worker holds a clone as
    /// its [`QueueDelegate`]).
    pub fn start(self: &Arc<Self>) {
        let handle = self.queue.spawn_worker(self.clone());
        *self.worker.lock() = Some(handle);
    }

    pub fn shutdown_worker(&self) {
        self.queue.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // The worker is dead now; nothing will ever drain whatever is still
        // queued, so reclaim those frames' fences and pool slots directly.
        self.queue.drop_all_frames();
    }

    /// Mark the display for ESD recovery; the next worker wake runs
    /// DPMS off -> set-display -> DPMS on before flipping.
    pub fn request_recovery(&self) {
        warn!(display = %self.name, "ESD recovery requested");
        self.recovering.store(true, Ordering::SeqCst);
    }

    /// Acquire the panel fitter on this (producer) thread if `config` asks
    /// for it, falling back to pre-scaled content on rejection, then queue
    /// the frame. The consumer thread applies whatever `config` ends up
    /// carrying when it builds the commit.
    pub fn queue_frame(
        &self,
        id: FrameId,
        z_order: i32,
        layers: crate::content::LayerStack,
        mut config: crate::content::DisplayConfig,
    ) -> Result<(u32, std::os::fd::OwnedFd), ComposerError> {
        if config.global_scaling.enabled {
            if self.scaling.acquire(self.id) {
                self.scaling_held.store(true, Ordering::SeqCst);
            } else {
                warn!(display = %self.name, "panel fitter unavailable, falling back to pre-scaled content");
                config.global_scaling.enabled = false;
            }
        } else if self.scaling_held.swap(false, Ordering::SeqCst) {
            self.scaling.release(self.id);
        }
        Ok(self.queue.queue_frame(id, z_order, layers, config)?)
    }

    /// Synthesise the Startup event and block for it to complete
    /// (hotplug-attach path).
    pub fn handle_hotplug_attach(&self, connection: Connection) -> Result<(), ComposerError> {
        let is_new = self.connection.lock().is_none();
        self.queue.queue_event(Event::Startup { connection, is_new });
        self.queue.flush(FrameId::invalid(), HOTPLUG_FLUSH_TIMEOUT)?;
        Ok(())
    }

    /// Synthesise the Shutdown event and block for it to complete
    /// (hotplug-detach path).
    pub fn handle_hotplug_detach(&self, release_timeline: u32) -> Result<(), ComposerError> {
        self.queue.queue_event(Event::Shutdown { release_timeline });
        self.queue.flush(FrameId::invalid(), HOTPLUG_FLUSH_TIMEOUT)?;
        Ok(())
    }

    /// Called from the controller's page-flip-complete callback. Retires the
    /// frame that was `current` before this completion and returns it to
    /// the queue's pool.
    pub fn notify_flip_complete(&self) -> Result<(), ComposerError> {
        if let Some(retired) = self.page_flip.page_flip_event()? {
            self.queue.release_frame(&retired);
        }
        Ok(())
    }

    fn run_recovery_sequence(&self, controller_caps_ok: bool) {
        if !self.recovering.load(Ordering::SeqCst) {
            return;
        }
        if !controller_caps_ok {
            return;
        }
        info!(display = %self.name, "running ESD recovery sequence");
        let _ = self.with_controller(|c| c.set_dpms(Dpms::Off));
        let _ = self.with_controller(|c| c.blank());
        let _ = self.with_controller(|c| c.set_dpms(Dpms::On));
        self.recovering.store(false, Ordering::SeqCst);
    }

    fn with_controller<T>(&self, f: impl FnOnce(&dyn DisplayController) -> Result<T, String>) -> Result<T, String> {
        f(self.page_flip.controller_ref())
    }
}

impl QueueDelegate for PhysicalDisplay {
    fn ready_for_next_work(&self) -> bool {
        // Gates only on the controller's single-flip-in-flight state;
        // lifecycle status is advanced by consuming events, so it must
        // never gate their consumption.
        let ready = self.page_flip.ready_for_flip();
        // A stuck flip the watchdog just force-completed needs its frame
        // returned to the pool even though no flip() call is imminent.
        for frame in self.page_flip.take_pending_releases() {
            self.queue.release_frame(&frame);
        }
        ready
    }

    fn wait_gpu_ready(&self, frame: &Frame, timeout_ms: u32) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms as u64);
        for layer in &frame.layers {
            let Some(fence) = &layer.acquire_fence else { continue };
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if !poll_readable(fence.as_raw_fd(), remaining.as_millis() as i32) {
                warn!(id = ?frame.id, "GPU rendering wait timed out for layer");
                return false;
            }
        }
        true
    }

    fn gpu_ready_now(&self, frame: &Frame) -> bool {
        frame.layers.iter().all(|layer| match &layer.acquire_fence {
            None => true,
            Some(fence) => poll_readable(fence.as_raw_fd(), 0),
        })
    }

    fn present(&self, frame: &FrameHandle) -> bool {
        self.run_recovery_sequence(true);
        self.buffer_manager.on_end_of_frame();
        match self.page_flip.flip(frame) {
            Ok((event_requested, retired)) => {
                for retired in &retired {
                    self.queue.release_frame(retired);
                }
                let mut status = self.status.lock();
                if *status == DisplayStatus::PendingStart {
                    *status = DisplayStatus::Available;
                }
                let _ = event_requested;
                true
            }
            Err(e) => {
                warn!(error = %e, "flip failed, retiring frame instead");
                self.retire(frame);
                false
            }
        }
    }

    fn retire(&self, frame: &FrameHandle) {
        if let Err(e) = self.page_flip.retire(frame) {
            warn!(error = %e, "retire failed");
        }
        self.queue.release_frame(frame);
    }

    fn consume_event(&self, event: &Event) {
        match event {
            Event::Startup { connection, is_new } => {
                info!(display = %self.name, is_new, "startup");
                *self.connection.lock() = Some(connection.clone());
                *self.status.lock() = DisplayStatus::PendingStart;
            }
            Event::Shutdown { release_timeline } => {
                info!(display = %self.name, "shutdown");
                let _ = self.with_controller(|c| c.blank());
                if let Err(e) = self.page_flip.release_to(*release_timeline) {
                    warn!(error = %e, "shutdown release_to failed");
                }
                let _ = self.with_controller(|c| c.set_dpms(Dpms::Off));
                if self.scaling_held.swap(false, Ordering::SeqCst) {
                    self.scaling.release(self.id);
                }
                *self.connection.lock() = None;
                *self.status.lock() = DisplayStatus::Shutdown;
            }
            Event::Suspend { release_timeline, use_dpms, deactivate: _ } => {
                info!(display = %self.name, "suspend");
                let _ = self.with_controller(|c| c.blank());
                if let Err(e) = self.page_flip.release_to(*release_timeline) {
                    warn!(error = %e, "suspend release_to failed");
                }
                if *use_dpms {
                    let _ = self.with_controller(|c| c.set_dpms(Dpms::Off));
                }
                *self.status.lock() = DisplayStatus::Suspended;
            }
            Event::Resume => {
                info!(display = %self.name, "resume");
                let _ = self.with_controller(|c| c.set_dpms(Dpms::On));
                *self.status.lock() = DisplayStatus::Available;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BufferHandle, DisplayConfig, FrameId, GlobalScaling, IRect, Layer, Rect};
    use crate::fence_ref::OwnedFenceReference;
    use crate::traits::tests_support::FakeAllocator;
    use crate::traits::{BufferDetails, DisplayCaps, PlaneCommit};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct FakeController;
    impl DisplayController for FakeController {
        fn caps(&self) -> DisplayCaps {
            DisplayCaps { atomic_commit: true, flip_event_from_any_plane: true, max_planes: 4 }
        }
        fn commit(&self, _request: &crate::traits::CommitRequest) -> Result<bool, String> {
            Ok(false)
        }
        fn set_dpms(&self, _mode: Dpms) -> Result<(), String> {
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

    struct NullComposer;
    impl Composer for NullComposer {
        fn prepare(&self, _layers: &crate::content::LayerStack) -> Vec<PlaneCommit> {
            Vec::new()
        }
    }

    fn blank_layer() -> Layer {
        Layer {
            handle: Some(BufferHandle(1)),
            device_id: 0,
            src_rect: Rect { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            dst_rect: IRect { x: 0, y: 0, w: 1, h: 1 },
            transform: crate::content::Transform::Identity,
            blend_mode: crate::content::BlendMode::None,
            plane_alpha: 1.0,
            is_video: false,
            is_encrypted: false,
            is_front_buffer_rendered: false,
            acquire_fence: None,
            release_fence_ref: OwnedFenceReference::Native,
        }
    }

    fn test_display() -> Arc<PhysicalDisplay> {
        let buffer_manager = Arc::new(BufferManager::new(Arc::new(FakeAllocator::default())));
        PhysicalDisplay::new(
            0,
            "test",
            Arc::new(FakeController),
            Arc::new(NullComposer),
            buffer_manager,
            GlobalScalingArbiter::new(),
        )
    }

    #[test]
    fn startup_moves_status_to_pending_start() {
        let display = test_display();
        display.start();
        display
            .handle_hotplug_attach(Connection { connector_id: 1, crtc_id: 1, pipe_index: 0, has_pipe: true, connected: true })
            .unwrap();
        assert_eq!(display.status(), DisplayStatus::PendingStart);
        display.shutdown_worker();
    }

    #[test]
    fn first_frame_after_startup_moves_to_available() {
        let display = test_display();
        display.start();
        display
            .handle_hotplug_attach(Connection { connector_id: 1, crtc_id: 1, pipe_index: 0, has_pipe: true, connected: true })
            .unwrap();
        let config = DisplayConfig { width: 1920, height: 1080, refresh_hz: 60, global_scaling: Default::default() };
        display.queue_frame(FrameId::new(1, 1, 0), 0, vec![blank_layer()], config).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while display.status() != DisplayStatus::Available && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(display.status(), DisplayStatus::Available);
        display.shutdown_worker();
    }

    #[test]
    fn global_scaling_is_exclusive_per_family() {
        let arbiter = GlobalScalingArbiter::new();
        assert!(arbiter.acquire(0));
        assert!(!arbiter.acquire(1), "second display must be rejected while first holds it");
        arbiter.release(0);
        assert!(arbiter.acquire(1));
    }

    #[test]
    fn queue_frame_acquires_scaling_and_releases_once_unused() {
        let arbiter = GlobalScalingArbiter::new();
        let buffer_manager = Arc::new(BufferManager::new(Arc::new(FakeAllocator::default())));
        let display = PhysicalDisplay::new(0, "a", Arc::new(FakeController), Arc::new(NullComposer), buffer_manager, arbiter.clone());

        let scaling_config = DisplayConfig {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            global_scaling: GlobalScaling { enabled: true, src_w: 1280, src_h: 720, dst_x: 0, dst_y: 0, dst_w: 1920, dst_h: 1080 },
        };
        display.queue_frame(FrameId::new(1, 1, 0), 0, Vec::new(), scaling_config).unwrap();
        assert!(!arbiter.acquire(1), "display 0 must still hold the panel fitter");

        let plain_config = DisplayConfig { width: 1920, height: 1080, refresh_hz: 60, global_scaling: Default::default() };
        display.queue_frame(FrameId::new(2, 2, 0), 0, Vec::new(), plain_config).unwrap();
        assert!(arbiter.acquire(1), "display 0 must give up the panel fitter once it stops using it");
    }

    #[test]
    fn queue_frame_falls_back_to_pre_scaling_when_panel_fitter_is_taken() {
        let arbiter = GlobalScalingArbiter::new();
        assert!(arbiter.acquire(99), "another display already holds the panel fitter");

        let buffer_manager = Arc::new(BufferManager::new(Arc::new(FakeAllocator::default())));
        let display = PhysicalDisplay::new(0, "a", Arc::new(FakeController), Arc::new(NullComposer), buffer_manager, arbiter.clone());
        let scaling_config = DisplayConfig {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            global_scaling: GlobalScaling { enabled: true, ..Default::default() },
        };
        display.queue_frame(FrameId::new(1, 1, 0), 0, Vec::new(), scaling_config).unwrap();
        assert!(!arbiter.acquire(0), "display 0 must not have been granted the panel fitter");
    }

    #[test]
    fn shutdown_worker_drops_any_frames_left_queued() {
        let display = test_display();
        let config = DisplayConfig { width: 0, height: 0, refresh_hz: 0, global_scaling: Default::default() };
        display.queue_frame(FrameId::new(1, 1, 0), 0, Vec::new(), config).unwrap();
        assert_eq!(display.queue().pool_in_use(), 1);
        display.shutdown_worker();
        assert_eq!(display.queue().pool_in_use(), 0);
    }
}
