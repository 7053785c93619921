// `flip()`/`page_flip_event()` run on different threads (the display worker
// and the controller's event thread respectively); both paths take the same
// lock, so the state transitions below are linearised regardless of which
// side observes them first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::FlipError;
use crate::queue::{Frame, FrameHandle};
use crate::timeline::Timeline;
use crate::traits::{CommitRequest, Composer, DisplayController, PlaneCommit};

/// 1s watchdog on an outstanding commit.
const FLIP_WATCHDOG: Duration = Duration::from_secs(1);

struct State {
    current: Option<FrameHandle>,
    last_flipped: Option<FrameHandle>,
    flip_in_flight_since: Option<Instant>,
}

/// Holds the "at most one flip in flight" invariant demanded by the
/// underlying kernel interface.
pub struct PageFlipHandler {
    timeline: Arc<Timeline>,
    controller: Arc<dyn DisplayController>,
    composer: Arc<dyn Composer>,
    state: Mutex<State>,
    completed: Condvar,
    /// Frames retired by a watchdog-forced completion. Neither watchdog site
    /// (`ready_for_flip`, `sync`) has a return channel of its own, so they
    /// stash the retired frame here for the next caller that can actually
    /// return it to the queue's pool.
    pending_release: Mutex<Vec<FrameHandle>>,
    /// Detected once, on first use, by issuing a no-op commit.
    atomic_capable: std::sync::OnceLock<bool>,
}

impl PageFlipHandler {
    pub fn new(timeline: Arc<Timeline>, controller: Arc<dyn DisplayController>, composer: Arc<dyn Composer>) -> Self {
        Self {
            timeline,
            controller,
            composer,
            state: Mutex::new(State { current: None, last_flipped: None, flip_in_flight_since: None }),
            completed: Condvar::new(),
            pending_release: Mutex::new(Vec::new()),
            atomic_capable: std::sync::OnceLock::new(),
        }
    }

    /// Drain frames a watchdog forced into retirement since the last drain.
    pub fn take_pending_releases(&self) -> Vec<FrameHandle> {
        std::mem::take(&mut *self.pending_release.lock())
    }

    fn uses_atomic(&self) -> bool {
        *self.atomic_capable.get_or_init(|| self.controller.caps().atomic_commit)
    }

    pub fn register_next_future_frame(&self) -> Result<(std::os::fd::OwnedFd, u32), FlipError> {
        self.timeline.create_fence().map_err(|e| FlipError::CommitRejected(e.to_string()))
    }

    pub fn register_repeat_future_frame(&self) -> Result<(std::os::fd::OwnedFd, u32), FlipError> {
        self.timeline.repeat_fence().map_err(|e| FlipError::CommitRejected(e.to_string()))
    }

    pub fn release_to(&self, slot: u32) -> Result<(), FlipError> {
        self.timeline.advance_to(slot).map_err(|e| FlipError::CommitRejected(e.to_string()))
    }

    pub(crate) fn controller_ref(&self) -> &dyn DisplayController {
        self.controller.as_ref()
    }

    /// False while a commit is outstanding; force-completes past the 1s
    /// watchdog under the assumption the controller lost the event.
    pub fn ready_for_flip(&self) -> bool {
        let mut state = self.state.lock();
        match state.flip_in_flight_since {
            None => true,
            Some(since) if since.elapsed() >= FLIP_WATCHDOG => {
                warn!(elapsed = ?since.elapsed(), "flip watchdog fired, forcing completion");
                if let Some(retired) = self.complete_locked(&mut state) {
                    self.pending_release.lock().push(retired);
                }
                true
            }
            Some(_) => false,
        }
    }

    fn sync(&self) {
        let deadline = Instant::now() + FLIP_WATCHDOG;
        let mut state = self.state.lock();
        while state.flip_in_flight_since.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("sync() watchdog fired while waiting on prior flip");
                if let Some(retired) = self.complete_locked(&mut state) {
                    self.pending_release.lock().push(retired);
                }
                break;
            }
            self.completed.wait_for(&mut state, remaining);
        }
    }

    /// Program the controller with `frame`'s layers. Returns whether a
    /// flip-complete event was validly requested, plus every frame the
    /// caller must now return to the queue's pool: the previously-`current`
    /// frame if this flip retired it on the spot (the no-event path, where no
    /// completion will ever arrive), and/or a frame `sync()` force-retired
    /// above while waiting out a stuck prior flip.
    pub fn flip(&self, frame: &FrameHandle) -> Result<(bool, Vec<FrameHandle>), FlipError> {
        self.sync();

        let request = {
            let f = frame.lock();
            self.build_commit(&f)
        };

        let event_requested = self
            .controller
            .commit(&request)
            .map_err(FlipError::CommitRejected)?;

        let mut state = self.state.lock();
        let retired = if event_requested {
            state.last_flipped = Some(frame.clone());
            state.flip_in_flight_since = Some(Instant::now());
            None
        } else {
            state.current.replace(frame.clone())
        };
        drop(state);

        let mut to_release = self.take_pending_releases();
        to_release.extend(retired);
        debug!(event_requested, released = to_release.len(), "flip issued");
        Ok((event_requested, to_release))
    }

    fn build_commit(&self, frame: &Frame) -> CommitRequest {
        let planes: Vec<PlaneCommit> = self.composer.prepare(&frame.layers);
        CommitRequest {
            crtc_id: 0,
            planes,
            panel_fitter: if frame.config.global_scaling.enabled {
                Some(crate::traits::PanelFitter::Manual)
            } else {
                None
            },
        }
    }

    /// Advance the timeline to `frame`'s slot without flipping, used when
    /// the queue decides to skip it.
    pub fn retire(&self, frame: &FrameHandle) -> Result<(), FlipError> {
        let slot = frame.lock().retire_slot;
        self.release_to(slot)
    }

    /// Called from the controller's event thread on commit-complete. Returns
    /// the previously-`current` frame, now retired, so the caller can return
    /// it to the queue's pool.
    pub fn page_flip_event(&self) -> Result<Option<FrameHandle>, FlipError> {
        let mut state = self.state.lock();
        if state.last_flipped.is_none() {
            return Err(FlipError::SpuriousCompletion);
        }
        Ok(self.complete_locked(&mut state))
    }

    /// Returns the frame that was `current` before this completion, now
    /// fully retired and eligible to return to the queue's pool.
    fn complete_locked(&self, state: &mut State) -> Option<FrameHandle> {
        let Some(last_flipped) = state.last_flipped.take() else {
            return None;
        };
        let retire_to = last_flipped.lock().retire_slot.wrapping_sub(1);
        if let Err(e) = self.timeline.advance_to(retire_to) {
            warn!(error = %e, "timeline advance on page_flip_event failed");
        }
        let retired = state.current.replace(last_flipped);
        state.flip_in_flight_since = None;
        self.completed.notify_all();
        retired
    }

    pub fn current(&self) -> Option<FrameHandle> {
        self.state.lock().current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{DisplayConfig, FrameId};
    use crate::queue::FrameState;
    use crate::timeline::PipeSyncBackend;
    use crate::traits::{DisplayCaps, Dpms};

    #[derive(Debug, Default)]
    struct FakeController {
        event_on_commit: std::sync::atomic::AtomicBool,
        commits: std::sync::Mutex<u32>,
    }

    impl DisplayController for FakeController {
        fn caps(&self) -> DisplayCaps {
            DisplayCaps { atomic_commit: true, flip_event_from_any_plane: false, max_planes: 4 }
        }
        fn commit(&self, _request: &CommitRequest) -> Result<bool, String> {
            *self.commits.lock().unwrap() += 1;
            Ok(self.event_on_commit.load(std::sync::atomic::Ordering::SeqCst))
        }
        fn set_dpms(&self, _mode: Dpms) -> Result<(), String> {
            Ok(())
        }
        fn blank(&self) -> Result<(), String> {
            Ok(())
        }
        fn create_framebuffer(&self, _details: &crate::traits::BufferDetails, _wants_blend: bool) -> Result<u64, String> {
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

    fn handler_with(event_on_commit: bool) -> (PageFlipHandler, Arc<FakeController>) {
        let backend = PipeSyncBackend::new();
        let timeline = Arc::new(Timeline::new("t", backend));
        let controller = Arc::new(FakeController { event_on_commit: std::sync::atomic::AtomicBool::new(event_on_commit), ..Default::default() });
        let handler = PageFlipHandler::new(timeline, controller.clone(), Arc::new(NullComposer));
        (handler, controller)
    }

    fn blank_frame(slot: u32) -> FrameHandle {
        Arc::new(parking_lot::Mutex::new(Frame {
            id: FrameId::new(slot, slot, 0),
            z_order: 0,
            layers: Vec::new(),
            config: DisplayConfig { width: 0, height: 0, refresh_hz: 0, global_scaling: Default::default() },
            state: FrameState::Queued,
            valid: true,
            retire_slot: slot,
        }))
    }

    #[test]
    fn flip_with_event_leaves_ready_for_flip_false_until_completion() {
        let (handler, _controller) = handler_with(true);
        let frame = blank_frame(1);
        let (event_requested, retired) = handler.flip(&frame).unwrap();
        assert!(event_requested);
        assert!(retired.is_empty());
        assert!(!handler.ready_for_flip());
        handler.page_flip_event().unwrap();
        assert!(handler.ready_for_flip());
        assert!(Arc::ptr_eq(&handler.current().unwrap(), &frame));
    }

    #[test]
    fn flip_without_event_is_immediately_ready() {
        let (handler, _controller) = handler_with(false);
        let frame = blank_frame(1);
        let (event_requested, retired) = handler.flip(&frame).unwrap();
        assert!(!event_requested);
        assert!(retired.is_empty());
        assert!(handler.ready_for_flip());
        assert!(Arc::ptr_eq(&handler.current().unwrap(), &frame));
    }

    #[test]
    fn flip_without_event_retires_the_previous_current_frame() {
        let (handler, _controller) = handler_with(false);
        let first = blank_frame(1);
        let second = blank_frame(2);
        let (_, retired) = handler.flip(&first).unwrap();
        assert!(retired.is_empty());
        let (_, retired) = handler.flip(&second).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(Arc::ptr_eq(&retired[0], &first));
        assert!(Arc::ptr_eq(&handler.current().unwrap(), &second));
    }

    #[test]
    fn spurious_completion_is_an_error() {
        let (handler, _controller) = handler_with(true);
        assert!(matches!(handler.page_flip_event(), Err(FlipError::SpuriousCompletion)));
    }

    #[test]
    fn sync_watchdog_surfaces_the_stuck_frame_through_the_next_flip() {
        let (handler, _controller) = handler_with(true);
        let first = blank_frame(1);
        let second = blank_frame(2);
        let third = blank_frame(3);

        handler.flip(&first).unwrap();
        handler.page_flip_event().unwrap();
        assert!(Arc::ptr_eq(&handler.current().unwrap(), &first));

        handler.flip(&second).unwrap();
        // No page_flip_event ever arrives for `second`; flip(&third) must
        // wait out sync()'s watchdog and surface `first`'s forced retirement
        // rather than silently dropping it.
        let (_, retired) = handler.flip(&third).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(Arc::ptr_eq(&retired[0], &first));
        assert!(Arc::ptr_eq(&handler.current().unwrap(), &second));
    }
}
