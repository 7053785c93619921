// Monotonic per-display retire timeline and the fence machinery layered on
// top of it.
//
// The timeline itself is backed by a `SyncBackend` so the core stays
// agnostic to the concrete kernel sync primitive. The default
// `PipeSyncBackend` realises fences as the read end of a dedicated pipe per
// point, a real, working fd-based fence rather than a test double, and is
// what both the test suite and `DisplayController` implementations that
// don't bring their own hardware timeline should use.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::TimelineError;

/// A kernel-level fence descriptor. `-1` (absent) is never represented here;
/// instead the absence of a fence is `None` at the call site rather than a
/// reused sentinel integer.
pub type NativeFence = OwnedFd;

/// Backend that actually creates and signals fence points. One instance is
/// shared by all [`Timeline`]s that want the same underlying sync device;
/// most displays each own one.
pub trait SyncBackend: Send + Sync + fmt::Debug {
    /// Create a fence that becomes readable once the backend's timeline
    /// reaches `point`.
    fn create_fence_at(&self, point: u32) -> io::Result<NativeFence>;

    /// Advance the backend's timeline to `point`, releasing every fence
    /// created at or before it.
    fn advance_to(&self, point: u32) -> io::Result<()>;
}

/// A [`SyncBackend`] built from a pipe per pending point. `advance_to`
/// closes (after writing a sentinel byte to) every pipe whose point has been
/// reached, which is observable via `poll`/`select` exactly like a real
/// kernel fence fd.
#[derive(Debug, Default)]
pub struct PipeSyncBackend {
    pending: Mutex<Vec<(u32, OwnedFd)>>,
}

impl PipeSyncBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SyncBackend for PipeSyncBackend {
    fn create_fence_at(&self, point: u32) -> io::Result<NativeFence> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        self.pending.lock().push((point, write_fd));
        Ok(read_fd)
    }

    fn advance_to(&self, point: u32) -> io::Result<()> {
        let mut pending = self.pending.lock();
        let mut remaining = Vec::with_capacity(pending.len());
        for (at, write_fd) in pending.drain(..) {
            if at <= point {
                // Writing (and dropping) signals readability on the read end.
                // The write end closing also unblocks a blocked reader.
                let _ = nix::unistd::write(&write_fd, &[0u8]);
                drop(write_fd);
            } else {
                remaining.push((at, write_fd));
            }
        }
        *pending = remaining;
        Ok(())
    }
}

/// Monotonic per-display timeline.
///
/// Invariant: `current <= next_future`; `next_future` only increases.
pub struct Timeline {
    name: String,
    backend: Arc<dyn SyncBackend>,
    current: AtomicU32,
    next_future: AtomicU32,
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("name", &self.name)
            .field("current", &self.current.load(Ordering::SeqCst))
            .field("next_future", &self.next_future.load(Ordering::SeqCst))
            .finish()
    }
}

impl Timeline {
    pub fn new(name: impl Into<String>, backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            current: AtomicU32::new(0),
            next_future: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn next_future(&self) -> u32 {
        self.next_future.load(Ordering::SeqCst)
    }

    /// Allocate a new future slot and return a fence that signals when
    /// `current` reaches it.
    pub fn create_fence(&self) -> Result<(NativeFence, u32), TimelineError> {
        let slot = self.next_future.fetch_add(1, Ordering::SeqCst) + 1;
        let fence = self
            .backend
            .create_fence_at(slot)
            .map_err(|e| TimelineError::NativeFenceFailed(e.to_string()))?;
        Ok((fence, slot))
    }

    /// Return a fence on the most-recently-allocated slot without bumping
    /// the slot counter, used to give a dropped frame the same retire
    /// signal as the frame it was coalesced into.
    pub fn repeat_fence(&self) -> Result<(NativeFence, u32), TimelineError> {
        let slot = self.next_future.load(Ordering::SeqCst);
        let fence = self
            .backend
            .create_fence_at(slot)
            .map_err(|e| TimelineError::NativeFenceFailed(e.to_string()))?;
        Ok((fence, slot))
    }

    /// Signal every fence on slots `(current, current+n]`.
    pub fn advance(&self, n: u32) -> Result<(), TimelineError> {
        let target = self.current.load(Ordering::SeqCst).wrapping_add(n);
        self.advance_to(target)
    }

    /// Advance so `current == absolute`. A programming error to call with
    /// `absolute < current`; surfaces as a typed error rather than a panic
    /// since the caller may be driven by external input.
    pub fn advance_to(&self, absolute: u32) -> Result<(), TimelineError> {
        let current = self.current.load(Ordering::SeqCst);
        if (absolute.wrapping_sub(current) as i32) < 0 {
            return Err(TimelineError::NonMonotonicAdvance {
                current,
                requested: absolute,
            });
        }
        self
            .backend
            .advance_to(absolute)
            .map_err(|e| TimelineError::NativeFenceFailed(e.to_string()))?;
        self.current.store(absolute, Ordering::SeqCst);
        Ok(())
    }
}

/// A fence augmented with a "bound contributor" refcount so a subsystem that
/// is still waiting on it can be cancelled by another without blocking on
/// signalling.
///
/// Distinct from [`NativeFence`]: a raw fd is *a* fence; `Fence` is the
/// reference-counted wrapper the composer hands out for fences that may be
/// composed of multiple contributors (merged) and cancelled early.
pub struct Fence {
    native: Mutex<Vec<OwnedFd>>,
    bound_refs: AtomicI32,
    signalled: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("native_fds", &self.native.lock().iter().map(AsRawFd::as_raw_fd).collect::<Vec<RawFd>>())
            .field("bound_refs", &self.bound_refs.load(Ordering::SeqCst))
            .field("signalled", &self.signalled.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    /// An *unset* fence: no native fd, zero references.
    pub fn new() -> Self {
        Self {
            native: Mutex::new(Vec::new()),
            bound_refs: AtomicI32::new(0),
            signalled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Combine `other` into this fence; the resulting fence resolves only
    /// once both have. Increments the bound-reference count.
    pub fn merge(&self, other: NativeFence) {
        self.native.lock().push(other);
        self.bound_refs.fetch_add(1, Ordering::SeqCst);
        self.signalled.store(false, Ordering::SeqCst);
    }

    /// Decrement the bound-reference count without waiting for signalling.
    /// Once the count reaches zero the fence becomes non-blocking.
    pub fn cancel(&self) {
        let prev = self.bound_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "Fence::cancel called with no bound references");
    }

    pub fn bound_refs(&self) -> i32 {
        self.bound_refs.load(Ordering::SeqCst)
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Non-blocking check: a refcount of zero always reads as "not
    /// blocking"; otherwise poll every bound native fd for readability.
    pub fn check(&self) -> bool {
        if self.bound_refs.load(Ordering::SeqCst) <= 0 {
            self.signalled.store(true, Ordering::SeqCst);
            return true;
        }
        let fds = self.native.lock();
        let all_ready = fds.iter().all(|fd| poll_readable(fd.as_raw_fd(), 0));
        if all_ready {
            self.signalled.store(true, Ordering::SeqCst);
        }
        all_ready
    }

    /// Block up to `timeout_ms` for the fence to stop blocking.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        if self.check() {
            return true;
        }
        let fds = self.native.lock();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64);
        for fd in fds.iter() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if !poll_readable(fd.as_raw_fd(), remaining.as_millis() as i32) {
                return false;
            }
        }
        self.signalled.store(true, Ordering::SeqCst);
        true
    }
}

pub(crate) fn poll_readable(fd: RawFd, timeout_ms: i32) -> bool {
    use nix::poll::{PollFd, PollFlags, PollTimeout};
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = if timeout_ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::from(timeout_ms as u16)
    };
    matches!(nix::poll::poll(&mut fds, timeout), Ok(n) if n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_fence_signals_only_after_advance() {
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        let (fence, slot) = timeline.create_fence().unwrap();
        assert_eq!(slot, 1);
        assert!(!poll_readable(fence.as_raw_fd(), 0));
        timeline.advance(1).unwrap();
        assert!(poll_readable(fence.as_raw_fd(), 50));
    }

    #[test]
    fn repeat_fence_does_not_bump_slot_counter() {
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        let (_f1, slot1) = timeline.create_fence().unwrap();
        let (_f2, slot2) = timeline.repeat_fence().unwrap();
        assert_eq!(slot1, slot2);
        assert_eq!(timeline.next_future(), 1);
    }

    #[test]
    fn advance_to_signals_every_slot_up_to_target() {
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        let (f1, _) = timeline.create_fence().unwrap();
        let (f2, _) = timeline.create_fence().unwrap();
        let (f3, _) = timeline.create_fence().unwrap();
        timeline.advance_to(2).unwrap();
        assert!(poll_readable(f1.as_raw_fd(), 50));
        assert!(poll_readable(f2.as_raw_fd(), 50));
        assert!(!poll_readable(f3.as_raw_fd(), 0));
    }

    #[test]
    fn advance_to_rejects_going_backwards() {
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        timeline.advance_to(5).unwrap();
        let err = timeline.advance_to(3).unwrap_err();
        assert!(matches!(err, TimelineError::NonMonotonicAdvance { current: 5, requested: 3 }));
    }

    #[test]
    fn fence_cancel_before_signal_makes_it_non_blocking() {
        let fence = Fence::new();
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        let (native, _slot) = timeline.create_fence().unwrap();
        fence.merge(native);
        assert_eq!(fence.bound_refs(), 1);
        assert!(!fence.check());
        fence.cancel();
        assert_eq!(fence.bound_refs(), 0);
        assert!(fence.check());
    }

    #[test]
    fn fence_merge_waits_for_all_contributors() {
        let backend = PipeSyncBackend::new();
        let timeline = Timeline::new("test", backend);
        let fence = Fence::new();
        let (f1, _) = timeline.create_fence().unwrap();
        let (f2, _) = timeline.create_fence().unwrap();
        fence.merge(f1);
        fence.merge(f2);
        assert_eq!(fence.bound_refs(), 2);
        timeline.advance(1).unwrap();
        assert!(!fence.check(), "second contributor still outstanding");
        timeline.advance(1).unwrap();
        assert!(fence.check());
    }
}
