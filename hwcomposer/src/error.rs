// Error taxonomy for the composer core.
//
// In-frame failures (transient driver errors, buffer import failures, sync
// timeouts) are never propagated out of `crate::queue::DisplayQueue`'s
// worker loop as `Err`; they are logged and folded into a "retire, don't
// flip" decision. Only out-of-frame failures (lifecycle transitions,
// programming errors) surface as `Result<_, ComposerError>` to callers.

use thiserror::Error;

/// Errors raised while programming the display controller or waiting on its
/// completion events.
#[derive(Debug, Error)]
pub enum FlipError {
    #[error("no flip event could be requested: {0}")]
    EventRequestFailed(String),

    #[error("controller commit rejected: {0}")]
    CommitRejected(String),

    #[error("flip-complete watchdog fired after {0:?}")]
    WatchdogTimeout(std::time::Duration),

    #[error("page_flip_event received with no outstanding commit")]
    SpuriousCompletion,
}

/// Errors raised importing or tracking buffers.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("framebuffer import rejected for format {format:?}: {reason}")]
    ImportRejected { format: u32, reason: String },

    #[error("buffer handle is unknown to the manager")]
    UnknownHandle,
}

/// Errors raised by [`crate::timeline::Timeline`].
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("advance_to({requested}) precedes current position {current}")]
    NonMonotonicAdvance { current: u32, requested: u32 },

    #[error("native fence creation failed: {0}")]
    NativeFenceFailed(String),
}

/// Errors raised by [`crate::queue::DisplayQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no free frame slot and no droppable frame exists")]
    NoFreeFrame,

    #[error("flush refused: consumer is blocked in a critical section")]
    ConsumerBlocked,

    #[error("flush must not be called from the display's own worker thread")]
    FlushFromWorker,

    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

/// Top-level error type for the composer core; every narrower error type
/// converts into this via `#[from]`, matching the host codebase's pattern of
/// layering `RenderError`/`BindError`/`auth::error::Error` under one surface.
#[derive(Debug, Error)]
pub enum ComposerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Flip(#[from] FlipError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("ordering invariant violated: {0}")]
    OrderingViolation(String),

    #[error("display is not in a state that permits this operation: {0}")]
    InvalidLifecycleState(String),
}
