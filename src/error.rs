use thiserror::Error;

/// The complete error taxonomy propagated out of the core.
///
/// `ClientStalled` and `Cancelled` are internal/cooperative and are never
/// returned from `Registry::connect` — see the propagation policy in
/// `registry`/`live_stream`.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("no tuner available after preemption attempts")]
    NoTunerAvailable,

    #[error("channel not found on backend: {0}")]
    ChannelNotFound(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("encoder {0:?} unsupported on this hardware: {1}")]
    EncoderUnsupported(crate::model::EncoderKind, String),

    #[error("encoder failed to start: {0}")]
    EncoderStartFailed(String),

    #[error("encoder froze, retries exhausted")]
    EncoderFroze,

    #[error("encoder stderr matched a fatal pattern: {0}")]
    EncoderFatalLog(String),

    /// Internal: consumed by Fan-out eviction, never surfaces to a caller.
    #[error("client stalled")]
    ClientStalled,

    /// Internal: cooperative cancellation, maps to a no-op at the HTTP boundary.
    #[error("cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;
