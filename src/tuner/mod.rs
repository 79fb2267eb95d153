//! Tuner Adapter (C1): reserves a physical tuner on the external backend and
//! exposes a byte-stream reader delivering MPEG-TS for one set of broadcast
//! coordinates.
//!
//! Two concrete backends exist (`edcb`, `http_backend`); both are reached
//! through the `TunerHandle` struct below rather than through a trait
//! object — nothing in this codebase's reference corpus uses `async-trait`,
//! and a handle's `reader`/`close`/`handoff` surface is small enough that a
//! plain enum dispatch reads better than an object-safe trait would.

pub mod edcb;
pub mod http_backend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{BackendKind, TunerConfig};
use crate::error::{CoreError, CoreResult};
use crate::model::{ChannelCoordinates, LiveStreamId};

pub type TsReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerLifecycle {
    Opening,
    Open,
    Cancelling,
    Closed,
}

enum Backend {
    Edcb(edcb::EdcbSession),
    Http(http_backend::HttpSession),
}

/// A reserved tuner session, shared (via `Arc`) between the `LiveStream` that
/// holds it and, transiently, the Registry during a hand-off.
pub struct TunerHandle {
    pub coordinates: ChannelCoordinates,
    pub logical_id: u32,
    lifecycle: StdMutex<TunerLifecycle>,
    locked: AtomicBool,
    owner: StdMutex<LiveStreamId>,
    reader: Mutex<Option<TsReader>>,
    backend: Backend,
}

impl TunerHandle {
    pub fn lifecycle(&self) -> TunerLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub fn set_state(&self, state: TunerLifecycle) {
        *self.lifecycle.lock().unwrap() = state;
    }

    pub fn owner(&self) -> LiveStreamId {
        self.owner.lock().unwrap().clone()
    }

    /// Cooperative flag preventing concurrent reuse by the Arbiter; does not
    /// itself block anything, callers must check it.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.lifecycle() == TunerLifecycle::Closed
    }

    /// Takes ownership of the reader, leaving `None` behind. Called exactly
    /// once by the Ingest loop when the Encoder Supervisor starts.
    pub async fn take_reader(&self) -> Option<TsReader> {
        self.reader.lock().await.take()
    }

    /// Re-assigns ownership without closing the backend session, per the
    /// "reuse ≠ re-parenting" design note: produces no new handle, but the
    /// caller (Registry) treats this handle as now belonging to `to`.
    pub fn handoff(&self, from: &LiveStreamId, to: &LiveStreamId) -> bool {
        let mut owner = self.owner.lock().unwrap();
        if *owner != *from {
            return false;
        }
        if self.lifecycle() == TunerLifecycle::Closed {
            return false;
        }
        *owner = to.clone();
        info!(%from, %to, logical_id = self.logical_id, "tuner handed off");
        true
    }

    /// Disconnects the stream reader without tearing down the backend
    /// reservation — used during pre-emption hand-off.
    pub async fn disconnect_stream(&self) {
        match &self.backend {
            Backend::Edcb(s) => s.disconnect_stream().await,
            Backend::Http(s) => s.disconnect_stream().await,
        }
        *self.reader.lock().await = None;
    }

    /// Fully releases the tuner at the backend. Idempotent.
    pub async fn close(&self) {
        if self.lifecycle() == TunerLifecycle::Closed {
            return;
        }
        match &self.backend {
            Backend::Edcb(s) => s.close().await,
            Backend::Http(s) => s.close().await,
        }
        self.set_state(TunerLifecycle::Closed);
    }
}

/// Factory for tuner handles; selects between the two backends once, at
/// construction, per `TunerConfig::backend`.
#[derive(Clone)]
pub enum TunerAdapter {
    Edcb(edcb::EdcbAdapter),
    Http(http_backend::HttpAdapter),
}

impl TunerAdapter {
    pub fn new(config: &TunerConfig, http_client: reqwest::Client) -> Self {
        let use_http = config.backend == BackendKind::Http || config.always_use_http_backend_for_tv;
        if use_http {
            TunerAdapter::Http(http_backend::HttpAdapter::new(
                config.backend_endpoint.clone(),
                http_client,
            ))
        } else {
            TunerAdapter::Edcb(edcb::EdcbAdapter::new(config.backend_endpoint.clone()))
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, TunerAdapter::Http(_))
    }

    /// Opens a tuner for `coordinates` and binds it to `owner`.
    ///
    /// Retries for up to 5 s, backing off from 100 ms to 1 s, matching the
    /// tuner-open retry window in spec.md §5.
    pub async fn open(
        &self,
        coordinates: ChannelCoordinates,
        owner: LiveStreamId,
    ) -> CoreResult<TunerHandle> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut backoff = Duration::from_millis(100);
        loop {
            let attempt = match self {
                TunerAdapter::Edcb(a) => a.try_open(coordinates).await,
                TunerAdapter::Http(a) => a.try_open(coordinates).await,
            };
            match attempt {
                Ok((backend, reader, logical_id)) => {
                    return Ok(TunerHandle {
                        coordinates,
                        logical_id,
                        lifecycle: StdMutex::new(TunerLifecycle::Open),
                        locked: AtomicBool::new(false),
                        owner: StdMutex::new(owner),
                        reader: Mutex::new(Some(reader)),
                        backend,
                    });
                }
                Err(CoreError::NoTunerAvailable) if tokio::time::Instant::now() < deadline => {
                    warn!(?coordinates, ?backoff, "tuner busy, retrying open");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

type OpenOutcome = (Backend, TsReader, u32);

/// Builds a `TunerHandle` backed by a no-op HTTP session, for `registry`
/// tests that exercise preemption/hand-off without a real backend
/// connection. Not reachable outside `#[cfg(test)]`.
#[cfg(test)]
pub(crate) fn test_handle(coordinates: ChannelCoordinates, logical_id: u32, owner: LiveStreamId) -> TunerHandle {
    TunerHandle {
        coordinates,
        logical_id,
        lifecycle: StdMutex::new(TunerLifecycle::Open),
        locked: AtomicBool::new(false),
        owner: StdMutex::new(owner),
        reader: Mutex::new(Some(Box::new(tokio::io::empty()) as TsReader)),
        backend: Backend::Http(http_backend::test_session()),
    }
}
