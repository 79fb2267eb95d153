//! Live Stream (C4): per-(channel, quality) coordinator owning the state
//! machine, a Tuner Adapter handle, the running Encoder Supervisor, and
//! Client Fan-out.
//!
//! Grounded on `LiveStream.py`'s `setStatus`/`getStatus`/`connect`, with the
//! `tuner_lock` re-expressed as a single `tokio::sync::Mutex` guarding state
//! and tuner together so invariant 2 (state implies tuner/encoder presence)
//! never observes a torn update.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::fanout::FanOut;
use crate::metrics::STREAM_ONAIR;
use crate::model::{ChannelCoordinates, LiveStreamId, StreamOptions};
use crate::tuner::TunerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Offline,
    Standby,
    OnAir,
    Idling,
    Restart,
}

impl State {
    pub fn has_tuner(&self) -> bool {
        matches!(self, State::Standby | State::OnAir | State::Idling)
    }
}

struct Inner {
    state: State,
    detail: String,
    started_at: Option<Instant>,
    updated_at: Instant,
    stream_data_written_at: Instant,
    tuner: Option<Arc<TunerHandle>>,
    has_encoder_task: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStreamStatus {
    pub state: State,
    pub detail: String,
    pub started_at_elapsed_secs: Option<f64>,
    pub updated_at_elapsed_secs: f64,
    pub client_count: usize,
}

pub struct LiveStream {
    pub id: LiveStreamId,
    pub coordinates: ChannelCoordinates,
    pub options: StreamOptions,
    pub fanout: FanOut,
    inner: Mutex<Inner>,
    retry_count: AtomicU32,
}

/// Per-LiveStream restart budget (spec.md §4.2).
pub const MAX_RETRY_COUNT: u32 = 5;

impl LiveStream {
    pub fn new(id: LiveStreamId, coordinates: ChannelCoordinates, options: StreamOptions) -> Self {
        let now = Instant::now();
        let fanout = FanOut::new(id.to_string());
        Self {
            id,
            coordinates,
            options,
            fanout,
            inner: Mutex::new(Inner {
                state: State::Offline,
                detail: "offline".to_string(),
                started_at: None,
                updated_at: now,
                stream_data_written_at: now,
                tuner: None,
                has_encoder_task: false,
            }),
            retry_count: AtomicU32::new(0),
        }
    }

    /// Sets `(state, detail)`, applying the invariants from spec.md §4.4:
    /// same `(state, detail)` twice is a no-op; `Offline → Restart` is
    /// disallowed; `started_at`/`stream_data_written_at` reset only on
    /// `(Offline | Restart) → Standby`. Returns whether anything changed.
    pub async fn set_status(&self, state: State, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        let mut inner = self.inner.lock().await;

        if inner.state == state && inner.detail == detail {
            return false;
        }
        if inner.state == State::Offline && state == State::Restart {
            tracing::warn!(live_stream_id = %self.id, "rejected disallowed Offline -> Restart transition");
            return false;
        }

        let now = Instant::now();
        let entering_standby_from_reset =
            matches!(inner.state, State::Offline | State::Restart) && state == State::Standby;

        if state == State::OnAir && inner.state == State::Standby {
            if let Some(started_at) = inner.started_at {
                info!(
                    live_stream_id = %self.id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Standby -> ONAir"
                );
            }
        }

        inner.state = state;
        inner.detail = detail;
        inner.updated_at = now;
        if entering_standby_from_reset {
            inner.started_at = Some(now);
            inner.stream_data_written_at = now;
        }
        STREAM_ONAIR
            .with_label_values(&[&self.id.to_string()])
            .set(if state == State::OnAir { 1.0 } else { 0.0 });
        true
    }

    pub async fn status(&self) -> LiveStreamStatus {
        let inner = self.inner.lock().await;
        LiveStreamStatus {
            state: inner.state,
            detail: inner.detail.clone(),
            started_at_elapsed_secs: inner.started_at.map(|t| t.elapsed().as_secs_f64()),
            updated_at_elapsed_secs: inner.updated_at.elapsed().as_secs_f64(),
            client_count: self.fanout.client_count(),
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn updated_at(&self) -> Instant {
        self.inner.lock().await.updated_at
    }

    pub async fn stream_data_written_at(&self) -> Instant {
        self.inner.lock().await.stream_data_written_at
    }

    /// Broadcasts `chunk` to Fan-out and, if non-empty, refreshes the
    /// freeze-watchdog timestamp (spec.md §3: "refreshed whenever encoded
    /// bytes are delivered to fan-out").
    pub async fn write_stream_data(&self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.inner.lock().await.stream_data_written_at = Instant::now();
        }
        self.fanout.write_stream_data(chunk);
    }

    pub async fn attach_tuner(&self, tuner: Arc<TunerHandle>) {
        let mut inner = self.inner.lock().await;
        inner.tuner = Some(tuner);
        inner.has_encoder_task = true;
    }

    /// Removes and returns the tuner handle, e.g. to hand it off or close
    /// it on the Offline transition. Also clears the encoder-task flag.
    pub async fn take_tuner(&self) -> Option<Arc<TunerHandle>> {
        let mut inner = self.inner.lock().await;
        inner.has_encoder_task = false;
        inner.tuner.take()
    }

    pub async fn tuner(&self) -> Option<Arc<TunerHandle>> {
        self.inner.lock().await.tuner.clone()
    }

    pub fn client_count(&self) -> usize {
        self.fanout.client_count()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Returns `true` if a restart attempt was consumed from the budget,
    /// `false` if the budget (spec.md §4.2: 5 attempts) is exhausted.
    pub fn consume_retry(&self) -> bool {
        let mut current = self.retry_count.load(Ordering::SeqCst);
        loop {
            if current >= MAX_RETRY_COUNT {
                return false;
            }
            match self.retry_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn reset_retry(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;

    fn make() -> LiveStream {
        LiveStream::new(
            LiveStreamId::new("gr011", Quality::P720p),
            ChannelCoordinates {
                network_id: 1,
                transport_stream_id: 2,
                service_id: 3,
            },
            StreamOptions {
                quality: Quality::P720p,
                dual_mono: false,
            },
        )
    }

    #[tokio::test]
    async fn same_state_and_detail_is_a_noop() {
        let ls = make();
        assert!(ls.set_status(State::Standby, "starting").await);
        let before = ls.status().await.updated_at_elapsed_secs;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!ls.set_status(State::Standby, "starting").await);
        let after = ls.status().await.updated_at_elapsed_secs;
        // updated_at did not advance further: the second elapsed reading
        // should be within a few ms of the first plus the sleep, not reset.
        assert!(after >= before);
    }

    #[tokio::test]
    async fn offline_to_restart_is_disallowed() {
        let ls = make();
        assert!(!ls.set_status(State::Restart, "x").await);
        assert_eq!(ls.state().await, State::Offline);
    }

    #[tokio::test]
    async fn started_at_resets_only_entering_standby_from_offline_or_restart() {
        let ls = make();
        ls.set_status(State::Standby, "a").await;
        let first_started = ls.status().await.started_at_elapsed_secs.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ls.set_status(State::OnAir, "b").await;
        let still_same = ls.status().await.started_at_elapsed_secs.unwrap();
        assert!(still_same >= first_started);

        ls.set_status(State::Restart, "retry").await;
        ls.set_status(State::Standby, "c").await;
        let restarted = ls.status().await.started_at_elapsed_secs.unwrap();
        assert!(restarted < still_same);
    }

    #[test]
    fn retry_budget_is_exhausted_after_five() {
        let ls = make();
        for _ in 0..5 {
            assert!(ls.consume_retry());
        }
        assert!(!ls.consume_retry());
    }
}
