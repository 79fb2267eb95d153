//! Live Stream Registry / Arbiter (C5): the process-wide directory of Live
//! Streams, and the tuner-reuse/preemption policy used when hardware is
//! scarce.
//!
//! Grounded on `LiveStream.py`'s `connect()` reuse loop (15 attempts ×
//! 100 ms, skip live viewers unless Standby, skip ineligible states, atomic
//! hand-off) and on `stuayu-recisdb-proxy-rs`'s `TunerPool` for the Rust
//! idiom of an `RwLock<HashMap<Key, Arc<T>>>` directory. Per spec.md §9's
//! design note, the Registry owns the map outright; a `LiveStream` never
//! holds a pointer back to its Registry, which keeps preemption a plain
//! snapshot iteration instead of a cyclic walk.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::encoder::{self, SupervisorHandle};
use crate::error::{CoreError, CoreResult};
use crate::fanout::ClientReader;
use crate::live_stream::{LiveStream, LiveStreamStatus, State};
use crate::model::{ChannelDirectory, ChannelId, EncoderKind, LiveStreamId, Quality, StreamOptions};
use crate::tuner::{TunerAdapter, TunerHandle, TunerLifecycle};

const PREEMPTION_ATTEMPTS: u32 = 15;
const PREEMPTION_RETRY_STEP: Duration = Duration::from_millis(100);
const ENCODER_CANCEL_WAIT: Duration = Duration::from_secs(10);

/// How long `connect()` will wait for a freshly-started stream to reach
/// OnAir (or fail) before giving up, and the poll granularity while waiting.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_POLL_STEP: Duration = Duration::from_millis(100);

pub struct Registry {
    streams: StdRwLock<HashMap<LiveStreamId, Arc<LiveStream>>>,
    supervisors: StdRwLock<HashMap<LiveStreamId, SupervisorHandle>>,
    tuner_adapter: TunerAdapter,
    channel_directory: Arc<dyn ChannelDirectory>,
    encoder_kind: EncoderKind,
    max_alive_time: Duration,
    /// One guard per LiveStreamId, serialising that stream's Offline ->
    /// Standby start sequence (including the tuner-open/preemption I/O)
    /// without blocking unrelated streams' starts on each other.
    /// `LiveStream::set_status` already protects individual transitions on
    /// its own.
    start_guards: StdRwLock<HashMap<LiveStreamId, Arc<AsyncMutex<()>>>>,
}

impl Registry {
    pub fn new(
        tuner_adapter: TunerAdapter,
        channel_directory: Arc<dyn ChannelDirectory>,
        encoder_kind: EncoderKind,
        max_alive_time: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: StdRwLock::new(HashMap::new()),
            supervisors: StdRwLock::new(HashMap::new()),
            tuner_adapter,
            channel_directory,
            encoder_kind,
            max_alive_time,
            start_guards: StdRwLock::new(HashMap::new()),
        })
    }

    fn start_guard_for(&self, id: &LiveStreamId) -> Arc<AsyncMutex<()>> {
        if let Some(guard) = self.start_guards.read().unwrap().get(id) {
            return guard.clone();
        }
        self.start_guards
            .write()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn lookup_or_create(&self, id: LiveStreamId, quality: Quality) -> CoreResult<Arc<LiveStream>> {
        if let Some(existing) = self.streams.read().unwrap().get(&id) {
            return Ok(existing.clone());
        }
        let coordinates = self
            .channel_directory
            .coordinates_for(&id.channel_id)
            .ok_or_else(|| CoreError::ChannelNotFound(id.channel_id.clone()))?;
        let options = StreamOptions {
            quality,
            dual_mono: self.channel_directory.is_dual_mono(&id.channel_id),
        };
        let mut streams = self.streams.write().unwrap();
        Ok(streams
            .entry(id.clone())
            .or_insert_with(|| Arc::new(LiveStream::new(id, coordinates, options)))
            .clone())
    }

    pub fn lookup(&self, id: &LiveStreamId) -> Option<Arc<LiveStream>> {
        self.streams.read().unwrap().get(id).cloned()
    }

    /// `list_streams() → {state: {live_stream_id: status}}` (spec.md §6).
    pub async fn list_streams(&self) -> HashMap<State, HashMap<LiveStreamId, LiveStreamStatus>> {
        let snapshot: Vec<Arc<LiveStream>> = self.streams.read().unwrap().values().cloned().collect();
        let mut out: HashMap<State, HashMap<LiveStreamId, LiveStreamStatus>> = HashMap::new();
        for stream in snapshot {
            let status = stream.status().await;
            out.entry(status.state)
                .or_default()
                .insert(stream.id.clone(), status);
        }
        out
    }

    pub async fn get_status(&self, id: &LiveStreamId) -> Option<LiveStreamStatus> {
        let stream = self.lookup(id)?;
        Some(stream.status().await)
    }

    /// Sum of client counts over all qualities of one channel (spec.md §6).
    pub fn get_viewer_count(&self, channel_id: &ChannelId) -> u64 {
        self.streams
            .read()
            .unwrap()
            .values()
            .filter(|s| &s.id.channel_id == channel_id)
            .map(|s| s.client_count() as u64)
            .sum()
    }

    /// `connect(channel_id, quality, client_kind) → Client` (spec.md §6).
    pub async fn connect(
        self: &Arc<Self>,
        channel_id: ChannelId,
        quality: Quality,
        client_kind: &str,
    ) -> CoreResult<ClientReader> {
        let id = LiveStreamId::new(channel_id, quality);
        let live_stream = self.lookup_or_create(id, quality)?;

        match live_stream.state().await {
            State::Offline => self.start_stream(&live_stream).await?,
            State::Idling => {
                live_stream.set_status(State::OnAir, "視聴を再開しました").await;
            }
            _ => {}
        }

        self.wait_for_onair(&live_stream).await?;
        Ok(live_stream.fanout.connect(client_kind))
    }

    /// Blocks until `live_stream` reaches OnAir/Idling (both mean the
    /// encoder is producing output and ready for a client) or goes Offline,
    /// surfacing whatever detail the Encoder Supervisor left behind as a
    /// `CoreError` instead of handing the caller a reader that will never
    /// see data. Bounded so a stuck Standby cannot hang an HTTP request
    /// forever.
    async fn wait_for_onair(&self, live_stream: &Arc<LiveStream>) -> CoreResult<()> {
        let deadline = Instant::now() + CONNECT_WAIT_TIMEOUT;
        loop {
            let status = live_stream.status().await;
            match status.state {
                State::OnAir | State::Idling => return Ok(()),
                State::Offline => return Err(self.classify_offline_detail(&status.detail)),
                State::Standby | State::Restart => {}
            }
            if Instant::now() >= deadline {
                return Err(CoreError::EncoderStartFailed(
                    "timed out waiting for the encoder to come on air".to_string(),
                ));
            }
            tokio::time::sleep(CONNECT_POLL_STEP).await;
        }
    }

    /// Maps the human-readable detail text a LiveStream carries when it
    /// lands on Offline back to a `CoreError` variant, so `connect()` can
    /// surface the actual failure instead of a generic one. Matches the
    /// detail strings `encoder::classify` and `encoder::run_attempt` set.
    fn classify_offline_detail(&self, detail: &str) -> CoreError {
        if detail.contains("対応していません") {
            CoreError::EncoderUnsupported(self.encoder_kind, detail.to_string())
        } else if detail.contains("froze") || detail.contains("restart limit reached") {
            CoreError::EncoderFroze
        } else if detail.contains("エラーが発生しました") || detail.contains("解析に失敗") {
            CoreError::EncoderFatalLog(detail.to_string())
        } else {
            CoreError::EncoderStartFailed(detail.to_string())
        }
    }

    pub fn disconnect(&self, live_stream: &LiveStream, client_id: &str) {
        live_stream.fanout.disconnect(client_id);
    }

    async fn start_stream(self: &Arc<Self>, live_stream: &Arc<LiveStream>) -> CoreResult<()> {
        let guard = self.start_guard_for(&live_stream.id);
        let _guard = guard.lock().await;
        // Lost the race: another connect() already started this stream
        // while we waited for the guard.
        if live_stream.state().await != State::Offline {
            return Ok(());
        }

        let tuner = match self
            .tuner_adapter
            .open(live_stream.coordinates, live_stream.id.clone())
            .await
        {
            Ok(handle) => Arc::new(handle),
            Err(CoreError::NoTunerAvailable) => self.preempt_and_open(live_stream).await?,
            Err(e) => return Err(e),
        };

        live_stream.attach_tuner(tuner).await;
        live_stream
            .set_status(State::Standby, "チューナーを起動しています…")
            .await;

        let handle = encoder::spawn(live_stream.clone(), self.encoder_kind, self.max_alive_time);
        self.supervisors
            .write()
            .unwrap()
            .insert(live_stream.id.clone(), handle);
        Ok(())
    }

    /// Preemption algorithm (spec.md §4.5): up to 15 attempts, 100 ms apart.
    async fn preempt_and_open(
        self: &Arc<Self>,
        new_stream: &Arc<LiveStream>,
    ) -> CoreResult<Arc<TunerHandle>> {
        for _ in 0..PREEMPTION_ATTEMPTS {
            if self.tuner_adapter.is_http() {
                if let Some(victim) = self.find_idling_victim(&new_stream.id).await {
                    self.release_for_handoff(&victim, "tuner released for reuse").await;
                    // The HTTP backend arbitrates tuners internally: once the
                    // victim's connection is torn down, a fresh open should
                    // succeed.
                    if let Ok(handle) = self
                        .tuner_adapter
                        .open(new_stream.coordinates, new_stream.id.clone())
                        .await
                    {
                        return Ok(Arc::new(handle));
                    }
                }
            } else if let Some(victim) = self.find_preemption_candidate(&new_stream.id).await {
                if let Some(tuner) = self
                    .release_for_handoff(&victim, "tuner handed off")
                    .await
                {
                    if tuner.handoff(&victim.id, &new_stream.id) {
                        return Ok(tuner);
                    }
                }
            }
            tokio::time::sleep(PREEMPTION_RETRY_STEP).await;
        }

        self.tuner_adapter
            .open(new_stream.coordinates, new_stream.id.clone())
            .await
            .map(Arc::new)
    }

    async fn find_preemption_candidate(&self, exclude: &LiveStreamId) -> Option<Arc<LiveStream>> {
        let snapshot: Vec<Arc<LiveStream>> = self.streams.read().unwrap().values().cloned().collect();
        for stream in snapshot {
            if &stream.id == exclude {
                continue;
            }
            let state = stream.state().await;
            if !matches!(state, State::Standby | State::OnAir | State::Idling) {
                continue;
            }
            if stream.client_count() > 0 && state != State::Standby {
                continue;
            }
            let Some(tuner) = stream.tuner().await else {
                continue;
            };
            if tuner.lifecycle() == TunerLifecycle::Cancelling {
                continue;
            }
            return Some(stream);
        }
        None
    }

    async fn find_idling_victim(&self, exclude: &LiveStreamId) -> Option<Arc<LiveStream>> {
        let snapshot: Vec<Arc<LiveStream>> = self.streams.read().unwrap().values().cloned().collect();
        for stream in snapshot {
            if &stream.id != exclude && stream.state().await == State::Idling {
                return Some(stream);
            }
        }
        None
    }

    /// Atomically releases `victim`'s tuner for hand-off: marks it
    /// Cancelling, sets the stream Offline, disconnects its clients and its
    /// adapter stream (without closing the backend session), and cancels
    /// its Encoder Supervisor, waiting up to 10 s.
    async fn release_for_handoff(&self, victim: &Arc<LiveStream>, detail: &str) -> Option<Arc<TunerHandle>> {
        let tuner = victim.tuner().await?;
        tuner.set_state(TunerLifecycle::Cancelling);
        victim.set_status(State::Offline, detail).await;
        victim.fanout.disconnect_all();
        tuner.disconnect_stream().await;
        victim.take_tuner().await;

        let supervisor = self.supervisors.write().unwrap().remove(&victim.id);
        if let Some(supervisor) = supervisor {
            supervisor.cancel_and_wait(ENCODER_CANCEL_WAIT).await;
        }
        info!(live_stream_id = %victim.id, "preempted for hand-off");

        Some(tuner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelCoordinates;
    use std::collections::HashMap as StdHashMap;

    fn test_registry() -> Arc<Registry> {
        let adapter = TunerAdapter::new(
            &crate::config::TunerConfig {
                backend: crate::config::BackendKind::Http,
                backend_endpoint: "http://127.0.0.1:1".into(),
                always_use_http_backend_for_tv: false,
            },
            reqwest::Client::new(),
        );
        let mut channels = StdHashMap::new();
        channels.insert(
            "gr011".to_string(),
            ChannelCoordinates {
                network_id: 1,
                transport_stream_id: 1,
                service_id: 1,
            },
        );
        let directory = Arc::new(crate::model::StaticChannelDirectory::new(channels));
        Registry::new(adapter, directory, EncoderKind::FFmpeg, Duration::from_secs(10))
    }

    #[test]
    fn lookup_or_create_returns_singleton_per_id() {
        let registry = test_registry();
        let id = LiveStreamId::new("gr011", Quality::P720p);
        let a = registry.lookup_or_create(id.clone(), Quality::P720p).unwrap();
        let b = registry.lookup_or_create(id, Quality::P720p).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_or_create_fails_for_unknown_channel() {
        let registry = test_registry();
        let id = LiveStreamId::new("unknown", Quality::P720p);
        assert!(registry.lookup_or_create(id, Quality::P720p).is_err());
    }

    // Scenario F (spec.md §8): a stampede of concurrent connects for the
    // same (channel, quality) must collapse onto one LiveStream instance.
    #[test]
    fn concurrent_lookups_for_same_id_share_one_live_stream() {
        let registry = test_registry();
        let id = LiveStreamId::new("gr011", Quality::P720p);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.lookup_or_create(id, Quality::P720p).unwrap())
            })
            .collect();
        let streams: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for s in &streams[1..] {
            assert!(Arc::ptr_eq(&streams[0], s));
        }
    }

    // Scenario B (spec.md §8): preemption must skip streams with active
    // viewers and pick an idle (client-less Standby) one instead.
    #[tokio::test]
    async fn find_preemption_candidate_skips_active_onair_and_picks_standby() {
        let registry = test_registry();

        let busy_id = LiveStreamId::new("gr011", Quality::P720p);
        let busy = registry.lookup_or_create(busy_id.clone(), Quality::P720p).unwrap();
        busy.set_status(State::OnAir, "on air").await;
        let _reader = busy.fanout.connect("mpegts");
        busy.attach_tuner(Arc::new(crate::tuner::test_handle(busy.coordinates, 1, busy_id.clone())))
            .await;

        let idle_id = LiveStreamId::new("gr011", Quality::P480p);
        let idle = registry.lookup_or_create(idle_id.clone(), Quality::P480p).unwrap();
        idle.set_status(State::Standby, "standing by").await;
        idle.attach_tuner(Arc::new(crate::tuner::test_handle(idle.coordinates, 2, idle_id.clone())))
            .await;

        let candidate = registry
            .find_preemption_candidate(&LiveStreamId::new("gr011", Quality::P1080p))
            .await;
        assert_eq!(candidate.unwrap().id, idle_id);
    }

    #[tokio::test]
    async fn release_for_handoff_marks_victim_offline_and_returns_tuner() {
        let registry = test_registry();
        let id = LiveStreamId::new("gr011", Quality::P720p);
        let stream = registry.lookup_or_create(id.clone(), Quality::P720p).unwrap();
        stream.set_status(State::Standby, "standing by").await;
        stream
            .attach_tuner(Arc::new(crate::tuner::test_handle(stream.coordinates, 5, id)))
            .await;

        let tuner = registry.release_for_handoff(&stream, "reused").await;
        assert!(tuner.is_some());
        assert_eq!(stream.state().await, State::Offline);
        assert!(stream.tuner().await.is_none());
    }

    // Scenario D (spec.md §8): a fatal stderr classification must surface
    // through `connect()` as the matching `CoreError` variant, not a generic
    // one. These detail strings are exactly what `encoder::classify` and
    // `encoder::run_attempt` set on the Offline transition.
    #[test]
    fn classify_offline_detail_maps_known_messages() {
        let registry = test_registry();
        assert!(matches!(
            registry.classify_offline_detail("この PC の GPU は NVEncC によるエンコードに対応していません。"),
            CoreError::EncoderUnsupported(_, _)
        ));
        assert!(matches!(
            registry.classify_offline_detail("restart limit reached"),
            CoreError::EncoderFroze
        ));
        assert!(matches!(
            registry.classify_offline_detail("エンコーダーの実行中にエラーが発生しました。"),
            CoreError::EncoderFatalLog(_)
        ));
        assert!(matches!(
            registry.classify_offline_detail("encoder failed to start: No such file or directory"),
            CoreError::EncoderStartFailed(_)
        ));
    }

    #[tokio::test]
    async fn wait_for_onair_surfaces_offline_detail_as_error() {
        let registry = test_registry();
        let id = LiveStreamId::new("gr011", Quality::P720p);
        let stream = registry.lookup_or_create(id, Quality::P720p).unwrap();
        stream
            .set_status(
                State::Offline,
                "この PC の GPU は NVEncC によるエンコードに対応していません。",
            )
            .await;
        let err = registry.wait_for_onair(&stream).await.unwrap_err();
        assert!(matches!(err, CoreError::EncoderUnsupported(_, _)));
    }

    #[tokio::test]
    async fn wait_for_onair_succeeds_immediately_when_already_onair() {
        let registry = test_registry();
        let id = LiveStreamId::new("gr011", Quality::P720p);
        let stream = registry.lookup_or_create(id, Quality::P720p).unwrap();
        stream.set_status(State::OnAir, "配信中").await;
        assert!(registry.wait_for_onair(&stream).await.is_ok());
    }
}
