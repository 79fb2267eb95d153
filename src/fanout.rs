//! Client Fan-out (C3): per-LiveStream broadcast of encoded TS bytes with
//! per-client stall eviction.
//!
//! Grounded on `LiveStream.py`'s `LiveStreamClient` (one `asyncio.Queue` per
//! client, a `None` sentinel for end-of-stream, a `stream_data_read_at`
//! timestamp refreshed on every read) combined with `fritztv::manager`'s
//! `ClientGuard`-via-`Drop` RAII disconnect idiom. A single shared
//! `tokio::sync::broadcast` (as `fritztv::manager::ActiveStream` uses)
//! cannot express this: broadcast eviction is lag-based and global, not a
//! per-client wall-clock stall check, so each client gets its own channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;

use crate::metrics::{CLIENT_BANDWIDTH, CLIENT_COUNT};

/// Queues are unbounded but bounded in practice: a client that cannot drain
/// is evicted after `STALL_TIMEOUT`, per spec.md §4.3's back-pressure policy.
const STALL_TIMEOUT_MS: u64 = 10_000;

/// Sentinel for `last_read_at`: the client has connected but has not read
/// yet. Per `LiveStream.py`'s `connect()` ("接続時は最終読み取り時刻を登録
/// しない" — don't stamp the read clock at connect time, since the client
/// may be kept waiting on the encoder's startup window), a client must
/// never be evicted for staleness before its first read.
const NOT_YET_READ: u64 = u64::MAX;

enum Delivered {
    Chunk(Bytes),
    Terminator,
}

struct ClientEntry {
    client_id: String,
    tx: mpsc::UnboundedSender<Delivered>,
    last_read_at: Arc<AtomicU64>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Handle returned to the HTTP layer by `connect()`. Reading refreshes
/// `last_read_at`; dropping it disconnects the client (idempotent with an
/// explicit `disconnect()`/eviction).
pub struct ClientReader {
    pub client_id: String,
    rx: mpsc::UnboundedReceiver<Delivered>,
    clients: Arc<StdMutex<Vec<ClientEntry>>>,
    last_read_at: Arc<AtomicU64>,
    live_stream_id: String,
}

impl ClientReader {
    /// Pops the next chunk, or `None` once the terminator has been seen.
    /// Refreshes `last_read_at`, used by `write_stream_data`'s stall check.
    pub async fn read(&mut self) -> Option<Bytes> {
        match self.rx.recv().await {
            Some(Delivered::Chunk(bytes)) => {
                self.last_read_at.store(now_millis(), Ordering::Relaxed);
                Some(bytes)
            }
            Some(Delivered::Terminator) | None => None,
        }
    }
}

impl Drop for ClientReader {
    fn drop(&mut self) {
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|c| c.client_id != self.client_id);
        let after = clients.len();
        if after != before {
            info!(client_id = %self.client_id, "client disconnected");
            CLIENT_COUNT
                .with_label_values(&[&self.live_stream_id])
                .set(after as f64);
        }
    }
}

pub struct FanOut {
    clients: Arc<StdMutex<Vec<ClientEntry>>>,
    next_id: AtomicU64,
    live_stream_id: String,
}

impl FanOut {
    pub fn new(live_stream_id: impl Into<String>) -> Self {
        Self {
            clients: Arc::new(StdMutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            live_stream_id: live_stream_id.into(),
        }
    }

    fn report_client_count(&self, count: usize) {
        CLIENT_COUNT
            .with_label_values(&[&self.live_stream_id])
            .set(count as f64);
    }

    /// Allocates a Client and returns a reader for it. `client_kind` is
    /// carried only for logging (spec.md §6's `client_kind="mpegts"`).
    pub fn connect(&self, client_kind: &str) -> ClientReader {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let client_id = format!("c{id}");
        let (tx, rx) = mpsc::unbounded_channel();
        let last_read_at = Arc::new(AtomicU64::new(NOT_YET_READ));
        let mut clients = self.clients.lock().unwrap();
        clients.push(ClientEntry {
            client_id: client_id.clone(),
            tx,
            last_read_at: last_read_at.clone(),
        });
        self.report_client_count(clients.len());
        drop(clients);
        info!(client_id = %client_id, kind = client_kind, "client connected");
        ClientReader {
            client_id,
            rx,
            clients: self.clients.clone(),
            last_read_at,
            live_stream_id: self.live_stream_id.clone(),
        }
    }

    /// Idempotent; a second call for an already-removed id is a no-op.
    pub fn disconnect(&self, client_id: &str) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.client_id != client_id);
        self.report_client_count(clients.len());
    }

    /// Broadcasts the terminator to every client and clears the list;
    /// called when the owning LiveStream transitions to Offline.
    pub fn disconnect_all(&self) {
        let mut clients = self.clients.lock().unwrap();
        for c in clients.drain(..) {
            let _ = c.tx.send(Delivered::Terminator);
        }
        self.report_client_count(0);
    }

    /// Enqueues `chunk` on every client's queue, evicting any client whose
    /// last read is older than 10 s first.
    pub fn write_stream_data(&self, chunk: Bytes) {
        let now = now_millis();
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| {
            let last = c.last_read_at.load(Ordering::Relaxed);
            if last != NOT_YET_READ && now.saturating_sub(last) > STALL_TIMEOUT_MS {
                info!(client_id = %c.client_id, "evicting stalled client");
                let _ = c.tx.send(Delivered::Terminator);
                false
            } else {
                let _ = c.tx.send(Delivered::Chunk(chunk.clone()));
                true
            }
        });
        self.report_client_count(clients.len());
        if !clients.is_empty() {
            CLIENT_BANDWIDTH
                .with_label_values(&[&self.live_stream_id])
                .set((chunk.len() * clients.len()) as f64);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ordering_is_preserved_per_client() {
        let fanout = FanOut::new("gr011-720p");
        let mut c1 = fanout.connect("mpegts");
        fanout.write_stream_data(Bytes::from_static(b"a"));
        fanout.write_stream_data(Bytes::from_static(b"b"));
        assert_eq!(c1.read().await, Some(Bytes::from_static(b"a")));
        assert_eq!(c1.read().await, Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn disconnect_all_sends_terminator() {
        let fanout = FanOut::new("gr011-720p");
        let mut c1 = fanout.connect("mpegts");
        fanout.disconnect_all();
        assert_eq!(c1.read().await, None);
    }

    #[tokio::test]
    async fn dropping_reader_removes_client() {
        let fanout = FanOut::new("gr011-720p");
        let c1 = fanout.connect("mpegts");
        assert_eq!(fanout.client_count(), 1);
        drop(c1);
        assert_eq!(fanout.client_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_twice_is_a_noop() {
        let fanout = FanOut::new("gr011-720p");
        let c1 = fanout.connect("mpegts");
        let id = c1.client_id.clone();
        fanout.disconnect(&id);
        assert_eq!(fanout.client_count(), 0);
        fanout.disconnect(&id);
        assert_eq!(fanout.client_count(), 0);
    }

    #[tokio::test]
    async fn stalled_client_is_evicted_without_disturbing_others() {
        let fanout = FanOut::new("gr011-720p");
        let mut stalled = fanout.connect("mpegts");
        let mut fresh = fanout.connect("mpegts");

        // force the stalled client's last_read_at far into the past
        {
            let clients = fanout.clients.lock().unwrap();
            let entry = clients
                .iter()
                .find(|c| c.client_id == stalled.client_id)
                .unwrap();
            entry.last_read_at.store(0, Ordering::Relaxed);
        }

        fanout.write_stream_data(Bytes::from_static(b"x"));
        assert_eq!(stalled.read().await, None);
        assert_eq!(fresh.read().await, Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn client_never_read_from_is_not_evicted_before_its_first_chunk() {
        let fanout = FanOut::new("gr011-720p");
        let mut c1 = fanout.connect("mpegts");
        {
            let clients = fanout.clients.lock().unwrap();
            let entry = clients.iter().find(|c| c.client_id == c1.client_id).unwrap();
            assert_eq!(entry.last_read_at.load(Ordering::Relaxed), NOT_YET_READ);
        }

        // A chunk arriving well past STALL_TIMEOUT_MS after connect (e.g. a
        // slow encoder startup) must still reach a client that has not had
        // a chance to read yet.
        fanout.write_stream_data(Bytes::from_static(b"first"));
        assert_eq!(fanout.client_count(), 1);
        assert_eq!(c1.read().await, Some(Bytes::from_static(b"first")));
    }
}
