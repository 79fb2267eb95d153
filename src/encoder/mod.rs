//! Encoder Supervisor (C2): runs one external encoder process end-to-end for
//! one LiveStream.
//!
//! Grounded on `fritztv::transcoder::Transcoder` for the process-lifecycle
//! idiom (three piped fds, `kill_on_drop(true)`, a `tokio::sync::watch<bool>`
//! cancellation signal, a bounded stderr ring buffer surfaced on error exit)
//! and on `LiveEncodingTask.py` for the four-loop shape and stderr
//! classification. Per spec.md §9's redesign note, the four loops are
//! explicit `tokio::task::JoinSet` members coordinated by a cancellation
//! `watch` channel and joined with a bounded wait, not an attempt to
//! preserve the original `asyncio.Task` call graph.

pub mod args;
pub mod classify;

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::live_stream::{LiveStream, State};
use crate::model::EncoderKind;
use crate::tuner::TunerHandle;

const EGRESS_CHUNK_SIZE: usize = 48 * 1024;
const STDERR_RING_CAPACITY: usize = 80;
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(3);
const CANCEL_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const ONAIR_FREEZE_TIMEOUT: Duration = Duration::from_secs(20);
const STANDBY_FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
const STANDBY_GRACE: Duration = Duration::from_secs(10);

/// Handle retained by the Registry/LiveStream to cancel a running
/// supervisor. `cancel()` is the only safe way to stop it.
#[derive(Clone)]
pub struct SupervisorHandle {
    cancel_tx: watch::Sender<bool>,
    join_handle: Arc<AsyncMutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SupervisorHandle {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Signals cancellation and waits up to `timeout` for the supervisor
    /// task to actually return, matching the "cancel `task`; wait up to 10 s
    /// for it to return" step of the preemption algorithm (spec.md §4.5).
    pub async fn cancel_and_wait(&self, timeout: Duration) {
        self.cancel();
        let handle = self.join_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

/// Spawns the supervising background task and returns a handle to cancel it.
/// The task itself implements the retry loop described in spec.md §4.2:
/// each recoverable failure re-enters Standby and respawns the encoder, up
/// to `MAX_RETRY_COUNT` times, after which the stream goes Offline.
pub fn spawn(
    live_stream: Arc<LiveStream>,
    encoder_kind: EncoderKind,
    max_alive_time: Duration,
) -> SupervisorHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let join_handle = tokio::spawn(supervise(live_stream, encoder_kind, max_alive_time, cancel_rx));
    SupervisorHandle {
        cancel_tx,
        join_handle: Arc::new(AsyncMutex::new(Some(join_handle))),
    }
}

enum AttemptOutcome {
    Cancelled,
    FatalNoRetry(String),
    RecoverableRestart(String),
    IdlingTimeoutExpired,
}

async fn supervise(
    live_stream: Arc<LiveStream>,
    encoder_kind: EncoderKind,
    max_alive_time: Duration,
    cancel_rx: watch::Receiver<bool>,
) {
    loop {
        let outcome = run_attempt(&live_stream, encoder_kind, max_alive_time, cancel_rx.clone()).await;
        match outcome {
            AttemptOutcome::Cancelled => {
                info!(live_stream_id = %live_stream.id, "supervisor cancelled");
                return;
            }
            AttemptOutcome::FatalNoRetry(detail) => {
                live_stream.set_status(State::Offline, detail).await;
                release_tuner(&live_stream).await;
                return;
            }
            AttemptOutcome::IdlingTimeoutExpired => {
                live_stream.set_status(State::Offline, "idling timeout exceeded").await;
                release_tuner(&live_stream).await;
                return;
            }
            AttemptOutcome::RecoverableRestart(detail) => {
                if live_stream.consume_retry() {
                    live_stream.set_status(State::Restart, detail).await;
                    live_stream
                        .set_status(State::Standby, "restarting encoder…")
                        .await;
                    continue;
                } else {
                    live_stream
                        .set_status(State::Offline, "restart limit reached")
                        .await;
                    release_tuner(&live_stream).await;
                    return;
                }
            }
        }
    }
}

async fn release_tuner(live_stream: &LiveStream) {
    if let Some(tuner) = live_stream.take_tuner().await {
        tuner.close().await;
    }
}

async fn run_attempt(
    live_stream: &Arc<LiveStream>,
    encoder_kind: EncoderKind,
    max_alive_time: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> AttemptOutcome {
    let tuner: Arc<TunerHandle> = match live_stream.tuner().await {
        Some(t) => t,
        None => return AttemptOutcome::FatalNoRetry("no tuner reserved for encoder start".into()),
    };
    let mut reader = match tuner.take_reader().await {
        Some(r) => r,
        None => return AttemptOutcome::FatalNoRetry("tuner reader already taken".into()),
    };

    let invocation = args::build(encoder_kind, live_stream.options);
    let mut child = match Command::new(invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return AttemptOutcome::FatalNoRetry(format!("encoder failed to start: {e}"));
        }
    };

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let onair_reached = Arc::new(AtomicBool::new(false));
    let restart_requested: Arc<AsyncMutex<Option<String>>> = Arc::new(AsyncMutex::new(None));
    let fatal_detail: Arc<AsyncMutex<Option<String>>> = Arc::new(AsyncMutex::new(None));
    let stderr_ring: Arc<AsyncMutex<VecDeque<String>>> =
        Arc::new(AsyncMutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

    // Separate from `cancel_rx` (external preemption signal): the watchdog
    // trips this on its own when it judges the process frozen, since the
    // process itself never exits on its own in that case and `child.wait()`
    // below would otherwise block forever.
    let (freeze_kill_tx, mut freeze_kill_rx) = watch::channel(false);

    let mut loops = JoinSet::new();

    // Ingest: Tuner Adapter reader -> encoder stdin.
    {
        let mut cancel_rx = cancel_rx.clone();
        loops.spawn(async move {
            let mut buf = [0u8; 32 * 1024];
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    n = reader.read(&mut buf) => {
                        match n {
                            Ok(0) => break,
                            Ok(n) => {
                                if stdin.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            // Do not close `reader` here on cancellation — the Arbiter may
            // take it (spec.md §4.2's hand-off cancellation semantics). It
            // is simply dropped with the task, leaving the tuner's session
            // untouched.
        });
    }

    // Egress: encoder stdout -> Client Fan-out.
    {
        let live_stream = live_stream.clone();
        let mut cancel_rx = cancel_rx.clone();
        loops.spawn(async move {
            let mut buf = vec![0u8; EGRESS_CHUNK_SIZE];
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    n = stdout.read(&mut buf) => {
                        match n {
                            Ok(0) => break,
                            Ok(n) => {
                                live_stream
                                    .write_stream_data(bytes::Bytes::copy_from_slice(&buf[..n]))
                                    .await;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    // Log: stderr line parser -> state-detail updates + error classifier.
    {
        let live_stream = live_stream.clone();
        let onair_reached = onair_reached.clone();
        let restart_requested = restart_requested.clone();
        let fatal_detail = fatal_detail.clone();
        let stderr_ring = stderr_ring.clone();
        let mut cancel_rx = cancel_rx.clone();
        loops.spawn(async move {
            let mut linebuf: Vec<u8> = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    n = stderr.read(&mut byte) => {
                        match n {
                            Ok(0) => break,
                            Ok(_) => {
                                if byte[0] == b'\n' || byte[0] == b'\r' {
                                    if !linebuf.is_empty() {
                                        let line = String::from_utf8_lossy(&linebuf).into_owned();
                                        handle_stderr_line(
                                            &live_stream,
                                            encoder_kind,
                                            &line,
                                            &onair_reached,
                                            &restart_requested,
                                            &fatal_detail,
                                            &stderr_ring,
                                        )
                                        .await;
                                        linebuf.clear();
                                    }
                                } else {
                                    linebuf.push(byte[0]);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    // Watchdog: wall clock + stream_data_written_at + state + client count.
    // The per-tick decision lives in `watchdog_decide` so it can be unit
    // tested without spawning a real encoder process; this loop only acts
    // on it.
    {
        let live_stream = live_stream.clone();
        let restart_requested = restart_requested.clone();
        let freeze_kill_tx = freeze_kill_tx.clone();
        let mut cancel_rx = cancel_rx.clone();
        loops.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let standby_since = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        let state = live_stream.state().await;
                        let written_at = live_stream.stream_data_written_at().await;
                        let updated_at = live_stream.updated_at().await;
                        let action = watchdog_decide(
                            state,
                            live_stream.client_count(),
                            written_at.elapsed(),
                            standby_since.elapsed(),
                            updated_at.elapsed(),
                            max_alive_time,
                        );
                        match action {
                            WatchdogAction::Continue => {}
                            WatchdogAction::TransitionTo(next, detail) => {
                                live_stream.set_status(next, detail).await;
                            }
                            WatchdogAction::RestartRequested(detail) => {
                                warn!(live_stream_id = %live_stream.id, detail, "watchdog requested restart");
                                *restart_requested.lock().await = Some(detail.to_string());
                                // The process is frozen, not exited: nothing
                                // else will ever unblock `child.wait()` below.
                                let _ = freeze_kill_tx.send(true);
                                break;
                            }
                            WatchdogAction::Stop => {
                                let _ = freeze_kill_tx.send(true);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    // Wait for the encoder process to exit while the loops run alongside. A
    // watchdog-detected freeze never makes the process exit on its own, so
    // `freeze_kill_rx` races the real exit and kills the process itself.
    let wait_result = tokio::select! {
        r = child.wait() => r,
        _ = freeze_kill_rx.changed() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let cancelled = *cancel_rx.borrow();

    // Give the still-running loops a chance to notice EOF/cancellation and
    // return on their own before abandoning them.
    let join_wait = if cancelled { CANCEL_JOIN_TIMEOUT } else { GRACEFUL_SHUTDOWN_WAIT };
    let _ = tokio::time::timeout(join_wait, async {
        while loops.join_next().await.is_some() {}
    })
    .await;
    loops.abort_all();

    if cancelled {
        let _ = child.start_kill();
        return AttemptOutcome::Cancelled;
    }

    if let Some(detail) = fatal_detail.lock().await.take() {
        error!(live_stream_id = %live_stream.id, %detail, "encoder fatal error");
        return AttemptOutcome::FatalNoRetry(detail);
    }
    if let Some(detail) = restart_requested.lock().await.take() {
        dump_stderr_ring(live_stream, &stderr_ring).await;
        return AttemptOutcome::RecoverableRestart(detail);
    }

    // No classified marker in stderr: an unexpected exit. Treated as
    // recoverable up to the retry budget (spec.md §4.2).
    match &wait_result {
        Ok(status) if status.success() && onair_reached.load(Ordering::SeqCst) => {
            info!(live_stream_id = %live_stream.id, "encoder exited cleanly but unexpectedly");
        }
        _ => {
            dump_stderr_ring(live_stream, &stderr_ring).await;
        }
    }
    AttemptOutcome::RecoverableRestart("encoder exited unexpectedly".to_string())
}

#[allow(clippy::too_many_arguments)]
async fn handle_stderr_line(
    live_stream: &Arc<LiveStream>,
    encoder_kind: EncoderKind,
    line: &str,
    onair_reached: &Arc<AtomicBool>,
    restart_requested: &Arc<AsyncMutex<Option<String>>>,
    fatal_detail: &Arc<AsyncMutex<Option<String>>>,
    stderr_ring: &Arc<AsyncMutex<VecDeque<String>>>,
) {
    {
        let mut ring = stderr_ring.lock().await;
        if ring.len() >= STDERR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
    }

    if classify::is_stream_mapping_noise(line) {
        debug!(%line, "encoder stream mapping");
        return;
    }

    match classify::classify_line(encoder_kind, line) {
        classify::LogSignal::StandbyDetail(detail) => {
            live_stream.set_status(State::Standby, detail).await;
        }
        classify::LogSignal::OnAirTransition => {
            if !onair_reached.swap(true, Ordering::SeqCst) {
                live_stream.set_status(State::OnAir, "配信中").await;
                live_stream.reset_retry();
            }
        }
        classify::LogSignal::FatalNoRetry(detail) => {
            *fatal_detail.lock().await = Some(detail);
        }
        classify::LogSignal::RecoverableRestart(detail) => {
            *restart_requested.lock().await = Some(detail);
        }
        classify::LogSignal::Ignored => {
            debug!(%line, "encoder stderr");
        }
    }
}

async fn dump_stderr_ring(live_stream: &LiveStream, ring: &Arc<AsyncMutex<VecDeque<String>>>) {
    let ring = ring.lock().await;
    let tail: Vec<&String> = ring.iter().rev().take(30).collect();
    for line in tail.into_iter().rev() {
        warn!(live_stream_id = %live_stream.id, %line, "encoder stderr (tail)");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchdogAction {
    Continue,
    TransitionTo(State, &'static str),
    RestartRequested(&'static str),
    Stop,
}

/// Pure per-tick watchdog decision (spec.md §8 Scenario C: encoder freeze
/// while ONAir or stuck on startup). Kept free of I/O so the freeze/restart
/// thresholds are testable without spawning a real encoder process.
fn watchdog_decide(
    state: State,
    client_count: usize,
    written_at_elapsed: Duration,
    standby_since_elapsed: Duration,
    updated_at_elapsed: Duration,
    max_alive_time: Duration,
) -> WatchdogAction {
    match state {
        State::OnAir => {
            if client_count == 0 {
                return WatchdogAction::TransitionTo(State::Idling, "no viewers");
            }
            if written_at_elapsed > ONAIR_FREEZE_TIMEOUT {
                return WatchdogAction::RestartRequested("encoder froze while ONAir");
            }
            WatchdogAction::Continue
        }
        State::Standby => {
            if standby_since_elapsed > STANDBY_GRACE && written_at_elapsed > STANDBY_FREEZE_TIMEOUT {
                return WatchdogAction::RestartRequested("encoder did not start producing output");
            }
            WatchdogAction::Continue
        }
        State::Idling => {
            if client_count > 0 {
                return WatchdogAction::TransitionTo(State::OnAir, "resumed");
            }
            if updated_at_elapsed > max_alive_time {
                return WatchdogAction::Stop;
            }
            WatchdogAction::Continue
        }
        State::Offline | State::Restart => WatchdogAction::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onair_freeze_past_timeout_requests_restart() {
        let action = watchdog_decide(
            State::OnAir,
            3,
            ONAIR_FREEZE_TIMEOUT + Duration::from_secs(1),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::RestartRequested("encoder froze while ONAir"));
    }

    #[test]
    fn onair_within_timeout_continues() {
        let action = watchdog_decide(
            State::OnAir,
            1,
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::Continue);
    }

    #[test]
    fn onair_with_no_viewers_goes_idling() {
        let action = watchdog_decide(
            State::OnAir,
            0,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::TransitionTo(State::Idling, "no viewers"));
    }

    #[test]
    fn standby_stuck_past_grace_and_freeze_requests_restart() {
        let action = watchdog_decide(
            State::Standby,
            0,
            STANDBY_FREEZE_TIMEOUT + Duration::from_secs(1),
            STANDBY_GRACE + Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(
            action,
            WatchdogAction::RestartRequested("encoder did not start producing output")
        );
    }

    #[test]
    fn standby_within_grace_window_is_not_flagged() {
        let action = watchdog_decide(
            State::Standby,
            0,
            STANDBY_FREEZE_TIMEOUT + Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::Continue);
    }

    #[test]
    fn idling_with_client_resumes_onair() {
        let action = watchdog_decide(
            State::Idling,
            1,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::TransitionTo(State::OnAir, "resumed"));
    }

    #[test]
    fn idling_past_max_alive_time_stops() {
        let action = watchdog_decide(
            State::Idling,
            0,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(11),
            Duration::from_secs(10),
        );
        assert_eq!(action, WatchdogAction::Stop);
    }
}

