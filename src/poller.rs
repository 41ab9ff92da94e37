//! Adaptive per-execution polling.
//!
//! One engine owns every live poll stream. A stream is created lazily on the
//! first watch of an id, shared by every later subscriber (late joiners get
//! the last emitted snapshot immediately), and runs as its own task:
//!
//! 1. Poll immediately, then on an interval chosen per status.
//! 2. Emit only snapshots whose `(status, finished_at)` changed; `Unknown`
//!    is never distinct and never surfaced.
//! 3. On a terminal snapshot, emit it and tear the stream down.
//!
//! Transient (retryable) failures are absorbed by the retry wrapper and stay
//! invisible to subscribers; a non-retryable failure, or too many exhausted
//! polls in a row, ends the stream with that error. A stream that spends a
//! full tick without subscribers cancels itself.

use crate::channel::{LatestStream, LatestValue};
use crate::config::PollingConfig;
use crate::error::{ClientError, RawFailure};
use crate::retry::RetryRunner;
use crate::snapshot::{parse_snapshot, ExecutionSnapshot};
use crate::status::ExecutionStatus;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Callback invoked for every distinct snapshot emission, before
/// subscribers see it. The client layer mirrors emissions into its state.
pub type EmitHook = Arc<dyn Fn(&ExecutionSnapshot) + Send + Sync>;

/// One item on a watch stream.
pub type WatchItem = Result<ExecutionSnapshot, ClientError>;

struct PollHandle {
    channel: Arc<LatestValue<WatchItem>>,
    task: tokio::task::JoinHandle<()>,
    done: Arc<AtomicBool>,
}

struct EngineInner {
    config: PollingConfig,
    transport: Arc<dyn Transport>,
    retry: RetryRunner,
    streams: Mutex<HashMap<String, PollHandle>>,
    emit_hook: Mutex<Option<EmitHook>>,
}

/// Registry of shared per-id polling streams.
#[derive(Clone)]
pub struct PollingEngine {
    inner: Arc<EngineInner>,
}

impl PollingEngine {
    pub fn new(config: PollingConfig, transport: Arc<dyn Transport>, retry: RetryRunner) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                retry,
                streams: Mutex::new(HashMap::new()),
                emit_hook: Mutex::new(None),
            }),
        }
    }

    /// Install the emission callback. Set once, before the first watch.
    pub fn set_emit_hook(&self, hook: EmitHook) {
        *self.inner.emit_hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    /// Join the live stream for `id`, creating it when absent or already
    /// finished. The first item arrives without waiting an interval.
    pub fn watch(&self, id: &str) -> WatchStream {
        let mut streams = self.inner.streams.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = streams.get(id) {
            if !handle.done.load(Ordering::Acquire) {
                return WatchStream { inner: handle.channel.subscribe() };
            }
            streams.remove(id);
        }

        let channel: Arc<LatestValue<WatchItem>> = Arc::new(LatestValue::new());
        let done = Arc::new(AtomicBool::new(false));
        // Subscribe before the task can emit and close, so even an
        // immediately-terminal execution reaches this subscriber.
        let stream = WatchStream { inner: channel.subscribe() };

        let task = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            id.to_string(),
            Arc::clone(&channel),
            Arc::clone(&done),
        ));
        streams.insert(id.to_string(), PollHandle { channel, task, done });
        stream
    }

    /// Number of live streams, for diagnostics.
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Abort every stream and terminate all subscribers.
    pub fn close(&self) {
        let mut streams = self.inner.streams.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in streams.drain() {
            handle.task.abort();
            handle.done.store(true, Ordering::Release);
            handle.channel.close();
        }
    }
}

async fn poll_loop(
    engine: Weak<EngineInner>,
    id: String,
    channel: Arc<LatestValue<WatchItem>>,
    done: Arc<AtomicBool>,
) {
    let Some(inner) = engine.upgrade() else { return };
    let transport = Arc::clone(&inner.transport);
    let retry = inner.retry.clone();
    let config = inner.config.clone();
    drop(inner);

    let path = format!("api/execution/{id}");
    let mut last_key = None;
    let mut consecutive_errors: u32 = 0;
    let mut interval = config.base_interval;

    loop {
        let poll = retry
            .run(|_attempt| {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let response = transport.get(&path).await.map_err(RawFailure::from)?;
                    parse_snapshot(response.into_success_body()?)
                }
            })
            .await;

        match poll {
            Ok(snapshot) => {
                consecutive_errors = 0;
                let status = snapshot.status;
                if status != ExecutionStatus::Unknown {
                    let key = snapshot.dedup_key();
                    if last_key.as_ref() != Some(&key) {
                        last_key = Some(key);
                        if let Some(inner) = engine.upgrade() {
                            let hook = inner
                                .emit_hook
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .clone();
                            if let Some(hook) = hook {
                                hook(&snapshot);
                            }
                        }
                        channel.publish(Ok(snapshot));
                        if status.is_terminal() {
                            tracing::debug!(id = %id, %status, "poll stream completed");
                            break;
                        }
                    }
                }
                interval = config.interval_for(status);
            }
            Err(error) => {
                let transient = error.is_retryable() || error.is_circuit_open();
                consecutive_errors += 1;
                let exhausted = consecutive_errors >= config.max_consecutive_errors.max(1);
                if !transient || exhausted {
                    tracing::warn!(id = %id, %error, "poll stream failed");
                    channel.publish(Err(error));
                    break;
                }
            }
        }

        tokio::time::sleep(interval).await;

        // One-tick linger: a stream nobody listened to through a whole
        // interval cancels itself. Checked under the registry lock so a
        // concurrent watch() cannot join a stream mid-teardown.
        if channel.subscriber_count() == 0 {
            let Some(inner) = engine.upgrade() else { break };
            let mut streams = inner.streams.lock().unwrap_or_else(|p| p.into_inner());
            if channel.subscriber_count() == 0 {
                done.store(true, Ordering::Release);
                channel.close();
                streams.remove(&id);
                tracing::debug!(id = %id, "poll stream cancelled, no subscribers");
                return;
            }
        }
        if engine.upgrade().is_none() {
            return;
        }
    }

    done.store(true, Ordering::Release);
    channel.close();
    if let Some(inner) = engine.upgrade() {
        inner.streams.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
    }
}

/// Subscriber end of a poll stream.
///
/// Yields `Ok` snapshots in emission order and ends after the terminal one;
/// a non-retryable failure arrives as one `Err` item before the end.
pub struct WatchStream {
    inner: LatestStream<WatchItem>,
}

impl WatchStream {
    pub async fn next(&mut self) -> Option<WatchItem> {
        self.inner.next().await
    }

    /// Drive the stream to its end and return the terminal snapshot.
    pub async fn until_terminal(mut self) -> Result<ExecutionSnapshot, ClientError> {
        let mut last = None;
        while let Some(item) = self.next().await {
            last = Some(item?);
        }
        match last {
            Some(snapshot) if snapshot.status.is_terminal() => Ok(snapshot),
            _ => Err(ClientError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ErrorMonitor;
    use crate::config::{CircuitConfig, RetryConfig};
    use crate::sleeper::InstantSleeper;
    use crate::transport::testing::{ok, status, ScriptedTransport};
    use serde_json::json;
    use std::time::Duration;

    fn engine_with(
        transport: Arc<ScriptedTransport>,
        max_retries: u32,
        base_interval: Duration,
    ) -> PollingEngine {
        let retry = RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_mult: 2.0,
            jitter: false,
        };
        let runner = RetryRunner::new(&retry, ErrorMonitor::new(CircuitConfig::default()))
            .with_sleeper(InstantSleeper);
        let mut config = PollingConfig::default();
        config.base_interval = base_interval;
        config.intervals_by_status.insert(ExecutionStatus::Waiting, base_interval * 10);
        PollingEngine::new(config, transport, runner)
    }

    #[tokio::test(start_paused = true)]
    async fn emits_distinct_snapshots_then_completes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(50));

        let mut stream = engine.watch("e1");
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status, ExecutionStatus::Running);

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.status, ExecutionStatus::Success);

        assert!(stream.next().await.is_none(), "stream ends after terminal");
        assert_eq!(transport.get_count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_is_immediate() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_secs(3600));

        let started = tokio::time::Instant::now();
        let snapshot = engine.watch("e1").until_terminal().await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Success);
        assert!(started.elapsed() < Duration::from_secs(1), "no initial interval wait");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_is_suppressed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        transport.push_get(ok(json!({"id": "e1", "status": "mystery"})));
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(10));

        let mut stream = engine.watch("e1");
        let mut emitted = Vec::new();
        while let Some(item) = stream.next().await {
            emitted.push(item.unwrap().status);
        }
        assert_eq!(emitted, vec![ExecutionStatus::Running, ExecutionStatus::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_share_one_poll_loop() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        transport.fallback_get(ok(json!({"id": "e1", "status": "running"})));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(50));

        let mut a = engine.watch("e1");
        assert_eq!(a.next().await.unwrap().unwrap().status, ExecutionStatus::Running);

        // A late joiner sees the last snapshot immediately, from the same loop.
        let mut b = engine.watch("e1");
        assert_eq!(b.next().await.unwrap().unwrap().status, ExecutionStatus::Running);

        assert_eq!(engine.active_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_terminates_stream() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(status(404, json!({"message": "no such execution"})));
        let engine = engine_with(Arc::clone(&transport), 3, Duration::from_millis(10));

        let mut stream = engine.watch("missing");
        let item = stream.next().await.unwrap();
        let error = item.unwrap_err();
        assert_eq!(error.kind(), Some(crate::error::ErrorKind::Workflow));
        assert!(stream.next().await.is_none());
        assert_eq!(
            transport.get_count.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "workflow errors are not retried"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_hidden_until_the_limit() {
        let transport = Arc::new(ScriptedTransport::new());
        // Poll 1 succeeds; polls 2..6 exhaust their retry chains.
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(10));

        let mut stream = engine.watch("e1");
        assert_eq!(stream.next().await.unwrap().unwrap().status, ExecutionStatus::Running);

        // Default max_consecutive_errors is 5: the stream absorbs four
        // failed polls, then fails on the fifth.
        let item = stream.next().await.unwrap();
        assert!(item.unwrap_err().is_retryable());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_stream_is_removed_and_rewatch_polls_again() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(10));

        let snapshot = engine.watch("e1").until_terminal().await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Success);
        assert_eq!(engine.active_streams(), 0);

        // Watching again spawns a fresh stream that re-fetches.
        let again = engine.watch("e1").until_terminal().await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Success);
        assert_eq!(transport.get_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_stream_cancels_after_one_tick() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback_get(ok(json!({"id": "e1", "status": "running"})));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(50));

        let stream = engine.watch("e1");
        assert_eq!(engine.active_streams(), 1);
        drop(stream);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.active_streams(), 0, "stream cancelled after linger tick");
    }

    #[tokio::test(start_paused = true)]
    async fn emit_hook_sees_every_distinct_emission() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_get(ok(json!({"id": "e1", "status": "running"})));
        transport.push_get(ok(json!({
            "id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"
        })));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(10));

        let seen: Arc<Mutex<Vec<ExecutionStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_emit_hook(Arc::new(move |snapshot| {
            sink.lock().unwrap().push(snapshot.status);
        }));

        engine.watch("e1").until_terminal().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ExecutionStatus::Running, ExecutionStatus::Success]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_terminates_all_streams() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback_get(ok(json!({"id": "e1", "status": "running"})));
        let engine = engine_with(Arc::clone(&transport), 0, Duration::from_millis(50));

        let mut stream = engine.watch("e1");
        assert!(stream.next().await.unwrap().is_ok());

        engine.close();
        assert!(stream.next().await.is_none());
        assert_eq!(engine.active_streams(), 0);
    }
}
