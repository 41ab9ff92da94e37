//! The core client: start, watch, resume, cancel, and the state layer.
//!
//! A [`WorkflowClient`] owns its transport, error monitor, cache, and polling
//! registry; multiple clients are fully independent. Every operation goes
//! through the retry wrapper, every transport call feeds the metrics stream,
//! and lifecycle changes fan out as [`WorkflowEvent`]s. `close()` tears all
//! of it down and terminates every subscriber.

use crate::cache::ExecutionCache;
use crate::channel::{EventChannel, EventStream, LatestStream, LatestValue};
use crate::circuit::{CircuitState, ErrorMonitor};
use crate::config::{ClientConfig, ConfigError};
use crate::error::{ClassifiedError, ClientError, ErrorKind, RawFailure};
use crate::poller::{PollingEngine, WatchStream};
use crate::retry::RetryRunner;
use crate::snapshot::{parse_snapshot, ExecutionSnapshot};
use crate::status::ExecutionStatus;
use crate::transport::{HttpTransport, Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Health of the connection to the server, as judged by the periodic probe.
/// Probe failures never affect operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionError,
}

/// Lifecycle events published on the client's fan-out channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    WorkflowStarted { execution_id: String, webhook_id: String },
    WorkflowCompleted { execution_id: String, status: ExecutionStatus },
    WorkflowResumed { execution_id: String },
    WorkflowCancelled { execution_id: String },
}

/// Event discriminant, for filtered sub-streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEventKind {
    Started,
    Completed,
    Resumed,
    Cancelled,
}

impl WorkflowEvent {
    pub fn kind(&self) -> WorkflowEventKind {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => WorkflowEventKind::Started,
            WorkflowEvent::WorkflowCompleted { .. } => WorkflowEventKind::Completed,
            WorkflowEvent::WorkflowResumed { .. } => WorkflowEventKind::Resumed,
            WorkflowEvent::WorkflowCancelled { .. } => WorkflowEventKind::Cancelled,
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { execution_id, .. }
            | WorkflowEvent::WorkflowCompleted { execution_id, .. }
            | WorkflowEvent::WorkflowResumed { execution_id }
            | WorkflowEvent::WorkflowCancelled { execution_id } => execution_id,
        }
    }
}

/// Request counters, published after every transport call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub ok_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: Duration,
}

/// Events of one kind only.
pub struct FilteredEvents {
    inner: EventStream<WorkflowEvent>,
    kind: WorkflowEventKind,
}

impl FilteredEvents {
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        while let Some(event) = self.inner.next().await {
            if event.kind() == self.kind {
                return Some(event);
            }
        }
        None
    }
}

struct CallStats {
    total: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    elapsed_nanos: AtomicU64,
    channel: LatestValue<ClientMetrics>,
}

impl CallStats {
    fn new() -> Self {
        let zero = ClientMetrics {
            total_requests: 0,
            ok_requests: 0,
            failed_requests: 0,
            avg_response_time: Duration::ZERO,
        };
        Self {
            total: AtomicU64::new(0),
            ok: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            elapsed_nanos: AtomicU64::new(0),
            channel: LatestValue::seeded(zero),
        }
    }

    fn record(&self, ok: bool, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.elapsed_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.channel.publish(self.snapshot());
    }

    fn snapshot(&self) -> ClientMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let avg = if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed) / total)
        };
        ClientMetrics {
            total_requests: total,
            ok_requests: self.ok.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            avg_response_time: avg,
        }
    }
}

/// Counts every call and its latency on the way through. A call is `ok`
/// when a 2xx response came back.
struct MeteredTransport {
    inner: Arc<dyn Transport>,
    stats: Arc<CallStats>,
}

impl MeteredTransport {
    async fn record<F>(&self, call: F) -> Result<TransportResponse, TransportError>
    where
        F: std::future::Future<Output = Result<TransportResponse, TransportError>>,
    {
        let started = Instant::now();
        let result = call.await;
        let ok = matches!(&result, Ok(response) if response.is_success());
        self.stats.record(ok, started.elapsed());
        result
    }
}

#[async_trait]
impl Transport for MeteredTransport {
    async fn get(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.record(self.inner.get(path)).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<TransportResponse, TransportError> {
        self.record(self.inner.post(path, body)).await
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.record(self.inner.delete(path)).await
    }
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    monitor: ErrorMonitor,
    retry: RetryRunner,
    cache: ExecutionCache,
    poller: PollingEngine,
    executions: Mutex<HashMap<String, ExecutionSnapshot>>,
    execution_state: LatestValue<HashMap<String, ExecutionSnapshot>>,
    events: EventChannel<WorkflowEvent>,
    connection: LatestValue<ConnectionState>,
    stats: Arc<CallStats>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientInner {
    /// Single-writer state update; also decides whether this emission
    /// completes the execution.
    fn record_snapshot(&self, snapshot: &ExecutionSnapshot) {
        let was_terminal = {
            let mut executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
            let was_terminal = executions
                .get(&snapshot.id)
                .is_some_and(|existing| existing.status.is_terminal());
            executions.insert(snapshot.id.clone(), snapshot.clone());
            self.execution_state.publish(executions.clone());
            was_terminal
        };
        if snapshot.status.is_terminal() && !was_terminal {
            self.events.publish(WorkflowEvent::WorkflowCompleted {
                execution_id: snapshot.id.clone(),
                status: snapshot.status,
            });
        }
    }

    fn remove_execution(&self, id: &str) {
        let mut executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        if executions.remove(id).is_some() {
            self.execution_state.publish(executions.clone());
        }
    }
}

/// Client for a webhook-triggered workflow-automation server.
///
/// Cloning is cheap and shares all state; independent instances come from
/// independent constructors.
#[derive(Clone)]
pub struct WorkflowClient {
    inner: Arc<ClientInner>,
}

impl WorkflowClient {
    /// Build a client with the production HTTP transport. Must be called
    /// from within a tokio runtime: the health probe, cache sweeper, and
    /// error-rate tick start here.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Build a client over any transport; the seam the tests use.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(CallStats::new());
        let transport: Arc<dyn Transport> =
            Arc::new(MeteredTransport { inner: transport, stats: Arc::clone(&stats) });

        let monitor = ErrorMonitor::new(config.circuit.clone());
        let retry = RetryRunner::new(&config.retry, monitor.clone());
        let cache = ExecutionCache::new(config.cache.clone());
        let poller =
            PollingEngine::new(config.polling.clone(), Arc::clone(&transport), retry.clone());

        let inner = Arc::new(ClientInner {
            config,
            transport,
            monitor,
            retry,
            cache,
            poller,
            executions: Mutex::new(HashMap::new()),
            execution_state: LatestValue::seeded(HashMap::new()),
            events: EventChannel::new(),
            connection: LatestValue::seeded(ConnectionState::Connecting),
            stats,
            health_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let hook_target: Weak<ClientInner> = Arc::downgrade(&inner);
        inner.poller.set_emit_hook(Arc::new(move |snapshot| {
            if let Some(inner) = hook_target.upgrade() {
                inner.record_snapshot(snapshot);
            }
        }));

        let probe_target: Weak<ClientInner> = Arc::downgrade(&inner);
        let period = inner.config.health_probe_every;
        let health = tokio::spawn(async move {
            loop {
                let Some(inner) = probe_target.upgrade() else { break };
                let state = match inner.transport.get("api/health").await {
                    Ok(response) if response.is_success() => ConnectionState::Connected,
                    Ok(response) => {
                        tracing::warn!(status = response.status, "health probe failed");
                        ConnectionState::ConnectionError
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "health probe failed");
                        ConnectionState::ConnectionError
                    }
                };
                inner.connection.publish(state);
                drop(inner);
                tokio::time::sleep(period).await;
            }
        });
        *inner.health_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(health);

        Ok(Self { inner })
    }

    /// Trigger the webhook and seed the execution state with the server's
    /// initial snapshot. Emits `WorkflowStarted`.
    pub async fn start(
        &self,
        webhook_id: &str,
        payload: Value,
    ) -> Result<ExecutionSnapshot, ClientError> {
        self.ensure_open()?;
        let path = format!("{}/{}", self.inner.config.webhook_base_path, webhook_id);
        let transport = Arc::clone(&self.inner.transport);

        let snapshot = self
            .inner
            .retry
            .run(|_attempt| {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                let payload = payload.clone();
                async move {
                    let response =
                        transport.post(&path, &payload).await.map_err(RawFailure::from)?;
                    parse_snapshot(response.into_success_body()?)
                }
            })
            .await?;

        tracing::info!(execution_id = %snapshot.id, webhook_id, "workflow started");
        self.inner.record_snapshot(&snapshot);
        self.inner.events.publish(WorkflowEvent::WorkflowStarted {
            execution_id: snapshot.id.clone(),
            webhook_id: webhook_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Live snapshot stream for an execution, shared across subscribers.
    /// Distinct emissions update the execution state; the terminal one
    /// produces a single `WorkflowCompleted`.
    pub fn watch(&self, id: &str) -> Result<WatchStream, ClientError> {
        self.ensure_open()?;
        Ok(self.inner.poller.watch(id))
    }

    /// Start, then follow the execution to its terminal snapshot.
    pub async fn run(
        &self,
        webhook_id: &str,
        payload: Value,
    ) -> Result<ExecutionSnapshot, ClientError> {
        let started = self.start(webhook_id, payload).await?;
        if started.status.is_terminal() {
            return Ok(started);
        }
        self.watch(&started.id)?.until_terminal().await
    }

    /// Resume a waiting execution with form data. Only retryable failures
    /// are retried; one invocation is one logical resume. Emits
    /// `WorkflowResumed` on success.
    pub async fn resume(&self, id: &str, form_data: Value) -> Result<bool, ClientError> {
        self.ensure_open()?;
        let path = format!("api/resume-workflow/{id}");
        let transport = Arc::clone(&self.inner.transport);

        let resumed = self
            .inner
            .retry
            .run(|_attempt| {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                let form_data = form_data.clone();
                async move {
                    let response =
                        transport.post(&path, &form_data).await.map_err(RawFailure::from)?;
                    parse_success_flag(response.into_success_body()?)
                }
            })
            .await?;

        if resumed {
            tracing::info!(execution_id = %id, "workflow resumed");
            self.inner.cache.invalidate(id);
            self.inner
                .events
                .publish(WorkflowEvent::WorkflowResumed { execution_id: id.to_string() });
        }
        Ok(resumed)
    }

    /// Cancel an execution. Idempotent: once the state map holds a terminal
    /// snapshot for the id, repeated cancels succeed without a transport
    /// call. Success removes the id from the state map and emits
    /// `WorkflowCancelled`.
    pub async fn cancel(&self, id: &str) -> Result<bool, ClientError> {
        self.ensure_open()?;
        let already_terminal = {
            let executions = self.inner.executions.lock().unwrap_or_else(|p| p.into_inner());
            executions.get(id).is_some_and(|s| s.status.is_terminal())
        };
        if already_terminal {
            return Ok(true);
        }

        let path = format!("api/cancel-workflow/{id}");
        let transport = Arc::clone(&self.inner.transport);

        let cancelled = self
            .inner
            .retry
            .run(|_attempt| {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let response = transport.delete(&path).await.map_err(RawFailure::from)?;
                    parse_success_flag(response.into_success_body()?)
                }
            })
            .await?;

        if cancelled {
            tracing::info!(execution_id = %id, "workflow cancelled");
            self.inner.remove_execution(id);
            self.inner.cache.invalidate(id);
            self.inner
                .events
                .publish(WorkflowEvent::WorkflowCancelled { execution_id: id.to_string() });
        }
        Ok(cancelled)
    }

    /// List executions, optionally filtered by workflow. Never cached: the
    /// server may omit `Waiting` executions from bulk lists, so these
    /// results are not allowed to poison point reads.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSnapshot>, ClientError> {
        self.ensure_open()?;
        let mut path = format!("api/executions?limit={limit}");
        if let Some(workflow_id) = workflow_id {
            path.push_str(&format!("&workflowId={workflow_id}"));
        }
        let transport = Arc::clone(&self.inner.transport);

        self.inner
            .retry
            .run(|_attempt| {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let response = transport.get(&path).await.map_err(RawFailure::from)?;
                    parse_snapshot_list(response.into_success_body()?)
                }
            })
            .await
    }

    /// Point read through the execution cache.
    pub async fn execution(&self, id: &str) -> Result<ExecutionSnapshot, ClientError> {
        self.ensure_open()?;
        let retry = self.inner.retry.clone();
        let transport = Arc::clone(&self.inner.transport);
        let path = format!("api/execution/{id}");
        self.inner
            .cache
            .get_with(id, || async move {
                retry
                    .run(|_attempt| {
                        let transport = Arc::clone(&transport);
                        let path = path.clone();
                        async move {
                            let response =
                                transport.get(&path).await.map_err(RawFailure::from)?;
                            parse_snapshot(response.into_success_body()?)
                        }
                    })
                    .await
            })
            .await
    }

    /// Warm the cache for a set of ids.
    pub async fn prewarm(&self, ids: &[String]) -> Result<(), ClientError> {
        self.ensure_open()?;
        for id in ids {
            self.execution(id).await?;
        }
        Ok(())
    }

    /// All lifecycle events from now on.
    pub fn events(&self) -> EventStream<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events of one kind.
    pub fn events_of(&self, kind: WorkflowEventKind) -> FilteredEvents {
        FilteredEvents { inner: self.inner.events.subscribe(), kind }
    }

    /// The execution state map as latest value plus changes.
    pub fn execution_state(&self) -> LatestStream<HashMap<String, ExecutionSnapshot>> {
        self.inner.execution_state.subscribe()
    }

    /// Copy of the current execution state map.
    pub fn execution_state_snapshot(&self) -> HashMap<String, ExecutionSnapshot> {
        self.inner.executions.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Connection health as latest value plus changes.
    pub fn connection_state(&self) -> LatestStream<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Request metrics as latest value plus changes.
    pub fn metrics(&self) -> LatestStream<ClientMetrics> {
        self.inner.stats.channel.subscribe()
    }

    /// Current request metrics.
    pub fn metrics_snapshot(&self) -> ClientMetrics {
        self.inner.stats.snapshot()
    }

    /// All classified errors, including transient ones later retried away.
    pub fn errors(&self) -> EventStream<ClassifiedError> {
        self.inner.monitor.errors()
    }

    /// Classified errors of one kind.
    pub fn errors_of(&self, kind: ErrorKind) -> EventStream<ClassifiedError> {
        self.inner.monitor.errors_of(kind)
    }

    /// Circuit state as latest value plus changes.
    pub fn circuit_state(&self) -> LatestStream<CircuitState> {
        self.inner.monitor.circuit_state()
    }

    /// Errors per second over the circuit window.
    pub fn error_rate(&self) -> LatestStream<f64> {
        self.inner.monitor.error_rate()
    }

    /// The snapshot cache, for invalidation and watch streams.
    pub fn cache(&self) -> &ExecutionCache {
        &self.inner.cache
    }

    /// The error monitor backing this client.
    pub fn monitor(&self) -> &ErrorMonitor {
        &self.inner.monitor
    }

    pub(crate) fn queue_config(&self) -> &crate::config::QueueConfig {
        &self.inner.config.queue
    }

    /// Tear the client down: stop the health probe, cancel every poll
    /// stream, stop the cache sweeper, and terminate all subscribers.
    /// Idempotent; later operations fail with [`ClientError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing workflow client");
        if let Some(handle) =
            self.inner.health_task.lock().unwrap_or_else(|p| p.into_inner()).take()
        {
            handle.abort();
        }
        self.inner.connection.publish(ConnectionState::Disconnected);
        self.inner.poller.close();
        self.inner.cache.close();
        self.inner.monitor.close();
        self.inner.events.close();
        self.inner.execution_state.close();
        self.inner.connection.close();
        self.inner.stats.channel.close();
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

/// Decode the `{"success": bool}` bodies of resume and cancel.
fn parse_success_flag(body: Value) -> Result<bool, RawFailure> {
    body.get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| RawFailure::Parse("response has no boolean `success` field".into()))
}

/// Decode a list body: either a bare array or wrapped under `data`.
fn parse_snapshot_list(body: Value) -> Result<Vec<ExecutionSnapshot>, RawFailure> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => return Err(RawFailure::Parse("expected an execution list".into())),
        },
        _ => return Err(RawFailure::Parse("expected an execution list".into())),
    };
    items.into_iter().map(parse_snapshot).collect()
}
