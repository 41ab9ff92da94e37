//! Bounded priority queue for bulk workflow submissions.
//!
//! Items are ordered by priority (descending) with FIFO ties and dispatched
//! by a processor that enforces a minimum inter-dispatch spacing and a
//! concurrency cap (a semaphore, one permit per in-flight item). A failing
//! item never stops the processor; it may be redispatched a bounded number
//! of times before it is marked failed. Dequeued items leave behind only
//! their terminal status in the metrics.

use crate::channel::{EventChannel, EventStream, LatestStream, LatestValue};
use crate::client::WorkflowClient;
use crate::config::QueueConfig;
use crate::error::ClientError;
use crate::snapshot::ExecutionSnapshot;
use crate::status::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};
use uuid::Uuid;

/// Lifecycle of one queued submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A queued webhook submission.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub internal_id: String,
    pub webhook_id: String,
    pub payload: Value,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub retry_count: u32,
}

/// Queue lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    ItemEnqueued { internal_id: String, webhook_id: String, priority: i32 },
    ItemStarted { internal_id: String, execution_id: String },
    ItemCompleted { internal_id: String, execution_id: String, status: ExecutionStatus },
    ItemFailed { internal_id: String, error: String },
}

/// Queue counters, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    pub queued: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    /// Everything ever enqueued.
    pub total: u64,
}

/// Dispatch order: highest priority first, FIFO within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<i32>,
    seq: u64,
}

struct QueueState {
    pending: BTreeMap<OrderKey, QueueItem>,
    next_seq: u64,
    processing: usize,
    completed: u64,
    failed: u64,
    total: u64,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    events: EventChannel<QueueEvent>,
    metrics: LatestValue<QueueMetrics>,
    wakeup: Notify,
}

/// The result the processor reports for one item.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub internal_id: String,
    pub webhook_id: String,
    /// How many redispatches this item consumed.
    pub retries: u32,
    pub result: Result<ExecutionSnapshot, ClientError>,
}

/// Stream of per-item results from [`SubmissionQueue::process`]. Dropping
/// it stops the processor; items already dispatched finish quietly.
pub struct ProcessStream {
    rx: mpsc::UnboundedReceiver<ProcessOutcome>,
    task: tokio::task::JoinHandle<()>,
}

impl ProcessStream {
    pub async fn next(&mut self) -> Option<ProcessOutcome> {
        self.rx.recv().await
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bounded, priority-ordered submission queue.
#[derive(Clone)]
pub struct SubmissionQueue {
    inner: Arc<QueueInner>,
}

impl SubmissionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    next_seq: 0,
                    processing: 0,
                    completed: 0,
                    failed: 0,
                    total: 0,
                }),
                events: EventChannel::new(),
                metrics: LatestValue::seeded(QueueMetrics {
                    queued: 0,
                    processing: 0,
                    completed: 0,
                    failed: 0,
                    total: 0,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Queue sized from the client's configuration.
    pub fn for_client(client: &WorkflowClient) -> Self {
        Self::new(client.queue_config().clone())
    }

    /// Add a submission; returns its internal id, or `QueueFull` at the
    /// bound. Emits `ItemEnqueued`.
    pub fn enqueue(
        &self,
        webhook_id: &str,
        payload: Value,
        priority: i32,
    ) -> Result<String, ClientError> {
        let internal_id = Uuid::new_v4().to_string();
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.pending.len() >= self.inner.config.max_size {
                return Err(ClientError::QueueFull {
                    queued: state.pending.len(),
                    max: self.inner.config.max_size,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.total += 1;
            state.pending.insert(
                OrderKey { priority: Reverse(priority), seq },
                QueueItem {
                    internal_id: internal_id.clone(),
                    webhook_id: webhook_id.to_string(),
                    payload,
                    priority,
                    enqueued_at: Utc::now(),
                    status: ItemStatus::Pending,
                    retry_count: 0,
                },
            );
        }
        self.inner.events.publish(QueueEvent::ItemEnqueued {
            internal_id: internal_id.clone(),
            webhook_id: webhook_id.to_string(),
            priority,
        });
        self.inner.publish_metrics();
        self.inner.wakeup.notify_one();
        Ok(internal_id)
    }

    /// Remove a submission that has not been dispatched yet.
    pub fn remove(&self, internal_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            let key = state
                .pending
                .iter()
                .find(|(_, item)| item.internal_id == internal_id)
                .map(|(key, _)| *key);
            match key {
                Some(key) => state.pending.remove(&key).is_some(),
                None => false,
            }
        };
        if removed {
            self.inner.publish_metrics();
        }
        removed
    }

    /// Drop every pending submission.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            state.pending.clear();
        }
        self.inner.publish_metrics();
    }

    /// Pending submissions, in dispatch order.
    pub fn pending(&self) -> Vec<QueueItem> {
        let state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending.values().cloned().collect()
    }

    /// Queue events from now on.
    pub fn events(&self) -> EventStream<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Metrics as latest value plus changes.
    pub fn metrics(&self) -> LatestStream<QueueMetrics> {
        self.inner.metrics.subscribe()
    }

    /// Current metrics.
    pub fn metrics_snapshot(&self) -> QueueMetrics {
        self.inner.compute_metrics()
    }

    /// Start dispatching queued items through `client` and stream each
    /// item's result. The processor runs until the stream is dropped.
    pub fn process(&self, client: WorkflowClient) -> ProcessStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent));
            let mut last_dispatch: Option<tokio::time::Instant> = None;

            loop {
                let item = {
                    let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                    let key = state.pending.keys().next().copied();
                    key.and_then(|key| state.pending.remove(&key))
                };
                let Some(mut item) = item else {
                    tokio::select! {
                        _ = inner.wakeup.notified() => continue,
                        _ = tx.closed() => break,
                    }
                };

                if let Some(last) = last_dispatch {
                    let since = last.elapsed();
                    if since < inner.config.throttle {
                        tokio::time::sleep(inner.config.throttle - since).await;
                    }
                }
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else { break };
                last_dispatch = Some(tokio::time::Instant::now());

                item.status = ItemStatus::Processing;
                {
                    let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                    state.processing += 1;
                }
                inner.publish_metrics();

                let inner_task = Arc::clone(&inner);
                let client = client.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = dispatch_item(&inner_task, &client, item).await;
                    {
                        let mut state =
                            inner_task.state.lock().unwrap_or_else(|p| p.into_inner());
                        state.processing -= 1;
                        match &outcome.result {
                            Ok(_) => state.completed += 1,
                            Err(_) => state.failed += 1,
                        }
                    }
                    inner_task.publish_metrics();
                    let _ = tx.send(outcome);
                });
            }
        });
        ProcessStream { rx, task }
    }
}

/// Run one item to its conclusion: start, optionally follow to terminal,
/// redispatching up to the configured retry budget.
async fn dispatch_item(
    inner: &QueueInner,
    client: &WorkflowClient,
    mut item: QueueItem,
) -> ProcessOutcome {
    let budget = inner.config.max_item_retries;
    loop {
        let attempt_result = attempt_item(inner, client, &item).await;
        match attempt_result {
            Ok(snapshot) => {
                item.status = ItemStatus::Completed;
                return ProcessOutcome {
                    internal_id: item.internal_id,
                    webhook_id: item.webhook_id,
                    retries: item.retry_count,
                    result: Ok(snapshot),
                };
            }
            Err(error) if item.retry_count < budget => {
                item.retry_count += 1;
                tracing::debug!(
                    internal_id = %item.internal_id,
                    retry = item.retry_count,
                    %error,
                    "redispatching queue item"
                );
            }
            Err(error) => {
                item.status = ItemStatus::Failed;
                inner.events.publish(QueueEvent::ItemFailed {
                    internal_id: item.internal_id.clone(),
                    error: error.to_string(),
                });
                return ProcessOutcome {
                    internal_id: item.internal_id,
                    webhook_id: item.webhook_id,
                    retries: item.retry_count,
                    result: Err(error),
                };
            }
        }
    }
}

async fn attempt_item(
    inner: &QueueInner,
    client: &WorkflowClient,
    item: &QueueItem,
) -> Result<ExecutionSnapshot, ClientError> {
    let started = client.start(&item.webhook_id, item.payload.clone()).await?;
    inner.events.publish(QueueEvent::ItemStarted {
        internal_id: item.internal_id.clone(),
        execution_id: started.id.clone(),
    });

    let snapshot = if inner.config.wait_for_completion && !started.status.is_terminal() {
        client.watch(&started.id)?.until_terminal().await?
    } else {
        started
    };

    inner.events.publish(QueueEvent::ItemCompleted {
        internal_id: item.internal_id.clone(),
        execution_id: snapshot.id.clone(),
        status: snapshot.status,
    });
    Ok(snapshot)
}

impl QueueInner {
    fn compute_metrics(&self) -> QueueMetrics {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        QueueMetrics {
            queued: state.pending.len(),
            processing: state.processing,
            completed: state.completed,
            failed: state.failed,
            total: state.total,
        }
    }

    fn publish_metrics(&self) {
        self.metrics.publish(self.compute_metrics());
    }
}
