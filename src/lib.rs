#![forbid(unsafe_code)]

//! # Drover
//!
//! Reactive client engine for a webhook-triggered workflow-automation
//! server: start executions, drive each one to a terminal state with
//! adaptive polling, and watch everything happen as live streams.
//!
//! ## Features
//!
//! - **Adaptive polling** with per-status intervals, deduplicated snapshot
//!   streams shared across subscribers, and completion detection
//! - **Failure classification** with retry, exponential backoff + jitter,
//!   and a sliding-window circuit breaker
//! - **Snapshot cache** with TTL + LRU eviction, single-flight misses, and
//!   hit/miss metrics
//! - **Priority submission queue** with throttling and a concurrency cap
//! - **Latest-value and fan-out channels** carrying state, lifecycle
//!   events, errors, and metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drover::{ClientConfig, WorkflowClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WorkflowClient::new(ClientConfig::production("https://flows.example.com"))?;
//!
//!     let started = client.start("order-intake", json!({"order": 4217})).await?;
//!     let mut watch = client.watch(&started.id)?;
//!     while let Some(snapshot) = watch.next().await {
//!         let snapshot = snapshot?;
//!         println!("{} is {}", snapshot.id, snapshot.status);
//!     }
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

mod backoff;
mod cache;
mod channel;
mod circuit;
mod client;
mod clock;
mod config;
mod error;
mod jitter;
mod poller;
mod queue;
mod retry;
mod sleeper;
mod snapshot;
mod status;
mod transport;

// Re-exports
pub use backoff::Backoff;
pub use cache::{CacheEvent, CacheMetrics, CacheWatchStream, EvictReason, ExecutionCache};
pub use channel::{
    EventChannel, EventStream, LatestStream, LatestValue, DEFAULT_EVENT_BUFFER,
};
pub use circuit::{CircuitState, ErrorMonitor};
pub use client::{
    ClientMetrics, ConnectionState, FilteredEvents, WorkflowClient, WorkflowEvent,
    WorkflowEventKind,
};
pub use clock::{Clock, MonotonicClock};
pub use config::{
    CacheConfig, CircuitConfig, ClientConfig, ClientConfigBuilder, ConfigError, PollingConfig,
    QueueConfig, RetryConfig,
};
pub use error::{classify, ClassifiedError, ClientError, ErrorKind, RawFailure};
pub use jitter::Jitter;
pub use poller::{PollingEngine, WatchItem, WatchStream};
pub use queue::{
    ItemStatus, ProcessOutcome, ProcessStream, QueueEvent, QueueItem, QueueMetrics,
    SubmissionQueue,
};
pub use retry::RetryRunner;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use snapshot::{ExecutionSnapshot, WaitingExecution};
pub use status::ExecutionStatus;
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};

pub mod prelude;
