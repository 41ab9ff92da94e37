//! Execution snapshot wire model.
//!
//! A snapshot is the immutable observable state of one execution at one
//! moment. The server sends camelCase JSON; every field except `id` and
//! `status` is optional and unknown fields are ignored. The `data` payload is
//! kept as an opaque JSON map so unrecognized keys round-trip verbatim; the
//! one documented sub-shape (`waitingExecution`) gets a typed accessor.

use crate::error::RawFailure;
use crate::status::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Observable state of a single workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    /// Server-assigned execution id.
    pub id: String,
    /// Id of the workflow definition this execution belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Set only while the execution is `Waiting` on a timed wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_executed: Option<String>,
    /// URL to POST resume data to while waiting, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_url: Option<String>,
    /// Opaque execution payload. Unknown keys are preserved verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    /// Server-reported error message, if the execution failed.
    #[serde(default, rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of retry attempts consumed to obtain this snapshot.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Server-reported execution time in milliseconds, when present.
    #[serde(default, rename = "executionTime", skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Webhook details published under `data.waitingExecution` while an
/// execution is paused. Sub-workflow waiting data may be stale server-side,
/// so this is informational only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingExecution {
    /// URL to call to resume the paused execution.
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method the resume webhook expects.
    #[serde(default)]
    pub method: Option<String>,
    /// When a timed wait elapses on its own.
    #[serde(default)]
    pub wait_till: Option<DateTime<Utc>>,
}

impl ExecutionSnapshot {
    /// Key used to decide whether two consecutive snapshots are distinct.
    pub fn dedup_key(&self) -> (ExecutionStatus, Option<DateTime<Utc>>) {
        (self.status, self.finished_at)
    }

    /// Wall-clock execution time.
    ///
    /// Prefers the server-reported value; falls back to the span between
    /// `started_at` and `finished_at` (or `stopped_at`) when both ends are
    /// known.
    pub fn execution_time(&self) -> Option<Duration> {
        if let Some(ms) = self.execution_time_ms {
            return Some(Duration::from_millis(ms));
        }
        let start = self.started_at?;
        let end = self.finished_at.or(self.stopped_at)?;
        (end - start).to_std().ok()
    }

    /// Decode the documented `data.waitingExecution` sub-object, if present
    /// and well-formed.
    pub fn waiting_execution(&self) -> Option<WaitingExecution> {
        let raw = self.data.get("waitingExecution")?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Decode a server body into a snapshot; schema drift surfaces verbatim as
/// a parse failure.
pub(crate) fn parse_snapshot(value: Value) -> Result<ExecutionSnapshot, RawFailure> {
    serde_json::from_value(value).map_err(|e| RawFailure::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> ExecutionSnapshot {
        serde_json::from_value(v).expect("snapshot should parse")
    }

    #[test]
    fn minimal_snapshot_parses() {
        let snap = parse(json!({"id": "e1", "status": "running"}));
        assert_eq!(snap.id, "e1");
        assert_eq!(snap.status, ExecutionStatus::Running);
        assert!(snap.finished_at.is_none());
        assert!(snap.data.is_empty());
        assert_eq!(snap.retry_count, 0);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let snap = parse(json!({
            "id": "e1",
            "status": "success",
            "finishedAt": "2025-01-01T00:00:10Z",
            "someFutureField": {"nested": true}
        }));
        assert_eq!(snap.status, ExecutionStatus::Success);
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn missing_id_is_a_parse_error() {
        let err = serde_json::from_value::<ExecutionSnapshot>(json!({"status": "running"}));
        assert!(err.is_err());
    }

    #[test]
    fn data_round_trips_unknown_keys() {
        let snap = parse(json!({
            "id": "e1",
            "status": "waiting",
            "data": {"custom": [1, 2, 3], "waitingExecution": {"url": "https://x/resume"}}
        }));
        assert_eq!(snap.data.get("custom"), Some(&json!([1, 2, 3])));

        let back = serde_json::to_value(&snap).unwrap();
        assert_eq!(back["data"]["custom"], json!([1, 2, 3]));
        assert_eq!(back["data"]["waitingExecution"]["url"], json!("https://x/resume"));
    }

    #[test]
    fn waiting_execution_accessor() {
        let snap = parse(json!({
            "id": "e1",
            "status": "waiting",
            "data": {
                "waitingExecution": {
                    "url": "https://host/webhook-waiting/e1",
                    "method": "POST",
                    "waitTill": "2025-06-01T12:00:00Z",
                    "staleServerField": 7
                }
            }
        }));
        let waiting = snap.waiting_execution().expect("sub-object decodes");
        assert_eq!(waiting.url.as_deref(), Some("https://host/webhook-waiting/e1"));
        assert_eq!(waiting.method.as_deref(), Some("POST"));
        assert!(waiting.wait_till.is_some());
    }

    #[test]
    fn waiting_execution_absent_when_not_waiting() {
        let snap = parse(json!({"id": "e1", "status": "running"}));
        assert!(snap.waiting_execution().is_none());
    }

    #[test]
    fn execution_time_prefers_server_value() {
        let snap = parse(json!({
            "id": "e1",
            "status": "success",
            "startedAt": "2025-01-01T00:00:00Z",
            "finishedAt": "2025-01-01T00:00:10Z",
            "executionTime": 1234
        }));
        assert_eq!(snap.execution_time(), Some(Duration::from_millis(1234)));
    }

    #[test]
    fn execution_time_derived_from_timestamps() {
        let snap = parse(json!({
            "id": "e1",
            "status": "success",
            "startedAt": "2025-01-01T00:00:00Z",
            "finishedAt": "2025-01-01T00:00:10Z"
        }));
        assert_eq!(snap.execution_time(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn dedup_key_tracks_status_and_finished_at() {
        let a = parse(json!({"id": "e1", "status": "running"}));
        let b = parse(json!({"id": "e1", "status": "running", "lastNodeExecuted": "n2"}));
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = parse(json!({"id": "e1", "status": "success", "finishedAt": "2025-01-01T00:00:10Z"}));
        assert_ne!(a.dedup_key(), c.dedup_key());
    }
}
