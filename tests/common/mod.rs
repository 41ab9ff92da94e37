#![allow(dead_code)]

use async_trait::async_trait;
use drover::{Transport, TransportError, TransportResponse};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub fn response(status: u16, body: Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse { status, body, retry_after: None })
}

pub fn network_failure() -> Result<TransportResponse, TransportError> {
    Err(TransportError::Connect("connection reset".into()))
}

/// Scripted transport for end-to-end scenarios. Responses are queued per
/// verb; health probes are answered out of band so they never disturb a
/// script. GET instants are recorded for interval assertions.
#[derive(Default)]
pub struct MockTransport {
    gets: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    posts: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    deletes: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    pub get_count: AtomicU32,
    pub post_count: AtomicU32,
    pub delete_count: AtomicU32,
    pub get_paths: Mutex<Vec<String>>,
    pub post_paths: Mutex<Vec<String>>,
    pub get_times: Mutex<Vec<tokio::time::Instant>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_get(&self, response: Result<TransportResponse, TransportError>) {
        self.gets.lock().unwrap().push_back(response);
    }

    pub fn push_post(&self, response: Result<TransportResponse, TransportError>) {
        self.posts.lock().unwrap().push_back(response);
    }

    pub fn push_delete(&self, response: Result<TransportResponse, TransportError>) {
        self.deletes.lock().unwrap().push_back(response);
    }

    /// Gaps between consecutive recorded GETs.
    pub fn get_gaps(&self) -> Vec<std::time::Duration> {
        let times = self.get_times.lock().unwrap();
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, path: &str) -> Result<TransportResponse, TransportError> {
        if path.ends_with("api/health") {
            return response(200, Value::Null);
        }
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.get_paths.lock().unwrap().push(path.to_string());
        self.get_times.lock().unwrap().push(tokio::time::Instant::now());
        self.gets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("get script exhausted".into())))
    }

    async fn post(&self, path: &str, _body: &Value) -> Result<TransportResponse, TransportError> {
        self.post_count.fetch_add(1, Ordering::SeqCst);
        self.post_paths.lock().unwrap().push(path.to_string());
        self.posts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("post script exhausted".into())))
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        self.deletes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("delete script exhausted".into())))
    }
}
