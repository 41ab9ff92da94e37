//! Failure taxonomy, the ordered classifier, and the public error type.

use crate::backoff::Backoff;
use crate::jitter::Jitter;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused, DNS failure, reset, other I/O.
    Network,
    /// Per-call deadline exceeded.
    Timeout,
    /// Server returned 5xx.
    Server5xx,
    /// Server returned 429.
    RateLimit,
    /// Server returned 401 or 403.
    Auth,
    /// Server rejected the request as invalid (400, 404, 422).
    Workflow,
    /// Response body did not decode or did not match the expected shape.
    Parse,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order. Drives the per-category channels.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Server5xx,
        ErrorKind::RateLimit,
        ErrorKind::Auth,
        ErrorKind::Workflow,
        ErrorKind::Parse,
        ErrorKind::Unknown,
    ];

    /// Position in [`ErrorKind::ALL`]; backs the per-category channel table.
    pub(crate) fn index(self) -> usize {
        match self {
            ErrorKind::Network => 0,
            ErrorKind::Timeout => 1,
            ErrorKind::Server5xx => 2,
            ErrorKind::RateLimit => 3,
            ErrorKind::Auth => 4,
            ErrorKind::Workflow => 5,
            ErrorKind::Parse => 6,
            ErrorKind::Unknown => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server5xx => "server_5xx",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Workflow => "workflow",
            ErrorKind::Parse => "parse",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure observed at the transport boundary, before classification.
#[derive(Debug, Clone)]
pub enum RawFailure {
    /// Could not reach the server at all.
    Connect(String),
    /// The per-call deadline elapsed.
    Timeout {
        /// Configured limit that was exceeded.
        limit: Duration,
    },
    /// The server answered with a non-2xx status.
    Http {
        status: u16,
        /// Parsed `Retry-After` header, when the server sent one.
        retry_after: Option<Duration>,
        message: String,
    },
    /// The response body could not be decoded into the expected shape.
    Parse(String),
}

/// A failure after classification: tagged, with a retry decision attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// Suggested wait before the next attempt; `None` for non-retryable kinds.
    pub delay: Option<Duration>,
    pub http_status: Option<u16>,
    /// 1-indexed attempt that produced this failure.
    pub attempt: u32,
    pub message: String,
    pub at: SystemTime,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error (attempt {})", self.kind, self.attempt)?;
        if let Some(status) = self.http_status {
            write!(f, " [HTTP {status}]")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClassifiedError {}

/// Map a raw failure to its kind, retryability, and suggested delay.
///
/// Rules are applied in order: network, timeout, 429 (honoring the server's
/// `Retry-After` when present), 5xx, 401/403, 400/404/422, parse, unknown.
/// Backoff delays are jittered here so every consumer sees the same decision.
pub fn classify(
    raw: RawFailure,
    attempt: u32,
    backoff: &Backoff,
    jitter: &Jitter,
) -> ClassifiedError {
    let backoff_delay = || Some(jitter.apply(backoff.delay(attempt)));
    let at = SystemTime::now();

    let (kind, retryable, delay, http_status, message) = match raw {
        RawFailure::Connect(message) => (ErrorKind::Network, true, backoff_delay(), None, message),
        RawFailure::Timeout { limit } => (
            ErrorKind::Timeout,
            true,
            backoff_delay(),
            None,
            format!("deadline of {limit:?} exceeded"),
        ),
        RawFailure::Http { status: 429, retry_after, message } => (
            ErrorKind::RateLimit,
            true,
            retry_after.or_else(backoff_delay),
            Some(429),
            message,
        ),
        RawFailure::Http { status, message, .. } if (500..600).contains(&status) => {
            (ErrorKind::Server5xx, true, backoff_delay(), Some(status), message)
        }
        RawFailure::Http { status: status @ (401 | 403), message, .. } => {
            (ErrorKind::Auth, false, None, Some(status), message)
        }
        RawFailure::Http { status: status @ (400 | 404 | 422), message, .. } => {
            (ErrorKind::Workflow, false, None, Some(status), message)
        }
        RawFailure::Parse(message) => (ErrorKind::Parse, false, None, None, message),
        RawFailure::Http { status, message, .. } => {
            (ErrorKind::Unknown, false, None, Some(status), message)
        }
    };

    ClassifiedError { kind, retryable, delay, http_status, attempt, message, at }
}

/// The single tagged error surfaced by every public operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// A request failed; the classification carries kind, HTTP status,
    /// attempt count, and timestamp.
    #[error(transparent)]
    Request(ClassifiedError),
    /// The circuit breaker rejected the call before any transport activity.
    #[error("circuit open ({failures} failures in window, open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },
    /// The submission queue is at its bound.
    #[error("submission queue full ({queued}/{max})")]
    QueueFull { queued: usize, max: usize },
    /// The client was closed; no further operations are possible.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// Kind of the underlying classified failure, if this is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Request(c) => Some(c.kind),
            _ => None,
        }
    }

    /// Borrow the classification, if this is a request failure.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Request(c) => Some(c),
            _ => None,
        }
    }

    /// Whether retrying the operation could help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(c) if c.retryable)
    }
}
