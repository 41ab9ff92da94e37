//! Convenience re-exports for the common path.
//!
//! ```rust
//! use drover::prelude::*;
//! ```

pub use crate::{
    ClientConfig, ClientError, ConnectionState, ErrorKind, ExecutionSnapshot, ExecutionStatus,
    SubmissionQueue, WatchStream, WorkflowClient, WorkflowEvent, WorkflowEventKind,
};
