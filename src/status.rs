//! Execution status lifecycle and wire-string mapping.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Lifecycle status of a workflow execution.
///
/// `Success`, `Error`, `Crashed`, and `Canceled` are terminal. `Waiting` is
/// non-terminal but signals the workflow is paused awaiting an external
/// resume. `Unknown` is a forward-compat sentinel for status strings this
/// client does not recognize; it is treated as non-terminal and is never
/// considered distinct for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    New,
    Running,
    Waiting,
    Success,
    Error,
    Crashed,
    Canceled,
    Unknown,
}

impl ExecutionStatus {
    /// Whether this status ends the execution lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Crashed | Self::Canceled)
    }

    /// Whether the execution is paused awaiting an external resume.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting)
    }

    /// Parse a server status string.
    ///
    /// The server sends lowercase; `"cancelled"` is accepted as an alias of
    /// `"canceled"`. Anything unrecognized maps to [`ExecutionStatus::Unknown`].
    pub fn from_wire(s: &str) -> Self {
        match s {
            "new" => Self::New,
            "running" => Self::Running,
            "waiting" => Self::Waiting,
            "success" => Self::Success,
            "error" => Self::Error,
            "crashed" => Self::Crashed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    /// Canonical wire form of this status.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Success => "success",
            Self::Error => "error",
            Self::Crashed => "crashed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for ExecutionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for ExecutionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatusVisitor;

        impl Visitor<'_> for StatusVisitor {
            type Value = ExecutionStatus;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an execution status string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ExecutionStatus::from_wire(v))
            }
        }

        deserializer.deserialize_str(StatusVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(ExecutionStatus::Crashed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());

        assert!(!ExecutionStatus::New.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(!ExecutionStatus::Unknown.is_terminal());
    }

    #[test]
    fn wire_mapping_covers_server_strings() {
        assert_eq!(ExecutionStatus::from_wire("new"), ExecutionStatus::New);
        assert_eq!(ExecutionStatus::from_wire("running"), ExecutionStatus::Running);
        assert_eq!(ExecutionStatus::from_wire("waiting"), ExecutionStatus::Waiting);
        assert_eq!(ExecutionStatus::from_wire("success"), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from_wire("error"), ExecutionStatus::Error);
        assert_eq!(ExecutionStatus::from_wire("crashed"), ExecutionStatus::Crashed);
        assert_eq!(ExecutionStatus::from_wire("canceled"), ExecutionStatus::Canceled);
    }

    #[test]
    fn cancelled_alias_accepted() {
        assert_eq!(ExecutionStatus::from_wire("cancelled"), ExecutionStatus::Canceled);
        // The alias serializes back to the canonical spelling.
        assert_eq!(ExecutionStatus::from_wire("cancelled").as_wire(), "canceled");
    }

    #[test]
    fn unrecognized_strings_map_to_unknown() {
        assert_eq!(ExecutionStatus::from_wire("paused"), ExecutionStatus::Unknown);
        assert_eq!(ExecutionStatus::from_wire(""), ExecutionStatus::Unknown);
        assert_eq!(ExecutionStatus::from_wire("RUNNING"), ExecutionStatus::Unknown);
    }

    #[test]
    fn mapped_statuses_round_trip() {
        for s in ["new", "running", "waiting", "success", "error", "crashed", "canceled"] {
            let status = ExecutionStatus::from_wire(s);
            assert_ne!(status, ExecutionStatus::Unknown, "{s} should be recognized");
            assert_eq!(status.as_wire(), s);
            assert_eq!(ExecutionStatus::from_wire(status.as_wire()), status);
        }
    }

    #[test]
    fn serde_round_trip_uses_wire_form() {
        let json = serde_json::to_string(&ExecutionStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
        let back: ExecutionStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, ExecutionStatus::Canceled);
    }
}
