//! Jail lifecycle state
//!
//! The recorded state always reflects the last lifecycle transition that
//! was attempted, whether it succeeded or not:
//!
//! ```text
//! created ──start──▶ started ──stop──▶ stopped ──start──▶ started
//!    │                  │                 │
//!    └─start failed─▶ error_starting ◀────┘      started ──stop failed──▶ error_stopping
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle state of a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JailState {
    #[default]
    Created,
    Started,
    Stopped,
    ErrorStarting,
    ErrorStopping,
}

/// Outcome of a lifecycle attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailEvent {
    Started,
    StartFailed,
    Stopped,
    StopFailed,
}

impl JailState {
    /// State after `event`. Every event is accepted: the jail command is the
    /// authority on whether a start or stop is possible.
    pub fn next(self, event: JailEvent) -> JailState {
        match event {
            JailEvent::Started => JailState::Started,
            JailEvent::StartFailed => JailState::ErrorStarting,
            JailEvent::Stopped => JailState::Stopped,
            JailEvent::StopFailed => JailState::ErrorStopping,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, JailState::ErrorStarting | JailState::ErrorStopping)
    }
}

impl fmt::Display for JailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JailState::Created => "created",
            JailState::Started => "started",
            JailState::Stopped => "stopped",
            JailState::ErrorStarting => "error_starting",
            JailState::ErrorStopping => "error_stopping",
        };
        f.write_str(s)
    }
}
