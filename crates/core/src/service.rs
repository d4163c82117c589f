// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service lifecycle states and transition events.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed service.
///
/// `NEW → INSTALLED → STARTING → RUNNING ↔ STOPPING → FINISHED`, with
/// `ERRORED` (recoverable), `BROKEN` (terminal for this run), and a
/// transient `PAUSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    New,
    Installed,
    Starting,
    Running,
    Stopping,
    Finished,
    Errored,
    Broken,
    Paused,
}

crate::simple_display! {
    ServiceState {
        New => "NEW",
        Installed => "INSTALLED",
        Starting => "STARTING",
        Running => "RUNNING",
        Stopping => "STOPPING",
        Finished => "FINISHED",
        Errored => "ERRORED",
        Broken => "BROKEN",
        Paused => "PAUSED",
    }
}

impl ServiceState {
    /// True when the service satisfies a HARD dependent.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Finished)
    }

    /// True when no further transitions happen without outside action.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Finished | ServiceState::Broken)
    }
}

/// How a service relates to one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    /// Dependent is stopped when the dependency leaves RUNNING/FINISHED
    /// and restarted when it returns.
    Hard,
    /// Dependent is notified but not stopped.
    Soft,
}

crate::simple_display! {
    DependencyKind {
        Hard => "HARD",
        Soft => "SOFT",
    }
}

impl Default for DependencyKind {
    fn default() -> Self {
        DependencyKind::Hard
    }
}

/// Why a transition happened (attached to state-change events).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionCause {
    /// Operator or deployment requested the move.
    Requested,
    /// A lifecycle script finished with this exit code.
    ScriptExit { code: i32 },
    /// A lifecycle script failed to launch or was killed.
    ScriptFailed { message: String },
    /// A dependency changed state.
    DependencyChanged { dependency: String },
    /// The service self-reported over IPC.
    Reported,
    /// Backoff elapsed and the restart budget allowed a retry.
    Retry { attempt: u32 },
    /// Restart budget exhausted.
    Exhausted,
    /// Shutdown deadline elapsed; the service was force-stopped.
    ForcedStop,
}

/// A single observed state transition.
///
/// Every transition is fanned out to all global listeners and mirrored
/// under the service's config subtree; per-service ordering matches the
/// order the transitions occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub service: String,
    pub old: ServiceState,
    pub new: ServiceState,
    /// Wall-clock milliseconds since epoch.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<TransitionCause>,
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
