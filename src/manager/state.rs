//! Machine and task state machines
//!
//! Machines only move forward:
//!
//! ```text
//!     ┌─────────┐     ┌─────────┐     ┌─────────┐
//!     │ Opening │────►│ Running │────►│ Closing │
//!     └────┬────┘     └─────────┘     └────▲────┘
//!          └───────────────────────────────┘
//! ```
//!
//! Tasks wrap a machine:
//!
//! ```text
//!     ┌─────────┐
//!     │ Pending │
//!     └────┬────┘
//!          │ start
//!     ┌────▼─────┐
//!     │ Starting │──────────────┐
//!     └────┬─────┘              │ error
//!          │ activated          │
//!     ┌────▼────┐          ┌────▼───┐
//!     │ Running │─────────►│ Failed │
//!     └────┬────┘  exited  └────┬───┘
//!          │ stop               │
//!     ┌────▼─────┐              │
//!     │ Stopping │              │
//!     └────┬─────┘              │
//!          │ destroy            │ destroy
//!     ┌────▼──────┐             │
//!     │ Destroyed │◄────────────┘
//!     └───────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Machine state as reported by machined
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Opening,
    Running,
    Closing,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Running => "running",
            Self::Closing => "closing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opening" => Some(Self::Opening),
            "running" => Some(Self::Running),
            "closing" => Some(Self::Closing),
            _ => None,
        }
    }

    /// Only strictly later states are reachable
    pub fn can_transition_to(&self, next: Self) -> bool {
        next > *self
    }
}

/// Driver-side lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskLifecycleState {
    Pending,
    Starting,
    Running,
    Stopping,
    Destroyed,
    Failed,
}

impl TaskLifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use TaskLifecycleState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Destroyed)
                | (Failed, Destroyed)
        )
    }

    /// A machine may still exist for the task
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for TaskLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
