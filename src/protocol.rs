//! Driver surface types
//!
//! What the scheduler exchanges with the driver: recoverable task
//! handles, exit results, status snapshots, resource samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::{DriverError, Machine, TaskLifecycleState};
use crate::units::TaskConfig;

pub const PLUGIN_NAME: &str = "systemd-nspawn";

/// Handle layout version
pub const HANDLE_VERSION: u32 = 1;

/// Driver-private state needed to reattach after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_config: TaskConfig,
    pub machine_name: String,
    pub started_at: DateTime<Utc>,
}

/// Opaque to the scheduler; it persists the handle and hands it back on recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub version: u32,
    pub task_id: String,
    pub driver_state: Vec<u8>,
}

impl TaskHandle {
    pub fn new(state: &TaskState) -> Result<Self, DriverError> {
        let driver_state =
            rmp_serde::to_vec_named(state).map_err(|e| DriverError::Handle(e.to_string()))?;
        Ok(Self {
            version: HANDLE_VERSION,
            task_id: state.task_config.id.clone(),
            driver_state,
        })
    }

    pub fn state(&self) -> Result<TaskState, DriverError> {
        if self.version != HANDLE_VERSION {
            return Err(DriverError::Handle(format!(
                "unsupported handle version {}",
                self.version
            )));
        }
        rmp_serde::from_slice(&self.driver_state).map_err(|e| DriverError::Handle(e.to_string()))
    }

    /// Serialized form for the scheduler's state store
    pub fn encode(&self) -> Result<Vec<u8>, DriverError> {
        rmp_serde::to_vec_named(self).map_err(|e| DriverError::Handle(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DriverError> {
        rmp_serde::from_slice(bytes).map_err(|e| DriverError::Handle(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitResult {
    pub exit_code: i32,
    pub signal: i32,
    pub oom_killed: bool,
    pub err: Option<String>,
}

impl ExitResult {
    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.err.is_none()
    }
}

/// Inspect snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskLifecycleState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_result: Option<ExitResult>,
    pub machine: Option<Machine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user_usec: u64,
    pub system_usec: u64,
    pub total_usec: u64,
    pub throttled_usec: u64,
    /// Share of one CPU since the previous sample
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub current: u64,
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub pids: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_result: ExitResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Undetected,
    Unhealthy,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub health: HealthState,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub send_signals: bool,
    pub exec: bool,
}
