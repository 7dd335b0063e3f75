//! System capabilities the driver depends on
//!
//! Three narrow interfaces over the host's systemd components:
//!
//! - [`UnitManager`]: PID 1, activates and stops units
//! - [`MachineManager`]: systemd-machined, enumerates/signals/terminates machines
//! - [`TransferService`]: systemd-importd, pulls images
//!
//! The D-Bus implementations live in [`crate::dbus`]; tests inject fakes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::manager::Machine;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("No machine '{0}' known")]
    NoSuchMachine(String),

    #[error("No unit '{0}' loaded")]
    NoSuchUnit(String),

    #[error("{0}")]
    Failed(String),
}

/// Result reported by systemd's JobRemoved signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
    Replaced,
    Other(String),
}

impl JobResult {
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "canceled" => Self::Canceled,
            "timeout" => Self::Timeout,
            "failed" => Self::Failed,
            "dependency" => Self::Dependency,
            "skipped" => Self::Skipped,
            "replaced" => Self::Replaced,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Done => "done",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Dependency => "dependency",
            Self::Skipped => "skipped",
            Self::Replaced => "replaced",
            Self::Other(s) => s,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Resolves once the enqueued job is removed from the job queue
pub type JobReceipt = oneshot::Receiver<JobResult>;

#[async_trait]
pub trait UnitManager: Send + Sync {
    /// ActiveState of a unit ("active", "inactive", ...); "inactive" when not loaded
    async fn active_state(&self, unit: &str) -> Result<String, CapabilityError>;

    /// Enqueue a start job in "replace" mode
    async fn start_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError>;

    /// Enqueue a stop job in "replace" mode
    async fn stop_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError>;

    /// Exit status of the unit's main process, if it has exited
    async fn main_exit_status(&self, unit: &str) -> Result<Option<i32>, CapabilityError>;
}

/// Entry of machined's ListMachines
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSummary {
    pub name: String,
    pub class: String,
    pub service: String,
}

/// Which processes of a machine receive a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillWho {
    Leader,
}

impl KillWho {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
        }
    }
}

/// Output of a command run inside a machine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

#[async_trait]
pub trait MachineManager: Send + Sync {
    async fn list_machines(&self) -> Result<Vec<MachineSummary>, CapabilityError>;

    /// Current properties; `NoSuchMachine` when machined does not know the name
    async fn machine(&self, name: &str) -> Result<Machine, CapabilityError>;

    async fn kill(&self, name: &str, who: KillWho, signal: i32) -> Result<(), CapabilityError>;

    async fn terminate(&self, name: &str) -> Result<(), CapabilityError>;

    /// Run a command inside the machine and collect its output
    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, CapabilityError>;
}

/// Entry of importd's ListTransfers
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub id: u32,
    pub kind: String,
    pub remote: String,
    pub local: String,
    pub progress: f64,
}

#[async_trait]
pub trait TransferService: Send + Sync {
    /// Start a raw disk image pull, returns the transfer id
    async fn pull_raw(
        &self,
        url: &str,
        local: &str,
        verify: &str,
        force: bool,
    ) -> Result<u32, CapabilityError>;

    /// Start a tarball pull, returns the transfer id
    async fn pull_tar(
        &self,
        url: &str,
        local: &str,
        verify: &str,
        force: bool,
    ) -> Result<u32, CapabilityError>;

    async fn list_transfers(&self) -> Result<Vec<TransferInfo>, CapabilityError>;

    async fn cancel_transfer(&self, id: u32) -> Result<(), CapabilityError>;
}
