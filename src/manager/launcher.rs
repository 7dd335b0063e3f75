//! Unit activation
//!
//! Starts `systemd-nspawn@<machine>.service` and waits for PID 1 to report
//! the job result. Only "done" counts as started.

use std::sync::Arc;
use std::time::Duration;

use super::shutdown::Shutdown;
use super::DriverError;
use crate::capability::{CapabilityError, JobReceipt, JobResult, UnitManager};

/// Template instance that runs a machine from its .nspawn file
pub fn nspawn_unit(machine: &str) -> String {
    format!("systemd-nspawn@{}.service", machine)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Unit was already active, no job was enqueued
    AlreadyActive,
}

pub struct ServiceLauncher {
    units: Arc<dyn UnitManager>,
    timeout: Duration,
}

impl ServiceLauncher {
    pub fn new(units: Arc<dyn UnitManager>, timeout: Duration) -> Self {
        Self { units, timeout }
    }

    pub async fn start(&self, unit: &str, shutdown: &Shutdown) -> Result<StartOutcome, DriverError> {
        let state = self
            .units
            .active_state(unit)
            .await
            .map_err(|e| DriverError::start_failed(e.to_string(), unit))?;
        if matches!(state.as_str(), "active" | "activating" | "reloading") {
            log::info!("{} is already {}, not starting again", unit, state);
            return Ok(StartOutcome::AlreadyActive);
        }

        let receipt = self
            .units
            .start_unit(unit)
            .await
            .map_err(|e| DriverError::start_failed(e.to_string(), unit))?;

        match self.await_job(unit, receipt, shutdown).await? {
            JobResult::Done => {
                log::info!("Started {}", unit);
                Ok(StartOutcome::Started)
            }
            other => Err(DriverError::job_failed(unit, &other)),
        }
    }

    /// Stop a unit; a unit that is not loaded counts as stopped
    pub async fn stop(&self, unit: &str, shutdown: &Shutdown) -> Result<(), DriverError> {
        let receipt = match self.units.stop_unit(unit).await {
            Ok(receipt) => receipt,
            Err(CapabilityError::NoSuchUnit(_)) => {
                log::debug!("{} not loaded, nothing to stop", unit);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.await_job(unit, receipt, shutdown).await? {
            JobResult::Done => {
                log::info!("Stopped {}", unit);
                Ok(())
            }
            other => Err(DriverError::Capability(CapabilityError::Failed(format!(
                "stop job for {} finished with result '{}'",
                unit,
                other.as_str()
            )))),
        }
    }

    async fn await_job(
        &self,
        unit: &str,
        receipt: JobReceipt,
        shutdown: &Shutdown,
    ) -> Result<JobResult, DriverError> {
        tokio::select! {
            result = tokio::time::timeout(self.timeout, receipt) => match result {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Err(DriverError::start_failed("job result was never reported", unit)),
                Err(_) => Err(DriverError::start_failed(
                    format!("no job result within {:?}", self.timeout),
                    unit,
                )),
            },
            _ = shutdown.triggered() => Err(DriverError::Cancelled),
        }
    }
}
