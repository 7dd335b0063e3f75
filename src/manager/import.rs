//! Image acquisition through importd
//!
//! importd has no completion callback we rely on: a pull is finished once
//! its transfer id drops out of ListTransfers. The list is polled with
//! exponential backoff under an overall deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::shutdown::Shutdown;
use super::DriverError;
use crate::capability::TransferService;
use crate::config::ImportPolicy;
use crate::units::ImageKind;

/// Floor for the poll interval, whatever the policy says
const MIN_POLL: Duration = Duration::from_millis(10);

/// In-flight pull, valid until [`ImportTracker::wait`] returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle {
    pub id: u32,
    pub machine: String,
}

pub struct ImportTracker {
    transfers: Arc<dyn TransferService>,
    policy: ImportPolicy,
}

impl ImportTracker {
    pub fn new(transfers: Arc<dyn TransferService>, policy: ImportPolicy) -> Self {
        Self { transfers, policy }
    }

    /// Pull `image` into the image store as `machine` and wait for it
    pub async fn pull(
        &self,
        image: &str,
        machine: &str,
        shutdown: &Shutdown,
    ) -> Result<(), DriverError> {
        let handle = self.begin(image, machine).await?;
        self.wait(&handle, shutdown).await
    }

    /// Issue the pull request
    pub async fn begin(&self, image: &str, machine: &str) -> Result<TransferHandle, DriverError> {
        let verify = self.policy.verify.as_str();
        let result = match ImageKind::detect(image) {
            ImageKind::Raw => self.transfers.pull_raw(image, machine, verify, false).await,
            ImageKind::Tar => self.transfers.pull_tar(image, machine, verify, false).await,
        };
        let id = result.map_err(|source| DriverError::ImageTransfer {
            machine: machine.to_string(),
            source,
        })?;

        log::info!("Pulling {} as {} (transfer {})", image, machine, id);
        Ok(TransferHandle {
            id,
            machine: machine.to_string(),
        })
    }

    /// Block until the transfer leaves importd's active list
    pub async fn wait(&self, handle: &TransferHandle, shutdown: &Shutdown) -> Result<(), DriverError> {
        let deadline = Instant::now() + self.policy.deadline;
        let mut delay = self.policy.poll_initial.max(MIN_POLL);

        loop {
            let active = self
                .transfers
                .list_transfers()
                .await
                .map_err(|source| DriverError::ImageTransfer {
                    machine: handle.machine.clone(),
                    source,
                })?;

            if !active.iter().any(|t| t.id == handle.id) {
                log::info!("Transfer {} for {} finished", handle.id, handle.machine);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "Transfer {} for {} exceeded {:?}",
                    handle.id,
                    handle.machine,
                    self.policy.deadline
                );
                self.cancel(handle).await;
                return Err(DriverError::ImageTransferTimeout {
                    machine: handle.machine.clone(),
                    transfer: handle.id,
                });
            }

            let pause = delay.min(deadline - now);
            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown.triggered() => {
                    self.cancel(handle).await;
                    return Err(DriverError::Cancelled);
                }
            }
            delay = next_delay(delay, self.policy.poll_max);
        }
    }

    /// Best effort; importd may already have finished the transfer
    async fn cancel(&self, handle: &TransferHandle) {
        if let Err(e) = self.transfers.cancel_transfer(handle.id).await {
            log::debug!("Cancel of transfer {} failed: {}", handle.id, e);
        }
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max).max(MIN_POLL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let max = Duration::from_secs(1);
        let mut d = Duration::from_millis(100);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(d.as_millis());
            d = next_delay(d, max);
        }
        assert_eq!(seen, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_backoff_never_drops_to_zero() {
        assert_eq!(next_delay(Duration::ZERO, Duration::ZERO), MIN_POLL);
        assert_eq!(next_delay(Duration::ZERO, Duration::from_secs(1)), MIN_POLL);
        assert_eq!(next_delay(MIN_POLL, Duration::from_secs(1)), MIN_POLL * 2);
    }
}
