//! org.freedesktop.systemd1 client
//!
//! Job completion arrives as a JobRemoved signal. The stream is opened
//! before StartUnit is called so a fast job cannot finish unobserved.

use async_trait::async_trait;
use futures_lite::StreamExt;
use tokio::sync::oneshot;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::Connection;

use super::{classify, unit_object_path};
use crate::capability::{CapabilityError, JobReceipt, JobResult, UnitManager};

/// CLD_EXITED from waitid(2)
const CLD_EXITED: i32 = 1;

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Systemd1Manager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(&self, id: u32, job: ObjectPath<'_>, unit: &str, result: &str) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Unit {
    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Service",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Service {
    #[zbus(property)]
    fn exec_main_code(&self) -> zbus::Result<i32>;

    #[zbus(property)]
    fn exec_main_status(&self) -> zbus::Result<i32>;
}

pub struct SystemdClient {
    connection: Connection,
    manager: Systemd1ManagerProxy<'static>,
}

impl SystemdClient {
    /// Subscribes to manager signals; JobRemoved is not emitted otherwise
    pub async fn new(connection: Connection) -> zbus::Result<Self> {
        let manager = Systemd1ManagerProxy::new(&connection).await?;
        manager.subscribe().await?;
        Ok(Self {
            connection,
            manager,
        })
    }

    async fn enqueue(&self, unit: &str, start: bool) -> Result<JobReceipt, CapabilityError> {
        let mut removed = self.manager.receive_job_removed().await?;

        let call = if start {
            self.manager.start_unit(unit, "replace").await
        } else {
            self.manager.stop_unit(unit, "replace").await
        };
        let job = call.map_err(|e| classify(e, unit))?;
        log::debug!("{} job for {}: {}", if start { "Start" } else { "Stop" }, unit, job.as_str());

        let (tx, rx) = oneshot::channel();
        let unit = unit.to_string();
        tokio::spawn(async move {
            while let Some(signal) = removed.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                if args.job().as_str() != job.as_str() {
                    continue;
                }
                log::debug!("Job {} for {} removed: {}", job.as_str(), unit, args.result());
                let _ = tx.send(JobResult::parse(args.result()));
                return;
            }
            log::warn!("JobRemoved stream ended before job {} finished", job.as_str());
        });
        Ok(rx)
    }
}

#[async_trait]
impl UnitManager for SystemdClient {
    async fn active_state(&self, unit: &str) -> Result<String, CapabilityError> {
        let path = match self.manager.get_unit(unit).await {
            Ok(path) => path,
            Err(e) => {
                return match classify(e, unit) {
                    CapabilityError::NoSuchUnit(_) => Ok("inactive".into()),
                    other => Err(other),
                }
            }
        };
        let proxy = Systemd1UnitProxy::builder(&self.connection)
            .path(path)?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(proxy.active_state().await?)
    }

    async fn start_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError> {
        self.enqueue(unit, true).await
    }

    async fn stop_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError> {
        self.enqueue(unit, false).await
    }

    async fn main_exit_status(&self, unit: &str) -> Result<Option<i32>, CapabilityError> {
        let proxy = Systemd1ServiceProxy::builder(&self.connection)
            .path(unit_object_path(unit))?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let code = proxy.exec_main_code().await.map_err(|e| classify(e, unit))?;
        if code != CLD_EXITED {
            return Ok(None);
        }
        Ok(Some(proxy.exec_main_status().await?))
    }
}
