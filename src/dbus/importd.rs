//! org.freedesktop.import1 client

use async_trait::async_trait;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use super::classify;
use crate::capability::{CapabilityError, TransferInfo, TransferService};

#[zbus::proxy(
    interface = "org.freedesktop.import1.Manager",
    default_service = "org.freedesktop.import1",
    default_path = "/org/freedesktop/import1"
)]
trait Import1Manager {
    fn pull_raw(
        &self,
        url: &str,
        local_name: &str,
        verify_mode: &str,
        force: bool,
    ) -> zbus::Result<(u32, OwnedObjectPath)>;

    fn pull_tar(
        &self,
        url: &str,
        local_name: &str,
        verify_mode: &str,
        force: bool,
    ) -> zbus::Result<(u32, OwnedObjectPath)>;

    #[allow(clippy::type_complexity)]
    fn list_transfers(
        &self,
    ) -> zbus::Result<Vec<(u32, String, String, String, f64, OwnedObjectPath)>>;

    fn cancel_transfer(&self, transfer_id: u32) -> zbus::Result<()>;
}

pub struct ImportdClient {
    connection: Connection,
}

impl ImportdClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn manager(&self) -> zbus::Result<Import1ManagerProxy<'static>> {
        Import1ManagerProxy::new(&self.connection).await
    }
}

#[async_trait]
impl TransferService for ImportdClient {
    async fn pull_raw(
        &self,
        url: &str,
        local: &str,
        verify: &str,
        force: bool,
    ) -> Result<u32, CapabilityError> {
        let (id, _) = self
            .manager()
            .await?
            .pull_raw(url, local, verify, force)
            .await
            .map_err(|e| classify(e, local))?;
        Ok(id)
    }

    async fn pull_tar(
        &self,
        url: &str,
        local: &str,
        verify: &str,
        force: bool,
    ) -> Result<u32, CapabilityError> {
        let (id, _) = self
            .manager()
            .await?
            .pull_tar(url, local, verify, force)
            .await
            .map_err(|e| classify(e, local))?;
        Ok(id)
    }

    async fn list_transfers(&self) -> Result<Vec<TransferInfo>, CapabilityError> {
        let transfers = self.manager().await?.list_transfers().await?;
        Ok(transfers
            .into_iter()
            .map(|(id, kind, remote, local, progress, _)| TransferInfo {
                id,
                kind,
                remote,
                local,
                progress,
            })
            .collect())
    }

    async fn cancel_transfer(&self, id: u32) -> Result<(), CapabilityError> {
        self.manager().await?.cancel_transfer(id).await?;
        Ok(())
    }
}
