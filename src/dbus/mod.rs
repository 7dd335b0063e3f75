//! D-Bus clients for the host's systemd components
//!
//! Key services:
//! - org.freedesktop.systemd1: StartUnit, StopUnit, JobRemoved, unit properties
//! - org.freedesktop.machine1: ListMachines, GetMachine, KillMachine, TerminateMachine
//! - org.freedesktop.import1: PullRaw, PullTar, ListTransfers, CancelTransfer

mod importd;
mod machined;
mod systemd;

pub use importd::ImportdClient;
pub use machined::MachinedClient;
pub use systemd::SystemdClient;

use std::sync::Arc;

use zbus::Connection;

use crate::capability::CapabilityError;
use crate::manager::Facilities;

const NO_SUCH_MACHINE: &str = "org.freedesktop.machine1.NoSuchMachine";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// Connection to the system bus shared by all clients
pub struct SystemBus {
    connection: Connection,
}

impl SystemBus {
    pub async fn connect() -> zbus::Result<Self> {
        let connection = Connection::system().await?;
        log::debug!(
            "Connected to system bus as {:?}",
            connection.unique_name().map(|n| n.to_string())
        );
        Ok(Self { connection })
    }

    /// Capability implementations backed by this connection
    pub async fn facilities(&self) -> zbus::Result<Facilities> {
        Ok(Facilities {
            units: Arc::new(SystemdClient::new(self.connection.clone()).await?),
            machines: Arc::new(MachinedClient::new(self.connection.clone())),
            transfers: Arc::new(ImportdClient::new(self.connection.clone())),
        })
    }

    pub async fn close(self) -> zbus::Result<()> {
        self.connection.close().await
    }
}

/// Translate well-known error names into their capability variants
pub(crate) fn classify(error: zbus::Error, subject: &str) -> CapabilityError {
    if let zbus::Error::MethodError(name, _, _) = &error {
        match name.as_str() {
            NO_SUCH_MACHINE => return CapabilityError::NoSuchMachine(subject.to_string()),
            NO_SUCH_UNIT => return CapabilityError::NoSuchUnit(subject.to_string()),
            _ => {}
        }
    }
    CapabilityError::Dbus(error)
}

/// Convert unit name to D-Bus object path string
/// e.g., "docker.service" -> "/org/freedesktop/systemd1/unit/docker_2eservice"
pub fn unit_object_path(unit_id: &str) -> String {
    let escaped: String = unit_id
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()) {
                c.to_string()
            } else {
                format!("_{:02x}", c as u32)
            }
        })
        .collect();

    format!("/org/freedesktop/systemd1/unit/{}", escaped)
}
