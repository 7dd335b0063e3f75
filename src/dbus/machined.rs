//! org.freedesktop.machine1 client

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use zbus::proxy::CacheProperties;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use super::classify;
use crate::capability::{CapabilityError, ExecOutput, KillWho, MachineManager, MachineSummary};
use crate::manager::{Machine, MachineState};

#[zbus::proxy(
    interface = "org.freedesktop.machine1.Manager",
    default_service = "org.freedesktop.machine1",
    default_path = "/org/freedesktop/machine1"
)]
trait Machine1Manager {
    fn list_machines(&self) -> zbus::Result<Vec<(String, String, String, OwnedObjectPath)>>;

    fn get_machine(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn kill_machine(&self, name: &str, who: &str, signal: i32) -> zbus::Result<()>;

    fn terminate_machine(&self, name: &str) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.machine1.Machine",
    default_service = "org.freedesktop.machine1"
)]
trait Machine1Machine {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn id(&self) -> zbus::Result<Vec<u8>>;

    #[zbus(property)]
    fn timestamp(&self) -> zbus::Result<u64>;

    #[zbus(property)]
    fn timestamp_monotonic(&self) -> zbus::Result<u64>;

    #[zbus(property)]
    fn service(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn unit(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn leader(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn class(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn root_directory(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn network_interfaces(&self) -> zbus::Result<Vec<i32>>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<String>;
}

pub struct MachinedClient {
    connection: Connection,
}

impl MachinedClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn manager(&self) -> zbus::Result<Machine1ManagerProxy<'static>> {
        Machine1ManagerProxy::new(&self.connection).await
    }
}

#[async_trait]
impl MachineManager for MachinedClient {
    async fn list_machines(&self) -> Result<Vec<MachineSummary>, CapabilityError> {
        let machines = self.manager().await?.list_machines().await?;
        Ok(machines
            .into_iter()
            .map(|(name, class, service, _)| MachineSummary {
                name,
                class,
                service,
            })
            .collect())
    }

    async fn machine(&self, name: &str) -> Result<Machine, CapabilityError> {
        let path = self
            .manager()
            .await?
            .get_machine(name)
            .await
            .map_err(|e| classify(e, name))?;
        let proxy = Machine1MachineProxy::builder(&self.connection)
            .path(path)?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;

        // The object can vanish between GetMachine and the property reads
        let props = async {
            let state = proxy.state().await?;
            let timestamp = proxy.timestamp().await?;
            Ok::<_, zbus::Error>(Machine {
                name: proxy.name().await?,
                id: proxy.id().await?,
                timestamp: DateTime::<Utc>::from_timestamp_micros(timestamp as i64)
                    .unwrap_or_default(),
                timestamp_monotonic: proxy.timestamp_monotonic().await?,
                service: proxy.service().await?,
                unit: proxy.unit().await?,
                leader: proxy.leader().await?,
                class: proxy.class().await?,
                root_directory: proxy.root_directory().await?,
                network_interfaces: proxy.network_interfaces().await?,
                state: MachineState::parse(&state).unwrap_or(MachineState::Opening),
            })
        };
        props.await.map_err(|e| match e {
            zbus::Error::MethodError(error_name, _, _)
                if error_name.as_str() == "org.freedesktop.DBus.Error.UnknownObject" =>
            {
                CapabilityError::NoSuchMachine(name.to_string())
            }
            other => classify(other, name),
        })
    }

    async fn kill(&self, name: &str, who: KillWho, signal: i32) -> Result<(), CapabilityError> {
        self.manager()
            .await?
            .kill_machine(name, who.as_str(), signal)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn terminate(&self, name: &str) -> Result<(), CapabilityError> {
        self.manager()
            .await?
            .terminate_machine(name)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, CapabilityError> {
        let printable = shlex::try_join(cmd.iter().map(String::as_str))
            .unwrap_or_else(|_| cmd.join(" "));
        log::info!("Exec in {}: {}", name, printable);

        let child = Command::new("systemd-run")
            .arg(format!("--machine={}", name))
            .args(["--wait", "--pipe", "--quiet", "--collect", "--"])
            .args(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapabilityError::Failed(format!("systemd-run: {}", e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                CapabilityError::Failed(format!("exec in {} timed out after {:?}", name, timeout))
            })?
            .map_err(|e| CapabilityError::Failed(format!("systemd-run: {}", e)))?;

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
