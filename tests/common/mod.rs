//! In-memory stand-ins for systemd, machined and importd

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use nspawn_driver::capability::{
    CapabilityError, ExecOutput, JobReceipt, JobResult, KillWho, MachineManager, MachineSummary,
    TransferInfo, TransferService, UnitManager,
};
use nspawn_driver::config::{DriverConfig, ImportPolicy};
use nspawn_driver::manager::{Machine, MachineState};
use nspawn_driver::units::TaskConfig;
use nspawn_driver::{Driver, Facilities};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/nspawn-driver-test-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// machined: a name -> machine table
#[derive(Default)]
pub struct FakeMachines {
    pub machines: Mutex<HashMap<String, Machine>>,
    pub kills: Mutex<Vec<(String, i32)>>,
    pub terminates: AtomicUsize,
    /// Killing the leader makes the machine close
    pub close_on_kill: AtomicBool,
    pub unavailable: AtomicBool,
    /// TerminateMachine fails and leaves the machine running
    pub fail_terminate: AtomicBool,
}

impl FakeMachines {
    pub fn spawn(&self, name: &str) {
        let mut machine = Machine::opening(name, &format!("systemd-nspawn@{}.service", name));
        machine.state = MachineState::Running;
        machine.leader = 4242;
        self.machines.lock().unwrap().insert(name.to_string(), machine);
    }

    pub fn close(&self, name: &str) {
        if let Some(m) = self.machines.lock().unwrap().get_mut(name) {
            m.state = MachineState::Closing;
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.machines.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl MachineManager for FakeMachines {
    async fn list_machines(&self) -> Result<Vec<MachineSummary>, CapabilityError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CapabilityError::Failed("machined not running".into()));
        }
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .map(|m| MachineSummary {
                name: m.name.clone(),
                class: m.class.clone(),
                service: m.service.clone(),
            })
            .collect())
    }

    async fn machine(&self, name: &str) -> Result<Machine, CapabilityError> {
        self.machines
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::NoSuchMachine(name.to_string()))
    }

    async fn kill(&self, name: &str, who: KillWho, signal: i32) -> Result<(), CapabilityError> {
        assert_eq!(who, KillWho::Leader);
        if !self.exists(name) {
            return Err(CapabilityError::NoSuchMachine(name.to_string()));
        }
        self.kills.lock().unwrap().push((name.to_string(), signal));
        if self.close_on_kill.load(Ordering::SeqCst) {
            self.close(name);
        }
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), CapabilityError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(CapabilityError::Failed("bus hiccup".into()));
        }
        match self.machines.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(CapabilityError::NoSuchMachine(name.to_string())),
        }
    }

    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, CapabilityError> {
        if !self.exists(name) {
            return Err(CapabilityError::NoSuchMachine(name.to_string()));
        }
        Ok(ExecOutput {
            stdout: cmd.join(" ").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }
}

/// PID 1: starting an nspawn unit brings its machine up in [`FakeMachines`]
pub struct FakeUnits {
    machines: Arc<FakeMachines>,
    pub active: Mutex<HashMap<String, String>>,
    pub start_result: Mutex<JobResult>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub exit_status: Mutex<Option<i32>>,
    /// Start jobs never report back
    pub hang: AtomicBool,
    pending: Mutex<Vec<oneshot::Sender<JobResult>>>,
}

impl FakeUnits {
    pub fn new(machines: Arc<FakeMachines>) -> Self {
        Self {
            machines,
            active: Mutex::new(HashMap::new()),
            start_result: Mutex::new(JobResult::Done),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            exit_status: Mutex::new(None),
            hang: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }
}

fn machine_of(unit: &str) -> &str {
    unit.trim_start_matches("systemd-nspawn@").trim_end_matches(".service")
}

#[async_trait]
impl UnitManager for FakeUnits {
    async fn active_state(&self, unit: &str) -> Result<String, CapabilityError> {
        Ok(self
            .active
            .lock()
            .unwrap()
            .get(unit)
            .cloned()
            .unwrap_or_else(|| "inactive".into()))
    }

    async fn start_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.hang.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push(tx);
            return Ok(rx);
        }
        let result = self.start_result.lock().unwrap().clone();
        if result.is_done() {
            self.active.lock().unwrap().insert(unit.to_string(), "active".into());
            self.machines.spawn(machine_of(unit));
        }
        let _ = tx.send(result);
        Ok(rx)
    }

    async fn stop_unit(&self, unit: &str) -> Result<JobReceipt, CapabilityError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.active.lock().unwrap().remove(unit).is_none() {
            return Err(CapabilityError::NoSuchUnit(unit.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(JobResult::Done);
        Ok(rx)
    }

    async fn main_exit_status(&self, _unit: &str) -> Result<Option<i32>, CapabilityError> {
        Ok(*self.exit_status.lock().unwrap())
    }
}

/// importd: transfers finish on the first poll unless `stuck`
#[derive(Default)]
pub struct FakeTransfers {
    next_id: AtomicU32,
    pub pulls: Mutex<Vec<(String, String)>>,
    pub active: Mutex<Vec<u32>>,
    pub cancelled: Mutex<Vec<u32>>,
    pub stuck: AtomicBool,
}

impl FakeTransfers {
    fn begin(&self, url: &str, local: &str) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pulls.lock().unwrap().push((url.to_string(), local.to_string()));
        self.active.lock().unwrap().push(id);
        id
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.lock().unwrap().len()
    }
}

#[async_trait]
impl TransferService for FakeTransfers {
    async fn pull_raw(
        &self,
        url: &str,
        local: &str,
        _verify: &str,
        _force: bool,
    ) -> Result<u32, CapabilityError> {
        Ok(self.begin(url, local))
    }

    async fn pull_tar(
        &self,
        url: &str,
        local: &str,
        _verify: &str,
        _force: bool,
    ) -> Result<u32, CapabilityError> {
        Ok(self.begin(url, local))
    }

    async fn list_transfers(&self) -> Result<Vec<TransferInfo>, CapabilityError> {
        let mut active = self.active.lock().unwrap();
        if !self.stuck.load(Ordering::SeqCst) {
            active.clear();
        }
        Ok(active
            .iter()
            .map(|&id| TransferInfo {
                id,
                kind: "raw".into(),
                remote: String::new(),
                local: String::new(),
                progress: 0.5,
            })
            .collect())
    }

    async fn cancel_transfer(&self, id: u32) -> Result<(), CapabilityError> {
        self.cancelled.lock().unwrap().push(id);
        self.active.lock().unwrap().retain(|&t| t != id);
        Ok(())
    }
}

pub struct Harness {
    pub driver: Driver,
    pub units: Arc<FakeUnits>,
    pub machines: Arc<FakeMachines>,
    pub transfers: Arc<FakeTransfers>,
    pub unit_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut DriverConfig)) -> Self {
        let root = unique_test_dir();
        let unit_dir = root.join("nspawn");
        let mut config = DriverConfig {
            unit_dir: unit_dir.clone(),
            cgroup_root: root.join("cgroup"),
            watch_interval: Duration::from_millis(10),
            start_timeout: Duration::from_secs(1),
            import: ImportPolicy {
                poll_initial: Duration::from_millis(1),
                poll_max: Duration::from_millis(10),
                deadline: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        tweak(&mut config);

        let machines = Arc::new(FakeMachines::default());
        let units = Arc::new(FakeUnits::new(machines.clone()));
        let transfers = Arc::new(FakeTransfers::default());
        let driver = Driver::new(
            config,
            Facilities {
                units: units.clone(),
                machines: machines.clone(),
                transfers: transfers.clone(),
            },
        );
        Self {
            driver,
            units,
            machines,
            transfers,
            unit_dir,
        }
    }

    pub fn unit_file(&self, machine: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.nspawn", machine))
    }

    pub fn start_count(&self) -> usize {
        self.units.starts.load(Ordering::SeqCst)
    }
}

pub fn task(id: &str) -> TaskConfig {
    let mut config = TaskConfig {
        id: id.to_string(),
        name: format!("web/{}", id),
        alloc_id: "a1".into(),
        ..Default::default()
    };
    config.spec.image = "https://images.example.org/debian.raw.xz".into();
    config.spec.exec.boot = true;
    config
}
