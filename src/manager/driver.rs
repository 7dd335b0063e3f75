//! Task lifecycle coordination
//!
//! Start sequence for one task:
//!
//! ```text
//! render ─► write <machine>.nspawn ─► pull image ─► start unit ─► register machine
//! ```
//!
//! Any failure rolls back what was created (machine, registry entry, unit
//! file). Stop signals the leader and escalates to TerminateMachine after
//! the grace period; Destroy tears everything down.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{sleep, Instant};

use super::error::StartStage;
use super::events::{EventBroadcaster, EventSubscription, TaskEvent};
use super::import::ImportTracker;
use super::launcher::{nspawn_unit, ServiceLauncher, StartOutcome};
use super::registry::{Machine, MachineRegistry};
use super::shutdown::{self, Shutdown, ShutdownTrigger};
use super::signal::{default_stop_signal, parse_signal};
use super::unit_files::UnitFiles;
use super::{DriverError, MachineState, TaskLifecycleState};
use crate::capability::{CapabilityError, MachineManager, TransferService, UnitManager};
use crate::cgroups::{cpu_percent, CgroupReader};
use crate::config::DriverConfig;
use crate::protocol::{
    DriverCapabilities, ExecResult, ExitResult, Fingerprint, HealthState, PluginInfo,
    ResourceUsage, TaskHandle, TaskState, TaskStatus, PLUGIN_NAME,
};
use crate::units::{self, TaskConfig};

/// The system capabilities a driver runs on
#[derive(Clone)]
pub struct Facilities {
    pub units: Arc<dyn UnitManager>,
    pub machines: Arc<dyn MachineManager>,
    pub transfers: Arc<dyn TransferService>,
}

struct TaskRecord {
    state: TaskLifecycleState,
    completed_at: Option<DateTime<Utc>>,
}

struct TaskEntry {
    config: TaskConfig,
    machine: String,
    unit: String,
    started_at: DateTime<Utc>,
    record: StdMutex<TaskRecord>,
    exit: watch::Sender<Option<ExitResult>>,
}

impl TaskEntry {
    fn new(config: TaskConfig, machine: String, started_at: DateTime<Utc>, state: TaskLifecycleState) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            unit: nspawn_unit(&machine),
            config,
            machine,
            started_at,
            record: StdMutex::new(TaskRecord {
                state,
                completed_at: None,
            }),
            exit,
        }
    }

    fn record(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> TaskLifecycleState {
        self.record().state
    }

    /// Publish the exit result; only the first call has an effect
    fn complete(&self, result: ExitResult) -> bool {
        self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }
}

/// What the start sequence created so far, for rollback
#[derive(Default)]
struct StartProgress {
    unit_written: bool,
    activation_attempted: bool,
    registered: bool,
}

/// Task driver for systemd-nspawn machines
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Inner>,
}

struct Inner {
    config: DriverConfig,
    unit_files: UnitFiles,
    importer: ImportTracker,
    launcher: ServiceLauncher,
    registry: MachineRegistry,
    units: Arc<dyn UnitManager>,
    machines: Arc<dyn MachineManager>,
    cgroups: Arc<CgroupReader>,
    events: EventBroadcaster,
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    /// One start/stop/destroy at a time per machine name
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl Driver {
    pub fn new(config: DriverConfig, facilities: Facilities) -> Self {
        let (trigger, shutdown) = shutdown::channel();
        let inner = Inner {
            unit_files: UnitFiles::new(&config.unit_dir),
            importer: ImportTracker::new(facilities.transfers, config.import.clone()),
            launcher: ServiceLauncher::new(facilities.units.clone(), config.start_timeout),
            registry: MachineRegistry::new(facilities.machines.clone()),
            units: facilities.units,
            machines: facilities.machines,
            cgroups: Arc::new(CgroupReader::new(&config.cgroup_root)),
            events: EventBroadcaster::new(config.event_buffer),
            tasks: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            trigger,
            shutdown,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            send_signals: true,
            exec: true,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Driver health, based on whether machined answers
    pub async fn fingerprint(&self) -> Fingerprint {
        if !self.inner.config.enabled {
            return Fingerprint {
                health: HealthState::Undetected,
                description: "disabled".into(),
            };
        }
        match self.inner.machines.list_machines().await {
            Ok(_) => Fingerprint {
                health: HealthState::Healthy,
                description: "Healthy".into(),
            },
            Err(e) => Fingerprint {
                health: HealthState::Unhealthy,
                description: format!("systemd-machined unavailable: {}", e),
            },
        }
    }

    pub async fn start_task(&self, config: TaskConfig) -> Result<TaskHandle, DriverError> {
        let inner = &self.inner;
        if inner.shutdown.is_triggered() {
            return Err(DriverError::Cancelled);
        }

        let machine = config.machine_name();
        let entry = Arc::new(TaskEntry::new(
            config,
            machine.clone(),
            Utc::now(),
            TaskLifecycleState::Pending,
        ));
        {
            let mut tasks = inner.tasks.write().await;
            if tasks.contains_key(&entry.config.id) {
                return Err(DriverError::DuplicateTask(entry.config.id.clone()));
            }
            if tasks.values().any(|t| t.machine == machine)
                || inner.registry.contains(&machine).await
            {
                return Err(DriverError::DuplicateMachine(machine));
            }
            tasks.insert(entry.config.id.clone(), Arc::clone(&entry));
        }

        let _flight = inner.flight(&machine).await;
        inner.set_state(&entry, TaskLifecycleState::Starting, "Starting task")?;

        let mut progress = StartProgress::default();
        match inner.launch(&entry, &mut progress).await {
            Ok(()) => {
                inner.set_state(&entry, TaskLifecycleState::Running, "Task started")?;
                Arc::clone(inner).spawn_watcher(Arc::clone(&entry));
                TaskHandle::new(&TaskState {
                    task_config: entry.config.clone(),
                    machine_name: machine,
                    started_at: entry.started_at,
                })
            }
            Err((stage, e)) => {
                log::error!("Task {} failed during {}: {}", entry.config.id, stage, e);
                inner.rollback(&entry, &progress).await;
                let _ = inner.set_state(
                    &entry,
                    TaskLifecycleState::Failed,
                    &format!("Failed during {}: {}", stage, e),
                );
                inner.forget(&entry).await;
                Err(DriverError::Start {
                    task: entry.config.id.clone(),
                    machine,
                    stage,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Reattach to a machine started by a previous driver process
    pub async fn recover_task(&self, handle: &TaskHandle) -> Result<(), DriverError> {
        let inner = &self.inner;
        let state = handle.state()?;
        let task_id = state.task_config.id.clone();

        if inner.tasks.read().await.contains_key(&task_id) {
            log::debug!("Task {} already tracked", task_id);
            return Ok(());
        }

        let machine = state.machine_name.clone();
        let flight = inner.flight(&machine).await;

        if !inner.registry.contains(&machine).await {
            let adopted = match inner.machines.machine(&machine).await {
                Ok(found) => inner.registry.adopt(found).await,
                Err(CapabilityError::NoSuchMachine(_)) => Err(DriverError::TaskNotRecoverable {
                    task: task_id.clone(),
                    machine: machine.clone(),
                }),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = adopted {
                drop(flight);
                inner.release_flight(&machine).await;
                return Err(e);
            }
        }

        let entry = Arc::new(TaskEntry::new(
            state.task_config,
            machine,
            state.started_at,
            TaskLifecycleState::Running,
        ));
        inner
            .tasks
            .write()
            .await
            .insert(task_id.clone(), Arc::clone(&entry));
        inner.publish(&entry, "Task recovered");
        log::info!("Recovered task {} on machine {}", task_id, entry.machine);

        Arc::clone(inner).spawn_watcher(entry);
        Ok(())
    }

    /// Resolves with the task's exit result; each caller gets its own copy
    pub async fn wait_task(&self, task_id: &str) -> Result<oneshot::Receiver<ExitResult>, DriverError> {
        let entry = self.inner.task(task_id).await?;
        let mut rx = entry.exit.subscribe();
        let (tx, result) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match rx.wait_for(Option::is_some).await {
                Ok(exit) => exit.clone(),
                Err(_) => return,
            };
            if let Some(exit) = exit {
                let _ = tx.send(exit);
            }
        });
        Ok(result)
    }

    /// Signal the task and wait up to `timeout` for it to close before
    /// terminating the machine. If terminating fails the task stays
    /// `Stopping` and a repeated stop tries again.
    pub async fn stop_task(
        &self,
        task_id: &str,
        timeout: Duration,
        signal: Option<&str>,
    ) -> Result<(), DriverError> {
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let signal = match signal {
            Some(name) if !name.is_empty() => parse_signal(name)?,
            _ => default_stop_signal(&entry.config.spec),
        };

        let _flight = inner.flight(&entry.machine).await;
        match entry.state() {
            TaskLifecycleState::Running => {
                inner.set_state(
                    &entry,
                    TaskLifecycleState::Stopping,
                    &format!("Stopping with signal {}", signal),
                )?;
                match inner.registry.kill(&entry.machine, signal).await {
                    Ok(()) => {}
                    Err(
                        e @ (DriverError::MachineNotFound(_)
                        | DriverError::InvalidStateTransition { .. }),
                    ) => log::debug!("Not signalling {}: {}", entry.machine, e),
                    Err(e) => log::warn!("Signal to {} failed: {}", entry.machine, e),
                }
            }
            // An earlier stop gave up before the machine was gone: wait and
            // escalate again
            TaskLifecycleState::Stopping if entry.exit.borrow().is_none() => {
                log::info!("Retrying stop of {}", entry.machine);
            }
            TaskLifecycleState::Stopping
            | TaskLifecycleState::Failed
            | TaskLifecycleState::Destroyed => return Ok(()),
            other => {
                return Err(DriverError::InvalidTaskTransition {
                    task: task_id.to_string(),
                    from: other,
                    to: TaskLifecycleState::Stopping,
                })
            }
        }

        if !inner.wait_closed(&entry.machine, timeout).await? {
            log::warn!(
                "{} still running after {:?}, terminating",
                entry.machine,
                timeout
            );
            inner.publish(&entry, "Grace period expired, terminating machine");
            inner.registry.terminate(&entry.machine).await?;
        }

        let exit_code = inner.exit_status(&entry.unit).await.unwrap_or(0);
        entry.complete(ExitResult {
            exit_code,
            signal,
            ..Default::default()
        });
        Ok(())
    }

    /// Remove every trace of the task; `force` also tears down a running task
    pub async fn destroy_task(&self, task_id: &str, force: bool) -> Result<(), DriverError> {
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let _flight = inner.flight(&entry.machine).await;

        let was_running = entry.state() == TaskLifecycleState::Running;
        match entry.state() {
            TaskLifecycleState::Running if !force => {
                return Err(DriverError::TaskStillRunning(task_id.to_string()))
            }
            TaskLifecycleState::Running => {
                inner.set_state(&entry, TaskLifecycleState::Stopping, "Force destroying task")?;
            }
            TaskLifecycleState::Stopping | TaskLifecycleState::Failed => {}
            TaskLifecycleState::Destroyed => return Ok(()),
            other => {
                return Err(DriverError::InvalidTaskTransition {
                    task: task_id.to_string(),
                    from: other,
                    to: TaskLifecycleState::Destroyed,
                })
            }
        }

        // Machine first: the unit file must outlive the container using it
        inner.registry.terminate(&entry.machine).await?;
        if let Err(e) = inner.launcher.stop(&entry.unit, &inner.shutdown).await {
            log::warn!("Stopping {} failed: {}", entry.unit, e);
        }
        inner.registry.unregister(&entry.machine).await;
        inner.unit_files.remove(&entry.machine).await?;

        inner.set_state(&entry, TaskLifecycleState::Destroyed, "Task destroyed")?;
        entry.complete(ExitResult {
            signal: if was_running { nix::libc::SIGKILL } else { 0 },
            ..Default::default()
        });
        inner.forget(&entry).await;
        Ok(())
    }

    pub async fn inspect_task(&self, task_id: &str) -> Result<TaskStatus, DriverError> {
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let machine = inner.registry.lookup(&entry.machine).await.ok();
        let exit_result = entry.exit.borrow().clone();
        let record = entry.record();
        Ok(TaskStatus {
            id: entry.config.id.clone(),
            name: entry.config.name.clone(),
            state: record.state,
            started_at: entry.started_at,
            completed_at: record.completed_at,
            exit_result,
            machine,
        })
    }

    /// Stream of resource samples until the receiver is dropped or the
    /// machine's cgroup disappears
    pub async fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
    ) -> Result<mpsc::Receiver<ResourceUsage>, DriverError> {
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let machine = inner.registry.lookup(&entry.machine).await?;
        let unit = if machine.unit.is_empty() {
            entry.unit.clone()
        } else {
            machine.unit
        };
        let path = inner.cgroups.machine_cgroup(&unit);
        let reader = Arc::clone(&inner.cgroups);
        let shutdown = inner.shutdown.clone();
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut prev: Option<ResourceUsage> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.triggered() => return,
                    _ = tx.closed() => return,
                }
                let mut usage = match reader.sample(&path).await {
                    Ok(usage) => usage,
                    Err(e) => {
                        log::debug!("Stats for {} ended: {}", path.display(), e);
                        return;
                    }
                };
                if let Some(prev) = &prev {
                    usage.cpu.percent = cpu_percent(prev, &usage);
                }
                prev = Some(usage.clone());
                if tx.send(usage).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    /// Subscribe to lifecycle events of all tasks from now on
    pub fn task_events(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    pub async fn signal_task(&self, task_id: &str, signal: &str) -> Result<(), DriverError> {
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let signal = parse_signal(signal)?;
        inner.registry.kill(&entry.machine, signal).await?;
        inner.publish(&entry, &format!("Received signal {}", signal));
        Ok(())
    }

    pub async fn exec_task(
        &self,
        task_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecResult, DriverError> {
        if cmd.is_empty() {
            return Err(DriverError::EmptyCommand);
        }
        let inner = &self.inner;
        let entry = inner.task(task_id).await?;
        let output = match inner.machines.exec(&entry.machine, cmd, timeout).await {
            Ok(output) => output,
            Err(CapabilityError::NoSuchMachine(_)) => {
                return Err(DriverError::MachineNotFound(entry.machine.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ExecResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_result: ExitResult {
                exit_code: output.exit_code,
                ..Default::default()
            },
        })
    }

    /// Cancel in-flight pulls, activations and watchers
    pub fn shutdown(&self) {
        log::info!("Driver shutting down");
        self.inner.trigger.trigger();
    }
}

impl Inner {
    async fn task(&self, task_id: &str) -> Result<Arc<TaskEntry>, DriverError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| DriverError::TaskNotFound(task_id.to_string()))
    }

    async fn forget(&self, entry: &TaskEntry) {
        self.tasks.write().await.remove(&entry.config.id);
        self.flights.lock().await.remove(&entry.machine);
    }

    /// Drop an idle flight lock for a machine no task owns
    async fn release_flight(&self, machine: &str) {
        let mut flights = self.flights.lock().await;
        if flights.get(machine).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            flights.remove(machine);
        }
    }

    async fn flight(&self, machine: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut flights = self.flights.lock().await;
            Arc::clone(flights.entry(machine.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn set_state(
        &self,
        entry: &TaskEntry,
        next: TaskLifecycleState,
        message: &str,
    ) -> Result<(), DriverError> {
        {
            let mut record = entry.record();
            if !record.state.can_transition_to(next) {
                return Err(DriverError::InvalidTaskTransition {
                    task: entry.config.id.clone(),
                    from: record.state,
                    to: next,
                });
            }
            log::info!("Task {}: {} -> {}", entry.config.id, record.state, next);
            record.state = next;
            if matches!(next, TaskLifecycleState::Destroyed | TaskLifecycleState::Failed)
                && record.completed_at.is_none()
            {
                record.completed_at = Some(Utc::now());
            }
        }
        self.publish(entry, message);
        Ok(())
    }

    fn publish(&self, entry: &TaskEntry, message: &str) {
        let mut annotations = BTreeMap::new();
        annotations.insert("machine".to_string(), entry.machine.clone());
        self.events.publish(TaskEvent {
            task_id: entry.config.id.clone(),
            task_name: entry.config.name.clone(),
            alloc_id: entry.config.alloc_id.clone(),
            state: entry.state(),
            timestamp: Utc::now(),
            message: message.to_string(),
            annotations,
        });
    }

    async fn launch(
        &self,
        entry: &TaskEntry,
        progress: &mut StartProgress,
    ) -> Result<(), (StartStage, DriverError)> {
        let machine = entry.machine.as_str();
        let text = units::render(&entry.config.spec).map_err(|e| (StartStage::Render, e.into()))?;
        self.unit_files
            .write(machine, &text)
            .await
            .map_err(|e| (StartStage::WriteUnit, e.into()))?;
        progress.unit_written = true;

        self.importer
            .pull(&entry.config.spec.image, machine, &self.shutdown)
            .await
            .map_err(|e| (StartStage::Pull, e))?;
        self.publish(entry, "Downloaded image");

        progress.activation_attempted = true;
        let outcome = self
            .launcher
            .start(&entry.unit, &self.shutdown)
            .await
            .map_err(|e| (StartStage::Activate, e))?;
        if outcome == StartOutcome::AlreadyActive {
            log::warn!("{} was already active before start", entry.unit);
        }

        self.registry
            .register(Machine::opening(machine, &entry.unit))
            .await
            .map_err(|e| (StartStage::Register, e))?;
        progress.registered = true;

        match self.registry.refresh(machine).await {
            Ok(state) => log::info!("Machine {} is {}", machine, state),
            Err(e) => log::warn!("Could not read state of {}: {}", machine, e),
        }
        Ok(())
    }

    async fn rollback(&self, entry: &TaskEntry, progress: &StartProgress) {
        let machine = entry.machine.as_str();
        if progress.activation_attempted {
            if let Err(e) = self.registry.terminate(machine).await {
                log::warn!("Rollback: terminating {} failed: {}", machine, e);
            }
            if let Err(e) = self.units.stop_unit(&entry.unit).await {
                log::debug!("Rollback: stopping {} failed: {}", entry.unit, e);
            }
        }
        if progress.registered {
            self.registry.unregister(machine).await;
        }
        if progress.unit_written {
            if let Err(e) = self.unit_files.remove(machine).await {
                log::warn!("Rollback: removing unit file for {} failed: {}", machine, e);
            }
        }
    }

    /// true once the machine is closing or gone, false on timeout
    async fn wait_closed(&self, machine: &str, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.registry.refresh(machine).await {
                Ok(MachineState::Closing) | Err(DriverError::MachineNotFound(_)) => return Ok(true),
                Ok(_) => {}
                Err(e) => log::warn!("Polling {} failed: {}", machine, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = sleep(self.config.watch_interval.min(deadline - now)) => {}
                _ = self.shutdown.triggered() => return Err(DriverError::Cancelled),
            }
        }
    }

    async fn exit_status(&self, unit: &str) -> Option<i32> {
        match self.units.main_exit_status(unit).await {
            Ok(status) => status,
            Err(e) => {
                log::debug!("No exit status for {}: {}", unit, e);
                None
            }
        }
    }

    fn spawn_watcher(self: Arc<Self>, entry: Arc<TaskEntry>) {
        tokio::spawn(async move { self.watch(entry).await });
    }

    /// Poll a running task's machine until it closes
    async fn watch(&self, entry: Arc<TaskEntry>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.watch_interval) => {}
                _ = self.shutdown.triggered() => return,
            }
            if entry.state() != TaskLifecycleState::Running {
                return;
            }
            match self.registry.refresh(&entry.machine).await {
                Ok(MachineState::Closing) => {
                    self.machine_exited(&entry).await;
                    return;
                }
                Ok(_) => {}
                Err(DriverError::MachineNotFound(_)) => return,
                Err(e) => log::warn!("Watching {} failed: {}", entry.machine, e),
            }
        }
    }

    async fn machine_exited(&self, entry: &TaskEntry) {
        let status = self.exit_status(&entry.unit).await;
        if self
            .set_state(entry, TaskLifecycleState::Failed, "Machine exited unexpectedly")
            .is_err()
        {
            // Stop or destroy got there first
            return;
        }
        log::warn!("Machine {} exited (status {:?})", entry.machine, status);
        entry.complete(ExitResult {
            exit_code: status.unwrap_or(0),
            err: status.is_none().then(|| "exit status unknown".to_string()),
            ..Default::default()
        });
    }
}
