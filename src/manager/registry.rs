//! Machine tracking
//!
//! One entry per machine name. State only moves forward
//! (`Opening -> Running -> Closing`); kill and terminate are forwarded to
//! machined.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{DriverError, MachineState};
use crate::capability::{CapabilityError, KillWho, MachineManager};

/// A container as seen by machined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub id: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// CLOCK_MONOTONIC microseconds at registration
    pub timestamp_monotonic: u64,
    pub service: String,
    pub unit: String,
    pub leader: u32,
    pub class: String,
    pub root_directory: String,
    pub network_interfaces: Vec<i32>,
    pub state: MachineState,
}

impl Machine {
    /// Placeholder for a machine whose properties are not known yet
    pub fn opening(name: &str, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            id: Vec::new(),
            timestamp: Utc::now(),
            timestamp_monotonic: 0,
            service: "nspawn".into(),
            unit: unit.to_string(),
            leader: 0,
            class: "container".into(),
            root_directory: String::new(),
            network_interfaces: Vec::new(),
            state: MachineState::Opening,
        }
    }
}

pub struct MachineRegistry {
    machines: RwLock<HashMap<String, Machine>>,
    manager: Arc<dyn MachineManager>,
}

impl MachineRegistry {
    pub fn new(manager: Arc<dyn MachineManager>) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            manager,
        }
    }

    /// Track a new machine; it always starts out `Opening`
    pub async fn register(&self, mut machine: Machine) -> Result<(), DriverError> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(&machine.name) {
            return Err(DriverError::DuplicateMachine(machine.name));
        }
        machine.state = MachineState::Opening;
        log::debug!("Registered machine {}", machine.name);
        machines.insert(machine.name.clone(), machine);
        Ok(())
    }

    /// Track a machine that already exists, keeping its observed state
    pub async fn adopt(&self, machine: Machine) -> Result<(), DriverError> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(&machine.name) {
            return Err(DriverError::DuplicateMachine(machine.name));
        }
        log::info!("Adopted machine {} ({})", machine.name, machine.state);
        machines.insert(machine.name.clone(), machine);
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Result<Machine, DriverError> {
        self.machines
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::MachineNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.machines.read().await.contains_key(name)
    }

    pub async fn transition(&self, name: &str, next: MachineState) -> Result<(), DriverError> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| DriverError::MachineNotFound(name.to_string()))?;
        apply(machine, next)
    }

    /// Pull current properties from machined and move state forward.
    /// A machine machined has forgotten is treated as closing.
    pub async fn refresh(&self, name: &str) -> Result<MachineState, DriverError> {
        let observed = match self.manager.machine(name).await {
            Ok(props) => Some(props),
            Err(CapabilityError::NoSuchMachine(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| DriverError::MachineNotFound(name.to_string()))?;

        match observed {
            Some(props) => {
                let next = props.state;
                let current = machine.state;
                *machine = props;
                machine.state = current;
                if current.can_transition_to(next) {
                    apply(machine, next)?;
                }
            }
            None => {
                if machine.state.can_transition_to(MachineState::Closing) {
                    apply(machine, MachineState::Closing)?;
                }
            }
        }
        Ok(machine.state)
    }

    /// Signal the machine's leader; only valid while `Running`
    pub async fn kill(&self, name: &str, signal: i32) -> Result<(), DriverError> {
        let state = self.lookup(name).await?.state;
        if state != MachineState::Running {
            return Err(DriverError::InvalidStateTransition {
                machine: name.to_string(),
                from: state,
                to: MachineState::Closing,
            });
        }

        match self.manager.kill(name, KillWho::Leader, signal).await {
            Ok(()) => {
                log::info!("Sent signal {} to {}", signal, name);
                Ok(())
            }
            Err(CapabilityError::NoSuchMachine(_)) => {
                Err(DriverError::MachineNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forcibly stop the machine and forget it
    pub async fn terminate(&self, name: &str) -> Result<(), DriverError> {
        match self.manager.terminate(name).await {
            Ok(()) => log::info!("Terminated machine {}", name),
            Err(CapabilityError::NoSuchMachine(_)) => {
                log::debug!("Machine {} already gone", name)
            }
            Err(e) => return Err(e.into()),
        }
        self.unregister(name).await;
        Ok(())
    }

    /// Drop the entry without touching the machine
    pub async fn unregister(&self, name: &str) -> Option<Machine> {
        self.machines.write().await.remove(name)
    }
}

fn apply(machine: &mut Machine, next: MachineState) -> Result<(), DriverError> {
    if !machine.state.can_transition_to(next) {
        return Err(DriverError::InvalidStateTransition {
            machine: machine.name.clone(),
            from: machine.state,
            to: next,
        });
    }
    log::debug!("Machine {}: {} -> {}", machine.name, machine.state, next);
    machine.state = next;
    Ok(())
}
