use crate::capability::{CapabilityError, JobResult};
use crate::manager::{MachineState, TaskLifecycleState};
use crate::units::RenderError;

/// Step of the start sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStage {
    Render,
    WriteUnit,
    Pull,
    Activate,
    Register,
}

impl std::fmt::Display for StartStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Render => "render",
            Self::WriteUnit => "write unit file",
            Self::Pull => "image pull",
            Self::Activate => "unit activation",
            Self::Register => "machine registration",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to render unit: {0}")]
    Render(#[from] RenderError),

    #[error("Image transfer for machine {machine} failed: {source}")]
    ImageTransfer {
        machine: String,
        #[source]
        source: CapabilityError,
    },

    #[error("Image transfer {transfer} for machine {machine} did not finish in time")]
    ImageTransferTimeout { machine: String, transfer: u32 },

    #[error("Unit {unit} failed to start: {reason}")]
    ServiceStartFailed { unit: String, reason: String },

    #[error("Machine {0} not found")]
    MachineNotFound(String),

    #[error("Machine {0} is already registered")]
    DuplicateMachine(String),

    #[error("Machine {machine}: invalid transition {from} -> {to}")]
    InvalidStateTransition {
        machine: String,
        from: MachineState,
        to: MachineState,
    },

    #[error("Task {task}: invalid transition {from} -> {to}")]
    InvalidTaskTransition {
        task: String,
        from: TaskLifecycleState,
        to: TaskLifecycleState,
    },

    #[error("Task {task} cannot be recovered: machine {machine} no longer exists")]
    TaskNotRecoverable { task: String, machine: String },

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Task {0} already exists")]
    DuplicateTask(String),

    #[error("Task {0} is still running")]
    TaskStillRunning(String),

    #[error("Exec requires a command")]
    EmptyCommand,

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Operation cancelled by driver shutdown")]
    Cancelled,

    #[error("Invalid task handle: {0}")]
    Handle(String),

    #[error("Task {task} (machine {machine}) failed during {stage}: {source}")]
    Start {
        task: String,
        machine: String,
        stage: StartStage,
        #[source]
        source: Box<DriverError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl DriverError {
    pub(crate) fn start_failed(reason: impl Into<String>, unit: &str) -> Self {
        Self::ServiceStartFailed {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn job_failed(unit: &str, result: &JobResult) -> Self {
        Self::start_failed(format!("job finished with result '{}'", result.as_str()), unit)
    }

    /// Innermost error, unwrapping start stage context
    pub fn root(&self) -> &DriverError {
        match self {
            Self::Start { source, .. } => source.root(),
            other => other,
        }
    }
}
