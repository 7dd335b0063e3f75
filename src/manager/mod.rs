//! Task driver
//!
//! Renders, pulls, starts, watches, stops and destroys nspawn machines on
//! behalf of a scheduler.

mod driver;
mod error;
mod events;
mod import;
mod launcher;
mod registry;
mod shutdown;
mod signal;
mod state;
mod unit_files;

pub use driver::{Driver, Facilities};
pub use error::{DriverError, StartStage};
pub use events::{EventBroadcaster, EventSubscription, TaskEvent};
pub use import::{ImportTracker, TransferHandle};
pub use launcher::{nspawn_unit, ServiceLauncher, StartOutcome};
pub use registry::{Machine, MachineRegistry};
pub use shutdown::{channel as shutdown_channel, Shutdown, ShutdownTrigger};
pub use signal::{default_stop_signal, parse_signal};
pub use state::{MachineState, TaskLifecycleState};
pub use unit_files::UnitFiles;
