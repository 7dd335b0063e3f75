//! nspawn-driver - Task driver for systemd-nspawn machines
//!
//! Runs each task as a container managed by the host's systemd:
//! - Renders the task definition into a .nspawn unit file
//! - Pulls the image through systemd-importd
//! - Starts `systemd-nspawn@<machine>.service` through PID 1
//! - Tracks the machine through systemd-machined
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                     Driver                       │
//! ├─────────────────────────────────────────────────┤
//! │ Unit render │ Import tracker │ Launcher │ Registry│
//! ├─────────────────────────────────────────────────┤
//! │   capability traits (UnitManager, MachineManager, │
//! │   TransferService) -> D-Bus clients              │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod capability;
pub mod cgroups;
pub mod config;
pub mod dbus;
pub mod manager;
pub mod protocol;
pub mod units;

pub use manager::{Driver, DriverError, Facilities};
