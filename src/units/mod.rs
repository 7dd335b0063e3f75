//! Task definitions and .nspawn unit files
//!
//! Turns a task's container definition into the INI text systemd-nspawn
//! reads. The INI parser here reads the driver config.

pub mod parser;
mod render;
mod task;

pub use parser::{parse_file, ParseError, ParsedFile};
pub use render::{render, RenderError};
pub use task::{
    machine_name, ExecOptions, FilesOptions, ImageKind, NetworkOptions, ResourceLimits,
    TaskConfig, TaskSpec,
};
