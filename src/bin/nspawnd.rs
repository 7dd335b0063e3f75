//! nspawnd - run tasks as systemd-nspawn machines
//!
//! Thin front end over the driver library:
//! - `render`: print the .nspawn file for a task definition
//! - `run`: start a task, stream its events and wait for it to exit
//! - `recover`: reattach to a task started by an earlier `run`
//! - `machines`: list what machined knows about

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::info;

use nspawn_driver::config::{DriverConfig, DEFAULT_CONFIG_PATH};
use nspawn_driver::dbus::SystemBus;
use nspawn_driver::protocol::{ExitResult, TaskHandle};
use nspawn_driver::units::{self, TaskConfig, TaskSpec};
use nspawn_driver::Driver;

/// Grace period for Ctrl-C initiated stops
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "nspawnd")]
#[command(about = "Run tasks as systemd-nspawn machines")]
struct Args {
    /// Driver configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the .nspawn unit for a task definition (JSON)
    Render { spec: PathBuf },

    /// Start a task and wait for it to exit
    Run {
        spec: PathBuf,

        /// Task name, '/' is allowed
        #[arg(long)]
        name: String,

        #[arg(long)]
        alloc_id: String,

        /// Task id, defaults to <name>-<alloc-id>
        #[arg(long)]
        id: Option<String>,

        /// Write the recoverable task handle here
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Reattach to a task from its state file and wait for it to exit
    Recover { state_file: PathBuf },

    /// List machines registered with machined
    Machines,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let command = match args.command {
        Command::Render { spec } => {
            let spec = read_spec(&spec).await?;
            print!("{}", units::render(&spec)?);
            return Ok(());
        }
        command => command,
    };

    let config = DriverConfig::load(&args.config).await?;
    let bus = SystemBus::connect().await?;
    let facilities = bus.facilities().await?;

    let result = match command {
        Command::Machines => {
            for m in facilities.machines.list_machines().await? {
                println!("{}\t{}\t{}", m.name, m.class, m.service);
            }
            Ok(())
        }
        Command::Run {
            spec,
            name,
            alloc_id,
            id,
            state_file,
        } => {
            let task = TaskConfig {
                id: id.unwrap_or_else(|| units::machine_name(&name, &alloc_id)),
                name,
                alloc_id,
                spec: read_spec(&spec).await?,
            };
            let driver = Driver::new(config, facilities);
            let outcome = run(&driver, task, state_file.as_deref()).await;
            driver.shutdown();
            outcome
        }
        Command::Recover { state_file } => {
            let handle = TaskHandle::decode(&tokio::fs::read(&state_file).await?)?;
            let driver = Driver::new(config, facilities);
            driver.recover_task(&handle).await?;
            info!("Recovered task {}", handle.task_id);
            let outcome = supervise(&driver, &handle.task_id).await;
            driver.shutdown();
            outcome
        }
        Command::Render { .. } => Ok(()),
    };

    bus.close().await?;
    result
}

async fn read_spec(path: &Path) -> Result<TaskSpec, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn run(
    driver: &Driver,
    task: TaskConfig,
    state_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let task_id = task.id.clone();
    let handle = driver.start_task(task).await?;
    info!("Task {} running", task_id);

    if let Some(path) = state_file {
        tokio::fs::write(path, handle.encode()?).await?;
        info!("Wrote task handle to {}", path.display());
    }

    supervise(driver, &task_id).await
}

/// Print events until the task exits; Ctrl-C stops and destroys it
async fn supervise(driver: &Driver, task_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = driver.task_events();
    let mut exit = driver.wait_task(task_id).await?;

    let result: ExitResult = loop {
        tokio::select! {
            Some(event) = events.recv() => {
                println!("{} [{}] {}", event.timestamp.to_rfc3339(), event.state, event.message);
            }
            result = &mut exit => break result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping task {}", task_id);
                driver.stop_task(task_id, STOP_TIMEOUT, None).await?;
                let result = (&mut exit).await?;
                driver.destroy_task(task_id, true).await?;
                report(&result);
                return Ok(());
            }
        }
    };

    driver.destroy_task(task_id, true).await?;
    report(&result);
    Ok(())
}

fn report(result: &ExitResult) {
    match &result.err {
        Some(err) => println!("exited: code={} signal={} ({})", result.exit_code, result.signal, err),
        None => println!("exited: code={} signal={}", result.exit_code, result.signal),
    }
}
