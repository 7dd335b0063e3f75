//! .nspawn file generation
//!
//! Turns a [`TaskSpec`] into the text systemd-nspawn reads from
//! `/etc/systemd/nspawn/<machine>.nspawn`. Output is deterministic:
//! sections and keys appear in a fixed order and environment entries are
//! sorted by key.

use std::fmt::Display;

use super::task::{ExecOptions, FilesOptions, NetworkOptions, TaskSpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("{key}= value contains a line break: {value:?}")]
    LineBreak { key: &'static str, value: String },

    #[error("Invalid environment variable name: {0:?}")]
    InvalidEnvironmentKey(String),

    #[error("Boot= and ProcessTwo= cannot both be enabled")]
    BootWithProcessTwo,
}

/// Render the complete unit text for a task
pub fn render(spec: &TaskSpec) -> Result<String, RenderError> {
    let mut w = UnitWriter::default();
    exec_section(&mut w, &spec.exec)?;
    w.blank();
    files_section(&mut w, &spec.files)?;
    w.blank();
    network_section(&mut w, &spec.network)?;
    Ok(w.finish())
}

fn exec_section(w: &mut UnitWriter, exec: &ExecOptions) -> Result<(), RenderError> {
    if exec.boot && exec.process_two {
        return Err(RenderError::BootWithProcessTwo);
    }

    w.section("Exec");
    w.flag("Boot", exec.boot);
    w.flag("Ephemeral", exec.ephemeral);
    w.flag("ProcessTwo", exec.process_two);
    w.joined("Parameters", &exec.parameters, ",")?;

    let mut env: Vec<(&String, &String)> = exec.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        if key.is_empty() || key.contains('=') {
            return Err(RenderError::InvalidEnvironmentKey(key.clone()));
        }
        w.value("Environment", &format!("{}={}", key, value))?;
    }

    w.value("User", &exec.user)?;
    w.value("WorkingDirectory", &exec.working_directory)?;
    w.value("PivotRoot", &exec.pivot_root)?;
    w.joined("Capability", &exec.capability, " ")?;
    w.joined("DropCapability", &exec.drop_capability, " ")?;
    w.flag("NoNewPrivileges", exec.no_new_privileges);
    w.number("KillSignal", exec.kill_signal);
    w.value("Personality", &exec.personality)?;
    w.value("MachineID", &exec.machine_id)?;
    w.value("PrivateUsers", &exec.private_users)?;
    w.flag("NotifyReady", exec.notify_ready);
    w.joined("SystemCallFilter", &exec.system_call_filter, " ")?;
    for (key, limit) in exec.limits.directives() {
        w.value(key, limit)?;
    }
    w.number("OOMScoreAdjust", exec.oom_score_adjust);
    w.joined("CPUAffinity", &exec.cpu_affinity, ",")?;
    w.value("Hostname", &exec.hostname)?;
    w.value("ResolvConf", &exec.resolv_conf)?;
    w.value("Timezone", &exec.timezone)?;
    w.value("LinkJournal", &exec.link_journal)?;
    Ok(())
}

fn files_section(w: &mut UnitWriter, files: &FilesOptions) -> Result<(), RenderError> {
    w.section("Files");
    w.flag("ReadOnly", files.read_only);
    w.value("Volatile", &files.volatile)?;
    w.repeated("Bind", &files.bind)?;
    w.repeated("BindReadOnly", &files.bind_read_only)?;
    w.repeated("TemporaryFileSystem", &files.temporary_file_system)?;
    w.repeated("Inaccessible", &files.inaccessible)?;
    for stack in &files.overlay {
        w.joined("Overlay", stack, ":")?;
    }
    for stack in &files.overlay_read_only {
        w.joined("OverlayReadOnly", stack, ":")?;
    }
    w.flag("PrivateUsersChown", files.private_users_chown);
    Ok(())
}

fn network_section(w: &mut UnitWriter, net: &NetworkOptions) -> Result<(), RenderError> {
    w.section("Network");
    w.flag("Private", net.private);
    w.flag("VirtualEthernet", net.virtual_ethernet);
    w.repeated("VirtualEthernetExtra", &net.virtual_ethernet_extra)?;
    w.joined("Interface", &net.interface, " ")?;
    w.joined("MACVLAN", &net.macvlan, " ")?;
    w.joined("IPVLAN", &net.ipvlan, " ")?;
    w.value("Bridge", &net.bridge)?;
    w.value("Zone", &net.zone)?;
    w.repeated("Port", &net.port)?;
    Ok(())
}

/// Line-oriented builder for `Key=value` files
#[derive(Default)]
struct UnitWriter {
    out: String,
}

impl UnitWriter {
    fn section(&mut self, name: &str) {
        self.out.push('[');
        self.out.push_str(name);
        self.out.push_str("]\n");
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn value(&mut self, key: &'static str, value: &str) -> Result<(), RenderError> {
        if value.contains(['\n', '\r', '\0']) {
            return Err(RenderError::LineBreak {
                key,
                value: value.to_string(),
            });
        }
        self.out.push_str(key);
        self.out.push('=');
        self.out.push_str(value);
        self.out.push('\n');
        Ok(())
    }

    /// nspawn booleans are written as on/off
    fn flag(&mut self, key: &'static str, on: bool) {
        self.out.push_str(key);
        self.out.push_str(if on { "=on\n" } else { "=off\n" });
    }

    /// None renders as an empty assignment, Some(0) as "0"
    fn number<T: Display>(&mut self, key: &'static str, value: Option<T>) {
        self.out.push_str(key);
        self.out.push('=');
        if let Some(v) = value {
            self.out.push_str(&v.to_string());
        }
        self.out.push('\n');
    }

    fn joined(&mut self, key: &'static str, items: &[String], sep: &str) -> Result<(), RenderError> {
        self.value(key, &items.join(sep))
    }

    /// One line per element, same key each time
    fn repeated(&mut self, key: &'static str, items: &[String]) -> Result<(), RenderError> {
        for item in items {
            self.value(key, item)?;
        }
        Ok(())
    }

    fn finish(self) -> String {
        self.out
    }
}
