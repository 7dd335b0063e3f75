//! Typed task definitions matching systemd .nspawn files
//!
//! Field names follow the directives in systemd.nspawn(5). Every field is
//! defaulted so a partial document deserializes into a valid spec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Task envelope handed over by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Opaque task identifier
    pub id: String,
    /// Task name, may contain '/' (e.g. "web/frontend")
    pub name: String,
    /// Allocation identifier
    pub alloc_id: String,
    /// Container definition
    #[serde(default)]
    pub spec: TaskSpec,
}

impl TaskConfig {
    /// Name of the machine backing this task
    pub fn machine_name(&self) -> String {
        machine_name(&self.name, &self.alloc_id)
    }
}

/// Derive a machine name from task identity: "web/frontend" + "a1" -> "web_frontend-a1"
pub fn machine_name(task_name: &str, alloc_id: &str) -> String {
    format!("{}-{}", task_name.replace('/', "_"), alloc_id)
}

/// How importd should fetch the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Raw,
    Tar,
}

impl ImageKind {
    /// Guess the image kind from the URL suffix
    pub fn detect(image: &str) -> Self {
        const TAR_SUFFIXES: &[&str] = &[".tar", ".tar.gz", ".tar.xz", ".tar.bz2", ".tgz"];
        let path = image.split(['?', '#']).next().unwrap_or(image);
        if TAR_SUFFIXES.iter().any(|s| path.ends_with(s)) {
            Self::Tar
        } else {
            Self::Raw
        }
    }
}

/// Container definition: image plus the three .nspawn sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Image URL passed to importd
    pub image: String,
    pub exec: ExecOptions,
    pub files: FilesOptions,
    pub network: NetworkOptions,
}

/// [Exec] section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Search for an init and boot it; excludes process_two
    pub boot: bool,
    /// Run on a snapshot removed when the container exits
    pub ephemeral: bool,
    /// Run the payload as PID 2 under a stub init
    pub process_two: bool,
    /// Command line, or init arguments when boot is set
    pub parameters: Vec<String>,
    pub environment: HashMap<String, String>,
    pub user: String,
    pub working_directory: String,
    /// Single path or "outer:inner"
    pub pivot_root: String,
    pub capability: Vec<String>,
    pub drop_capability: Vec<String>,
    pub no_new_privileges: bool,
    /// Signal sent to PID 1 on orderly shutdown
    pub kill_signal: Option<u32>,
    pub personality: String,
    pub machine_id: String,
    pub private_users: String,
    pub notify_ready: bool,
    pub system_call_filter: Vec<String>,
    pub limits: ResourceLimits,
    /// -1000..=1000
    pub oom_score_adjust: Option<i32>,
    pub cpu_affinity: Vec<String>,
    pub hostname: String,
    pub resolv_conf: String,
    pub timezone: String,
    pub link_journal: String,
}

/// POSIX resource limits, each "SOFT:HARD" or "VALUE"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu: String,
    pub fsize: String,
    pub data: String,
    pub stack: String,
    pub core: String,
    pub rss: String,
    pub nofile: String,
    #[serde(rename = "as")]
    pub address_space: String,
    pub nproc: String,
    pub memlock: String,
    pub locks: String,
    pub sigpending: String,
    pub msgqueue: String,
    pub nice: String,
    pub rtprio: String,
    pub rttime: String,
}

impl ResourceLimits {
    /// Limits paired with their directive names, in file order
    pub fn directives(&self) -> [(&'static str, &str); 16] {
        [
            ("LimitCPU", &self.cpu),
            ("LimitFSIZE", &self.fsize),
            ("LimitDATA", &self.data),
            ("LimitSTACK", &self.stack),
            ("LimitCORE", &self.core),
            ("LimitRSS", &self.rss),
            ("LimitNOFILE", &self.nofile),
            ("LimitAS", &self.address_space),
            ("LimitNPROC", &self.nproc),
            ("LimitMEMLOCK", &self.memlock),
            ("LimitLOCKS", &self.locks),
            ("LimitSIGPENDING", &self.sigpending),
            ("LimitMSGQUEUE", &self.msgqueue),
            ("LimitNICE", &self.nice),
            ("LimitRTPRIO", &self.rtprio),
            ("LimitRTTIME", &self.rttime),
        ]
    }
}

/// [Files] section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesOptions {
    pub read_only: bool,
    /// "no", "yes" or "state"
    pub volatile: String,
    pub bind: Vec<String>,
    pub bind_read_only: Vec<String>,
    pub temporary_file_system: Vec<String>,
    pub inaccessible: Vec<String>,
    /// Each stack is a list of paths, lowest layer first
    pub overlay: Vec<Vec<String>>,
    pub overlay_read_only: Vec<Vec<String>>,
    pub private_users_chown: bool,
}

/// [Network] section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub private: bool,
    pub virtual_ethernet: bool,
    /// "host:container" veth pairs
    pub virtual_ethernet_extra: Vec<String>,
    pub interface: Vec<String>,
    pub macvlan: Vec<String>,
    pub ipvlan: Vec<String>,
    pub bridge: String,
    pub zone: String,
    /// "proto:host:container"
    pub port: Vec<String>,
}
