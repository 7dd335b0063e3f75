//! Driver configuration
//!
//! Read from an INI file in unit-file syntax:
//!
//! ```text
//! [Driver]
//! Enabled=yes
//! UnitDirectory=/etc/systemd/nspawn
//! CgroupRoot=/sys/fs/cgroup
//! WatchInterval=1s
//! EventBuffer=64
//! StartTimeout=90s
//!
//! [Import]
//! Verify=no
//! PollInitial=100ms
//! PollMax=5s
//! Deadline=10min
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::units::parser::{self, last_value, ParseError, ParsedFile};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nspawn-driver.conf";
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/nspawn";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Image pull polling
#[derive(Debug, Clone, PartialEq)]
pub struct ImportPolicy {
    /// importd signature verification: "no", "checksum" or "signature"
    pub verify: String,
    /// First delay between transfer list polls
    pub poll_initial: Duration,
    /// Backoff cap
    pub poll_max: Duration,
    /// Give up on the pull after this long
    pub deadline: Duration,
}

impl Default for ImportPolicy {
    fn default() -> Self {
        Self {
            verify: "no".into(),
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
            deadline: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub enabled: bool,
    /// Where .nspawn files are written
    pub unit_dir: PathBuf,
    /// cgroup2 mount point, read for stats
    pub cgroup_root: PathBuf,
    /// How often running machines are polled for state changes
    pub watch_interval: Duration,
    /// Per-subscriber event backlog before old events are dropped
    pub event_buffer: usize,
    /// Upper bound on waiting for the unit start job
    pub start_timeout: Duration,
    pub import: ImportPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            watch_interval: Duration::from_secs(1),
            event_buffer: 64,
            start_timeout: Duration::from_secs(90),
            import: ImportPolicy::default(),
        }
    }
}

impl DriverConfig {
    /// Load from disk; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self, ParseError> {
        match parser::parse_path(path).await {
            Ok(parsed) => Self::from_parsed(&parsed),
            Err(ParseError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn from_parsed(parsed: &ParsedFile) -> Result<Self, ParseError> {
        let mut cfg = Self::default();

        if let Some(v) = last_value(parsed, "[Driver]", "Enabled") {
            cfg.enabled = parser::parse_bool(v).ok_or_else(|| invalid("Enabled", v))?;
        }
        if let Some(v) = last_value(parsed, "[Driver]", "UnitDirectory") {
            cfg.unit_dir = PathBuf::from(v);
        }
        if let Some(v) = last_value(parsed, "[Driver]", "CgroupRoot") {
            cfg.cgroup_root = PathBuf::from(v);
        }
        if let Some(v) = last_value(parsed, "[Driver]", "WatchInterval") {
            cfg.watch_interval = nonzero_duration("WatchInterval", v)?;
        }
        if let Some(v) = last_value(parsed, "[Driver]", "EventBuffer") {
            cfg.event_buffer = v
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid("EventBuffer", v))?;
        }
        if let Some(v) = last_value(parsed, "[Driver]", "StartTimeout") {
            cfg.start_timeout = duration("StartTimeout", v)?;
        }

        if let Some(v) = last_value(parsed, "[Import]", "Verify") {
            match v {
                "no" | "checksum" | "signature" => cfg.import.verify = v.to_string(),
                _ => return Err(invalid("Verify", v)),
            }
        }
        if let Some(v) = last_value(parsed, "[Import]", "PollInitial") {
            cfg.import.poll_initial = nonzero_duration("PollInitial", v)?;
        }
        if let Some(v) = last_value(parsed, "[Import]", "PollMax") {
            cfg.import.poll_max = nonzero_duration("PollMax", v)?;
        }
        if let Some(v) = last_value(parsed, "[Import]", "Deadline") {
            cfg.import.deadline = duration("Deadline", v)?;
        }
        if cfg.import.poll_max < cfg.import.poll_initial {
            cfg.import.poll_max = cfg.import.poll_initial;
        }

        Ok(cfg)
    }
}

fn invalid(key: &str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn duration(key: &str, value: &str) -> Result<Duration, ParseError> {
    parse_duration(value).ok_or_else(|| invalid(key, value))
}

/// Polling intervals: zero would spin
fn nonzero_duration(key: &str, value: &str) -> Result<Duration, ParseError> {
    Some(duration(key, value)?)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| invalid(key, value))
}

/// Parse a duration string (e.g., "5s", "100ms", "10min", "1h", bare seconds)
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(n) = s.strip_suffix("ms") {
        n.parse().ok().map(Duration::from_millis)
    } else if let Some(n) = s.strip_suffix("min") {
        n.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(n) = s.strip_suffix('s') {
        n.parse().ok().map(Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('h') {
        n.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::parser::parse_file;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("10min"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_defaults_when_empty() {
        let cfg = DriverConfig::from_parsed(&parse_file("").unwrap()).unwrap();
        assert_eq!(cfg, DriverConfig::default());
        assert_eq!(cfg.unit_dir, PathBuf::from("/etc/systemd/nspawn"));
        assert_eq!(cfg.import.verify, "no");
    }

    #[test]
    fn test_overrides() {
        let parsed = parse_file(
            r#"
[Driver]
Enabled=no
UnitDirectory=/run/systemd/nspawn
WatchInterval=250ms
EventBuffer=8

[Import]
Verify=checksum
PollInitial=50ms
PollMax=2s
Deadline=1min
"#,
        )
        .unwrap();
        let cfg = DriverConfig::from_parsed(&parsed).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.unit_dir, PathBuf::from("/run/systemd/nspawn"));
        assert_eq!(cfg.watch_interval, Duration::from_millis(250));
        assert_eq!(cfg.event_buffer, 8);
        assert_eq!(cfg.import.verify, "checksum");
        assert_eq!(cfg.import.poll_initial, Duration::from_millis(50));
        assert_eq!(cfg.import.poll_max, Duration::from_secs(2));
        assert_eq!(cfg.import.deadline, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for content in [
            "[Driver]\nEnabled=perhaps\n",
            "[Driver]\nEventBuffer=0\n",
            "[Import]\nVerify=gpg\n",
            "[Import]\nDeadline=forever\n",
            "[Driver]\nWatchInterval=0\n",
            "[Import]\nPollInitial=0\n",
            "[Import]\nPollMax=0ms\n",
        ] {
            let parsed = parse_file(content).unwrap();
            assert!(matches!(
                DriverConfig::from_parsed(&parsed),
                Err(ParseError::InvalidValue { .. })
            ));
        }
    }

    #[test]
    fn test_poll_max_never_below_initial() {
        let parsed = parse_file("[Import]\nPollInitial=3s\nPollMax=1s\n").unwrap();
        let cfg = DriverConfig::from_parsed(&parsed).unwrap();
        assert_eq!(cfg.import.poll_max, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let cfg = DriverConfig::load(Path::new("/nonexistent/nspawn-driver.conf"))
            .await
            .unwrap();
        assert_eq!(cfg, DriverConfig::default());
    }
}
