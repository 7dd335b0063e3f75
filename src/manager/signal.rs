//! Signal names as the scheduler sends them ("SIGTERM", "TERM", "15",
//! "SIGRTMIN+3")

use std::str::FromStr;

use nix::libc;
use nix::sys::signal::Signal;

use super::DriverError;
use crate::units::TaskSpec;

pub fn parse_signal(s: &str) -> Result<i32, DriverError> {
    let invalid = || DriverError::InvalidSignal(s.to_string());
    let trimmed = s.trim();

    if let Ok(n) = trimmed.parse::<i32>() {
        return if (1..=libc::SIGRTMAX()).contains(&n) {
            Ok(n)
        } else {
            Err(invalid())
        };
    }

    let upper = trimmed.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    if let Some(rest) = name.strip_prefix("SIGRTMIN") {
        let offset = realtime_offset(rest, '+').ok_or_else(invalid)?;
        let n = libc::SIGRTMIN() + offset;
        return if n <= libc::SIGRTMAX() { Ok(n) } else { Err(invalid()) };
    }
    if let Some(rest) = name.strip_prefix("SIGRTMAX") {
        let offset = realtime_offset(rest, '-').ok_or_else(invalid)?;
        let n = libc::SIGRTMAX() - offset;
        return if n >= libc::SIGRTMIN() { Ok(n) } else { Err(invalid()) };
    }

    Signal::from_str(&name).map(|sig| sig as i32).map_err(|_| invalid())
}

/// "" -> 0, "+3" -> 3 (for sign '+')
fn realtime_offset(rest: &str, sign: char) -> Option<i32> {
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix(sign)?.parse().ok()
}

/// Signal for an orderly stop: the configured KillSignal, else what the
/// payload expects (systemd as init wants SIGRTMIN+3, anything else SIGTERM)
pub fn default_stop_signal(spec: &TaskSpec) -> i32 {
    if let Some(n) = spec.exec.kill_signal {
        match i32::try_from(n) {
            Ok(sig) if (1..=libc::SIGRTMAX()).contains(&sig) => return sig,
            _ => log::warn!("Ignoring out of range KillSignal={}", n),
        }
    }
    if spec.exec.boot {
        libc::SIGRTMIN() + 3
    } else {
        Signal::SIGTERM as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal(" HUP ").unwrap(), libc::SIGHUP);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_signal("9").unwrap(), 9);
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("-1").is_err());
        assert!(parse_signal("1000").is_err());
    }

    #[test]
    fn test_parse_realtime() {
        assert_eq!(parse_signal("SIGRTMIN").unwrap(), libc::SIGRTMIN());
        assert_eq!(parse_signal("SIGRTMIN+3").unwrap(), libc::SIGRTMIN() + 3);
        assert_eq!(parse_signal("RTMAX-1").unwrap(), libc::SIGRTMAX() - 1);
        assert!(parse_signal("SIGRTMIN+200").is_err());
        assert!(parse_signal("SIGRTMIN-1").is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_signal("SIGNOPE"), Err(DriverError::InvalidSignal(_))));
        assert!(parse_signal("").is_err());
    }

    #[test]
    fn test_default_stop_signal() {
        let mut spec = TaskSpec::default();
        assert_eq!(default_stop_signal(&spec), libc::SIGTERM);
        spec.exec.boot = true;
        assert_eq!(default_stop_signal(&spec), libc::SIGRTMIN() + 3);
        spec.exec.kill_signal = Some(2);
        assert_eq!(default_stop_signal(&spec), 2);
    }

    #[test]
    fn test_out_of_range_kill_signal_falls_back() {
        let mut spec = TaskSpec::default();
        for bad in [0, 1000, u32::MAX] {
            spec.exec.kill_signal = Some(bad);
            spec.exec.boot = false;
            assert_eq!(default_stop_signal(&spec), libc::SIGTERM);
            spec.exec.boot = true;
            assert_eq!(default_stop_signal(&spec), libc::SIGRTMIN() + 3);
        }
    }
}
