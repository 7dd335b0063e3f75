//! Cgroup v2 resource accounting
//!
//! nspawn machines started through the template unit live in:
//!
//! /sys/fs/cgroup/
//! └── machine.slice/
//!     ├── systemd-nspawn@web-a1.service/
//!     └── systemd-nspawn@db-b2.service/

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::protocol::{CpuUsage, MemoryUsage, ResourceUsage};

pub struct CgroupReader {
    root: PathBuf,
}

impl CgroupReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cgroup directory of a machine's unit
    pub fn machine_cgroup(&self, unit: &str) -> PathBuf {
        self.root.join("machine.slice").join(unit)
    }

    /// Take one sample; CPU percent is left at zero (see [`cpu_percent`])
    pub async fn sample(&self, cgroup_path: &Path) -> io::Result<ResourceUsage> {
        let cpu_stat = tokio::fs::read_to_string(cgroup_path.join("cpu.stat")).await?;
        let cpu = parse_cpu_stat(&cpu_stat);

        let mut memory = MemoryUsage {
            current: read_u64(&cgroup_path.join("memory.current"))
                .await
                .ok()
                .flatten()
                .unwrap_or(0),
            max: read_u64(&cgroup_path.join("memory.max")).await.ok().flatten(),
            swap: read_u64(&cgroup_path.join("memory.swap.current"))
                .await
                .ok()
                .flatten()
                .unwrap_or(0),
            ..Default::default()
        };
        if let Ok(stat) = tokio::fs::read_to_string(cgroup_path.join("memory.stat")).await {
            let (rss, cache) = parse_memory_stat(&stat);
            memory.rss = rss;
            memory.cache = cache;
        }

        let pids = read_u64(&cgroup_path.join("pids.current"))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);

        Ok(ResourceUsage {
            timestamp: Utc::now(),
            cpu,
            memory,
            pids,
        })
    }
}

/// Read a single-value cgroup file; "max" reads as None
async fn read_u64(path: &Path) -> io::Result<Option<u64>> {
    let content = tokio::fs::read_to_string(path).await?;
    let value = content.trim();
    if value == "max" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("bad value in {}", path.display())))
}

fn parse_cpu_stat(content: &str) -> CpuUsage {
    let mut cpu = CpuUsage::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key {
            "usage_usec" => cpu.total_usec = value,
            "user_usec" => cpu.user_usec = value,
            "system_usec" => cpu.system_usec = value,
            "throttled_usec" => cpu.throttled_usec = value,
            _ => {}
        }
    }
    cpu
}

/// (rss, cache) from memory.stat: anon and file bytes
fn parse_memory_stat(content: &str) -> (u64, u64) {
    let mut rss = 0;
    let mut cache = 0;
    for line in content.lines() {
        match line.split_once(' ') {
            Some(("anon", v)) => rss = v.trim().parse().unwrap_or(0),
            Some(("file", v)) => cache = v.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    (rss, cache)
}

/// CPU share between two samples, 100.0 = one core fully busy
pub fn cpu_percent(prev: &ResourceUsage, next: &ResourceUsage) -> f64 {
    let wall = (next.timestamp - prev.timestamp).num_microseconds().unwrap_or(0);
    if wall <= 0 {
        return 0.0;
    }
    let used = next.cpu.total_usec.saturating_sub(prev.cpu.total_usec);
    used as f64 * 100.0 / wall as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn fake_cgroup() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let root = PathBuf::from(format!("/tmp/nspawn-cgroup-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    #[test]
    fn test_parse_cpu_stat() {
        let cpu = parse_cpu_stat(
            "usage_usec 5000\nuser_usec 3000\nsystem_usec 2000\nnr_periods 0\nthrottled_usec 7\n",
        );
        assert_eq!(cpu.total_usec, 5000);
        assert_eq!(cpu.user_usec, 3000);
        assert_eq!(cpu.system_usec, 2000);
        assert_eq!(cpu.throttled_usec, 7);
    }

    #[test]
    fn test_parse_memory_stat() {
        assert_eq!(parse_memory_stat("anon 4096\nfile 8192\nkernel 12\n"), (4096, 8192));
        assert_eq!(parse_memory_stat(""), (0, 0));
    }

    #[test]
    fn test_machine_cgroup_path() {
        let reader = CgroupReader::new("/sys/fs/cgroup");
        assert_eq!(
            reader.machine_cgroup("systemd-nspawn@web-a1.service"),
            PathBuf::from("/sys/fs/cgroup/machine.slice/systemd-nspawn@web-a1.service")
        );
    }

    #[tokio::test]
    async fn test_sample_reads_files() {
        let root = fake_cgroup();
        let reader = CgroupReader::new(&root);
        let dir = reader.machine_cgroup("systemd-nspawn@m.service");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cpu.stat"), "usage_usec 100\nuser_usec 60\nsystem_usec 40\n").unwrap();
        std::fs::write(dir.join("memory.current"), "1048576\n").unwrap();
        std::fs::write(dir.join("memory.max"), "max\n").unwrap();
        std::fs::write(dir.join("memory.stat"), "anon 1000\nfile 2000\n").unwrap();
        std::fs::write(dir.join("pids.current"), "3\n").unwrap();

        let usage = reader.sample(&dir).await.unwrap();
        assert_eq!(usage.cpu.total_usec, 100);
        assert_eq!(usage.memory.current, 1048576);
        assert_eq!(usage.memory.max, None);
        assert_eq!(usage.memory.rss, 1000);
        assert_eq!(usage.memory.cache, 2000);
        assert_eq!(usage.memory.swap, 0);
        assert_eq!(usage.pids, 3);
    }

    #[tokio::test]
    async fn test_sample_missing_cgroup_fails() {
        let reader = CgroupReader::new(fake_cgroup());
        assert!(reader.sample(&reader.machine_cgroup("gone.service")).await.is_err());
    }

    #[test]
    fn test_cpu_percent() {
        let prev = ResourceUsage {
            timestamp: Utc::now(),
            cpu: CpuUsage { total_usec: 1_000_000, ..Default::default() },
            memory: MemoryUsage::default(),
            pids: 1,
        };
        let mut next = prev.clone();
        next.timestamp = prev.timestamp + chrono::Duration::seconds(2);
        next.cpu.total_usec = 2_000_000;
        assert!((cpu_percent(&prev, &next) - 50.0).abs() < f64::EPSILON);
        assert_eq!(cpu_percent(&next, &prev), 0.0);
    }
}
