//! Host resource sampling.

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// One CPU and memory reading, both in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host CPU and memory usage.
pub trait ResourceSampler: Send + Sync {
    /// Takes a reading.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the platform source is unavailable.
    fn sample(&self) -> io::Result<ResourceSample>;
}

/// Reads `/proc/stat` and `/proc/meminfo`.
///
/// CPU usage is the busy share of jiffies since the previous call, so the
/// first reading only establishes a baseline and reports 0%.
#[derive(Debug)]
pub struct ProcfsSampler {
    root: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsSampler {
    /// Uses `root` instead of `/proc`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: Mutex::new(None),
        }
    }

    fn cpu_times(&self) -> io::Result<CpuTimes> {
        let stat = std::fs::read_to_string(self.root.join("stat"))?;
        parse_cpu_line(&stat).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no aggregate cpu line"))
    }

    fn memory_percent(&self) -> io::Result<f64> {
        let meminfo = std::fs::read_to_string(self.root.join("meminfo"))?;
        parse_meminfo(&meminfo).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "meminfo incomplete"))
    }
}

impl ResourceSampler for ProcfsSampler {
    fn sample(&self) -> io::Result<ResourceSample> {
        let current = self.cpu_times()?;
        let memory_percent = self.memory_percent()?;

        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let cpu_percent = previous.map_or(0.0, |before| busy_percent(before, current));
        *previous = Some(current);

        Ok(ResourceSample {
            cpu_percent,
            memory_percent,
        })
    }
}

fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let used = (total.saturating_sub(available)) as f64 / total as f64 * 100.0;
    Some(used)
}

fn busy_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    #[allow(clippy::cast_precision_loss)]
    let busy = (total.saturating_sub(idle)) as f64 / total as f64 * 100.0;
    busy
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_line() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
        let times = parse_cpu_line(stat).unwrap();
        assert_eq!(times.idle, 800);
        assert_eq!(times.total, 1000);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert!((parse_meminfo(meminfo).unwrap() - 75.0).abs() < 1e-9);
        assert!(parse_meminfo("MemTotal: 10 kB\n").is_none());
    }

    #[test]
    fn test_busy_percent_between_readings() {
        let before = CpuTimes { idle: 800, total: 1000 };
        let after = CpuTimes { idle: 850, total: 1200 };
        assert!((busy_percent(before, after) - 75.0).abs() < 1e-9);
        assert!(busy_percent(after, after).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sampler_reads_fake_procfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  10 0 10 80 0 0 0\n").unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 200 kB\nMemAvailable: 50 kB\n").unwrap();

        let sampler = ProcfsSampler::with_root(dir.path());
        let first = sampler.sample().unwrap();
        assert!(first.cpu_percent.abs() < f64::EPSILON);
        assert!((first.memory_percent - 75.0).abs() < 1e-9);

        std::fs::write(dir.path().join("stat"), "cpu  60 0 10 130 0 0 0\n").unwrap();
        let second = sampler.sample().unwrap();
        assert!((second.cpu_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_procfs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = ProcfsSampler::with_root(dir.path().join("missing"));
        assert!(sampler.sample().is_err());
    }
}
