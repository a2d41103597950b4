use crate::error::{ContainerError, ContainerResult};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::CGROUP_PREFIX;

const CONTROLLERS: &str = "+cpu +memory +pids";
pub const CPU_UNLIMITED: &str = "max";
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CgroupManager {
    root: PathBuf,
}

impl CgroupManager {
    /// `mount_root` is the cgroup2 mount point; the engine works under `<mount_root>/cellbox`.
    pub fn new(mount_root: impl AsRef<Path>) -> Self {
        Self {
            root: mount_root.as_ref().join(CGROUP_PREFIX),
        }
    }
    pub fn node_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn ensure_root(&self) -> ContainerResult<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(|e| {
                ContainerError::cgroup_setup(format!(
                    "Failed to create cgroup root {:?}: {}",
                    self.root, e
                ))
            })?;
            log::debug!("Created cgroup root: {:?}", self.root);
        }
        let subtree = self.root.join("cgroup.subtree_control");
        write_file(&subtree, CONTROLLERS)?;
        log::debug!("Enabled controllers {CONTROLLERS:?} on {:?}", self.root);
        Ok(())
    }

    pub fn create(&self, id: &str) -> ContainerResult<PathBuf> {
        self.ensure_root()?;
        let path = self.node_path(id);
        fs::create_dir_all(&path).map_err(|e| {
            ContainerError::cgroup_setup(format!("Failed to create cgroup directory: {}", e))
        })?;
        log::info!("Created cgroup node {:?}", path);
        Ok(path)
    }
}

/// Removes a container's node. A SIGKILLed member leaves the node only once the kernel has
/// reaped it, so `cgroup.procs` is polled for up to `drain` before the `rmdir`.
pub fn delete_node(node: &Path, drain: Duration) -> ContainerResult<()> {
    if !wait_until_empty(node, drain) {
        log::warn!("cgroup {:?} still has members after {:?}", node, drain);
    }
    fs::remove_dir(node).map_err(|e| {
        ContainerError::cgroup_setup(format!("Failed to remove cgroup {:?}: {}", node, e))
    })?;
    log::info!("Removed cgroup {:?}", node);
    Ok(())
}

/// True once `cgroup.procs` lists no pid, or the file is gone.
pub fn wait_until_empty(node: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let populated = read_file(&node.join("cgroup.procs")).is_some_and(|procs| !procs.is_empty());
        if !populated {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(DRAIN_POLL);
    }
}

/// Writes `memory.max` for `node`. Swap is pinned to zero and OOM group kill enabled;
/// both are best effort since older kernels lack the control files.
pub fn set_memory_limit(node: &Path, limit: &str) -> ContainerResult<()> {
    if limit.trim().is_empty() {
        return Ok(());
    }
    let bytes = parse_memory_limit(limit)?;
    write_file(&node.join("memory.max"), &bytes.to_string())?;
    log::info!(
        "Set memory limit: {} bytes ({})",
        bytes,
        format_bytes(bytes)
    );
    if let Err(e) = write_file(&node.join("memory.swap.max"), "0") {
        log::warn!("Cannot disable swap for {:?}: {}", node, e);
    }
    if let Err(e) = write_file(&node.join("memory.oom.group"), "1") {
        log::warn!("Cannot enable oom.group for {:?}: {}", node, e);
    }
    Ok(())
}

/// `quota` is either `max` or `<quota> <period>` in microseconds, written as given.
pub fn set_cpu_quota(node: &Path, quota: &str) -> ContainerResult<()> {
    let quota = quota.trim();
    if quota.is_empty() {
        return Ok(());
    }
    write_file(&node.join("cpu.max"), quota)?;
    log::info!("Set CPU quota: {quota}");
    Ok(())
}

pub fn add_process(node: &Path, pid: i32) -> ContainerResult<()> {
    write_file(&node.join("cgroup.procs"), &pid.to_string())?;
    log::debug!("Added process {} to cgroup {:?}", pid, node);
    Ok(())
}

/// Accepts plain bytes or a `M`/`G` suffixed value (binary multiples).
pub fn parse_memory_limit(limit: &str) -> ContainerResult<u64> {
    let limit = limit.trim();
    let (digits, multiplier) = if let Some(mb) = limit.strip_suffix(['M', 'm']) {
        (mb, 1024 * 1024)
    } else if let Some(gb) = limit.strip_suffix(['G', 'g']) {
        (gb, 1024 * 1024 * 1024)
    } else {
        (limit, 1)
    };
    let value: u64 = digits.parse().map_err(|e| {
        ContainerError::invalid_configuration(format!("invalid memory limit {limit:?}: {e}"))
    })?;
    value.checked_mul(multiplier).ok_or_else(|| {
        ContainerError::invalid_configuration(format!("memory limit {limit:?} overflows"))
    })
}

// Control files are created by the kernel, so never create them here.
fn write_file(path: &Path, content: &str) -> ContainerResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ContainerError::Cgroup {
            message: format!("Failed to open {:?}: {}", path, e),
        })?;
    file.write_all(content.as_bytes())
        .map_err(|e| ContainerError::Cgroup {
            message: format!("Failed to write to {:?}: {}", path, e),
        })?;
    Ok(())
}

fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            log::debug!("Failed to read {:?}: {}", path, e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuLimit {
    Unlimited,
    Quota { quota: u64, period: u64 },
}

impl CpuLimit {
    pub fn percent(&self) -> Option<f64> {
        match self {
            CpuLimit::Quota { quota, period } if *period > 0 => {
                Some(*quota as f64 / *period as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// Figures read back from a node's control files. A field is `None` when its file is absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CgroupStats {
    /// `Some(None)` means the node is present with `memory.max` = `max`.
    pub memory_limit: Option<Option<u64>>,
    pub memory_current: Option<u64>,
    pub memory_peak: Option<u64>,
    pub cpu_limit: Option<CpuLimit>,
    pub cpu_usage: Option<Duration>,
    pub memory_events: Vec<(String, u64)>,
    pub procs: Vec<i32>,
}

pub fn read_stats(node: &Path) -> CgroupStats {
    let memory_limit = read_file(&node.join("memory.max")).map(|v| {
        if v == "max" {
            None
        } else {
            v.parse().ok()
        }
    });
    let cpu_limit = read_file(&node.join("cpu.max")).and_then(|v| parse_cpu_max(&v));
    let cpu_usage = read_file(&node.join("cpu.stat")).and_then(|stat| {
        stat.lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(key, _)| *key == "usage_usec")
            .and_then(|(_, usec)| usec.trim().parse().ok())
            .map(Duration::from_micros)
    });
    let memory_events = read_file(&node.join("memory.events"))
        .map(|events| {
            events
                .lines()
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let key = fields.next()?;
                    let count: u64 = fields.next()?.parse().ok()?;
                    (count != 0).then(|| (key.to_string(), count))
                })
                .collect()
        })
        .unwrap_or_default();
    let procs = read_file(&node.join("cgroup.procs"))
        .map(|procs| procs.lines().filter_map(|p| p.trim().parse().ok()).collect())
        .unwrap_or_default();

    CgroupStats {
        memory_limit,
        memory_current: read_file(&node.join("memory.current")).and_then(|v| v.parse().ok()),
        memory_peak: read_file(&node.join("memory.peak")).and_then(|v| v.parse().ok()),
        cpu_limit,
        cpu_usage,
        memory_events,
        procs,
    }
}

fn parse_cpu_max(value: &str) -> Option<CpuLimit> {
    let mut fields = value.split_whitespace();
    match (fields.next()?, fields.next()) {
        (CPU_UNLIMITED, _) => Some(CpuLimit::Unlimited),
        (quota, Some(period)) => Some(CpuLimit::Quota {
            quota: quota.parse().ok()?,
            period: period.parse().ok()?,
        }),
        _ => None,
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}
