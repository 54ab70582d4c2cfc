use crate::events::{metrics, Observation};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

/// Source label of every system observation
pub const SYSTEM_SOURCE: &str = "system";

const PROC_TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// Samples host resources, the server process and TCP connection states
///
/// Sampling blocks for a short CPU measurement window, so async callers run it on a
/// blocking task.
pub struct SystemCollector {
    system: System,
    /// Process name looked up in the process table
    process_name: String,
    /// Path whose filesystem is reported as `disk_pct`
    disk_path: PathBuf,
}

impl SystemCollector {
    /// # Arguments
    ///
    /// * `binary` - Server binary; only its file name is matched against the process table
    /// * `disk_path` - Any path on the filesystem to report, usually the config directory
    pub fn new(binary: &str, disk_path: &Path) -> Self {
        let process_name = Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.to_string());
        Self {
            system: System::new(),
            process_name,
            disk_path: disk_path.to_path_buf(),
        }
    }

    /// Take one sample of every system metric
    ///
    /// # Returns
    ///
    /// `cpu_pct`, `mem_pct` and `disk_pct` when their totals are known, `server_up` and
    /// one `tcp_<state>` observation per connection state seen
    pub fn collect(&mut self) -> Vec<Observation> {
        let mut observations = Vec::new();

        self.system.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_cpu();
        let cpu = f64::from(self.system.global_cpu_info().cpu_usage());
        observations.push(Observation::new(metrics::CPU_PCT, cpu, SYSTEM_SOURCE));

        self.system.refresh_memory();
        if let Some(mem) = percent(self.system.used_memory(), self.system.total_memory()) {
            observations.push(Observation::new(metrics::MEM_PCT, mem, SYSTEM_SOURCE));
        }

        match self.disk_usage() {
            Some(disk) => observations.push(Observation::new(metrics::DISK_PCT, disk, SYSTEM_SOURCE)),
            None => warn!("No filesystem found for {}", self.disk_path.display()),
        }

        self.system.refresh_processes();
        let running = self
            .system
            .processes_by_exact_name(&self.process_name)
            .next()
            .is_some();
        debug!("Server process {} running: {}", self.process_name, running);
        observations.push(Observation::new(
            metrics::SERVER_UP,
            if running { 1.0 } else { 0.0 },
            self.process_name.clone(),
        ));

        observations.extend(tcp_observations());
        observations
    }

    fn disk_usage(&self) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64, u64)> = disks
            .list()
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.total_space(), d.available_space()))
            .collect();
        let (_, total, available) = containing_mount(&mounts, &self.disk_path)?;
        percent(total.saturating_sub(*available), *total)
    }
}

fn percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(used as f64 / total as f64 * 100.0)
}

/// Mount with the longest mount point that is an ancestor of `path`
fn containing_mount<'a>(
    mounts: &'a [(PathBuf, u64, u64)],
    path: &Path,
) -> Option<&'a (PathBuf, u64, u64)> {
    mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
}

/// Name of a kernel TCP state code as used in `/proc/net/tcp`
fn tcp_state_name(code: &str) -> Option<&'static str> {
    let name = match code.to_ascii_uppercase().as_str() {
        "01" => "established",
        "02" => "syn_sent",
        "03" => "syn_recv",
        "04" => "fin_wait1",
        "05" => "fin_wait2",
        "06" => "time_wait",
        "07" => "close",
        "08" => "close_wait",
        "09" => "last_ack",
        "0A" => "listen",
        "0B" => "closing",
        _ => return None,
    };
    Some(name)
}

/// Count connections per state in one `/proc/net/tcp` style table
pub fn parse_tcp_table(content: &str, counts: &mut BTreeMap<&'static str, u64>) {
    for line in content.lines().skip(1) {
        let Some(code) = line.split_whitespace().nth(3) else {
            continue;
        };
        if let Some(name) = tcp_state_name(code) {
            *counts.entry(name).or_insert(0) += 1;
        }
    }
}

/// `tcp_<state>` observations from the kernel tables; empty when `/proc` is unavailable
pub fn tcp_observations() -> Vec<Observation> {
    let mut counts = BTreeMap::new();
    let mut found = false;
    for table in PROC_TCP_TABLES {
        if let Ok(content) = fs::read_to_string(table) {
            parse_tcp_table(&content, &mut counts);
            found = true;
        }
    }
    if !found {
        debug!("TCP state tables unavailable, skipping connection counts");
    }
    counts
        .into_iter()
        .map(|(state, count)| {
            Observation::new(
                format!("{}{}", metrics::TCP_PREFIX, state),
                count as f64,
                SYSTEM_SOURCE,
            )
        })
        .collect()
}
