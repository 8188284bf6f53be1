//! Where resource readings come from.

use std::path::{Path, PathBuf};

use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::{Error, Result};

/// Raw system reading before it is turned into [`super::ResourceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub cpu_percent: f64,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
}

/// Produces system readings for the resource monitor.
pub trait MetricsSource: Send {
    fn snapshot(&mut self) -> Result<SystemSnapshot>;
}

/// Reads the host through `sysinfo`.
pub struct SystemMetricsSource {
    system: System,
    disks: Disks,
    disk_path: PathBuf,
}

impl SystemMetricsSource {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            ),
            disks: Disks::new_with_refreshed_list(),
            disk_path: disk_path.into(),
        }
    }

    /// Disk holding `path`, picked by longest matching mount point.
    fn disk_space_for(&self, path: &Path) -> Option<(u64, u64)> {
        let path_str = path.to_string_lossy();
        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

        for disk in self.disks.list() {
            let mount_point = disk.mount_point().to_string_lossy();
            if path_str.starts_with(mount_point.as_ref()) {
                let mount_len = mount_point.len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }

        best_match.map(|(disk, _)| (disk.total_space(), disk.available_space()))
    }
}

impl MetricsSource for SystemMetricsSource {
    fn snapshot(&mut self) -> Result<SystemSnapshot> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks = Disks::new_with_refreshed_list();

        let memory_total_bytes = self.system.total_memory();
        if memory_total_bytes == 0 {
            return Err(Error::Other("total memory reported as zero".to_string()));
        }

        let absolute = std::fs::canonicalize(&self.disk_path)?;
        let (disk_total_bytes, disk_available_bytes) =
            self.disk_space_for(&absolute).ok_or_else(|| {
                Error::not_found("disk", absolute.display().to_string())
            })?;

        Ok(SystemSnapshot {
            memory_total_bytes,
            memory_used_bytes: self.system.used_memory(),
            memory_available_bytes: self.system.available_memory(),
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            disk_total_bytes,
            disk_available_bytes,
        })
    }
}
