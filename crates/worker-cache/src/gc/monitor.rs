use std::io;
use std::path::Path;

use parking_lot::Mutex;
use sysinfo::{Disks, System};

/// Samples free system resources for the [`GarbageCollector`](super::GarbageCollector).
pub trait SystemMonitor: Send + Sync {
    /// Free bytes on the file system containing `path`.
    fn free_disk_space(&self, path: &Path) -> io::Result<u64>;

    /// Available memory in bytes.
    fn available_memory(&self) -> u64;
}

/// A [`SystemMonitor`] backed by `sysinfo`.
pub struct SysinfoMonitor {
    system: Mutex<System>,
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SysinfoMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMonitor").finish_non_exhaustive()
    }
}

impl SystemMonitor for SysinfoMonitor {
    fn free_disk_space(&self, path: &Path) -> io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();

        // The file system holding `path` is the one with the longest matching mount point.
        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no file system found for {}", path.display()),
                )
            })
    }

    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}
