//! Point-in-time system resource reads.

use crate::model::ResourceSnapshot;
use procfs::{Current, LoadAverage, Meminfo};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read {what}")]
    Proc {
        what: &'static str,
        #[source]
        source: procfs::ProcError,
    },
    #[error("statvfs({}) failed", path.display())]
    Statvfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait SystemProbe: Send + Sync {
    /// Free memory in MB, optionally counting page cache as free.
    fn free_memory_mb(&self, include_cached: bool) -> Result<i64, ProbeError>;
    /// One-minute load average.
    fn load_average(&self) -> Result<f64, ProbeError>;
    /// Free disk space in MB on the probed mount point.
    fn free_disk_mb(&self) -> Result<i64, ProbeError>;

    fn snapshot(&self) -> Result<ResourceSnapshot, ProbeError> {
        Ok(ResourceSnapshot {
            free_mem_mb: self.free_memory_mb(false)?,
            load: self.load_average()?,
            free_disk_mb: self.free_disk_mb()?,
        })
    }
}

/// Reads `/proc` and `statvfs(3)` on the local host.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    mount_point: PathBuf,
}

impl ProcProbe {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SystemProbe for ProcProbe {
    fn free_memory_mb(&self, include_cached: bool) -> Result<i64, ProbeError> {
        let meminfo = Meminfo::current().map_err(|source| ProbeError::Proc {
            what: "/proc/meminfo",
            source,
        })?;
        let mut free = meminfo.mem_free;
        if include_cached {
            free += meminfo.cached;
        }
        Ok((free / MIB) as i64)
    }

    fn load_average(&self) -> Result<f64, ProbeError> {
        let load = LoadAverage::current().map_err(|source| ProbeError::Proc {
            what: "/proc/loadavg",
            source,
        })?;
        Ok(f64::from(load.one))
    }

    fn free_disk_mb(&self) -> Result<i64, ProbeError> {
        available_bytes(&self.mount_point)
            .map(|b| (b / MIB) as i64)
            .map_err(|source| ProbeError::Statvfs {
                path: self.mount_point.clone(),
                source,
            })
    }
}

/// Bytes available to unprivileged users, as `df` reports under "Avail".
fn available_bytes(path: &Path) -> std::io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so the struct is initialised.
    let stat = unsafe { stat.assume_init() };
    let avail = stat.f_bavail as u64 * stat.f_frsize as u64;
    Ok(avail)
}
