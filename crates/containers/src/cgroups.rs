//! Resource-limit documents for `--apply-cgroups`.

use std::path::{Path, PathBuf};

use {labrun_config::ResourceLimitsConfig, serde::Serialize, tracing::warn};

/// Limits applied to one script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
    pub pids_max: u64,
}

impl From<&ResourceLimitsConfig> for ResourceLimits {
    fn from(cfg: &ResourceLimitsConfig) -> Self {
        Self {
            cpu_shares: cfg.cpu_shares,
            memory_bytes: cfg.memory_mb.saturating_mul(1024 * 1024),
            pids_max: cfg.pids_max,
        }
    }
}

#[derive(Serialize)]
struct CgroupDocument {
    cpu: CpuSection,
    memory: MemorySection,
    pids: PidsSection,
}

#[derive(Serialize)]
struct CpuSection {
    shares: u64,
}

#[derive(Serialize)]
struct MemorySection {
    limit: u64,
    swap: u64,
}

#[derive(Serialize)]
struct PidsSection {
    limit: u64,
}

impl ResourceLimits {
    /// Render the TOML document the container runtime reads.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(&CgroupDocument {
            cpu: CpuSection {
                shares: self.cpu_shares,
            },
            memory: MemorySection {
                limit: self.memory_bytes,
                swap: self.memory_bytes,
            },
            pids: PidsSection {
                limit: self.pids_max,
            },
        })
    }

    /// Write a uniquely named limits file under `dir`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<CgroupFile> {
        let body = self.to_toml().map_err(std::io::Error::other)?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("limits-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, body)?;
        Ok(CgroupFile { path })
    }
}

/// A limits file on disk, removed when dropped.
#[derive(Debug)]
pub struct CgroupFile {
    path: PathBuf,
}

impl CgroupFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CgroupFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove cgroup file");
        }
    }
}
