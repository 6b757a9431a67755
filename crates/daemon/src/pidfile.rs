// Shadowlink - PID File Management

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Guards against a second daemon instance. The file holds the live
/// process id and is removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match raw.trim().parse::<i32>() {
                Ok(pid) if process_alive(pid) => {
                    bail!("another daemon is already running with PID {pid}");
                }
                Ok(pid) => {
                    warn!(pid, path = %path.display(), "removing stale PID file");
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
                Err(_) => {
                    warn!(path = %path.display(), "removing unreadable PID file");
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
        }

        let pid = std::process::id();
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(pid, path = %path.display(), "PID file acquired");
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(%err, path = %self.path.display(), "failed to remove PID file");
        }
    }
}

/// Signal 0 probes for existence without touching the process. EPERM
/// still means the PID is alive, just owned by someone else.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
