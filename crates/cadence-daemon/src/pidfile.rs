use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

/// Pid file that lives as long as the daemon; removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &str) -> anyhow::Result<Self> {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let pid = std::process::id();
        std::fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("writing pid file {}", path.display()))?;
        info!(path = %path.display(), pid, "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/cadenced.pid");

        let pid = PidFile::create(path.to_str().unwrap()).unwrap();
        let contents = std::fs::read_to_string(pid.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pid);
        assert!(!path.exists());
    }
}
