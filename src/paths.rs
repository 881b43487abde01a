//! Filesystem layout for the daemon.
//!
//! Everything lives under `~/.bore` (mode 0700): the user config, the PID
//! file, the control socket, the daemon log and the persisted running set.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{BoreError, Result};

pub const CONFIG_FILE: &str = "config.yaml";
pub const PID_FILE: &str = "bore.pid";
pub const SOCKET_FILE: &str = "bore.sock";
pub const LOG_FILE: &str = "bore.log";
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Resolve the default base directory (`~/.bore`), creating it with
    /// owner-only permissions if it does not exist yet.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| BoreError::Config("cannot determine home directory".into()))?;
        Self::with_base(home.join(".bore"))
    }

    /// Use an explicit base directory. Tests point this at a tempdir.
    pub fn with_base(base: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base)?;
        std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }

    pub fn pid(&self) -> PathBuf {
        self.base.join(PID_FILE)
    }

    pub fn socket(&self) -> PathBuf {
        self.base.join(SOCKET_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.base.join(LOG_FILE)
    }

    pub fn state(&self) -> PathBuf {
        self.base.join(STATE_FILE)
    }
}

/// Write `data` to `path` with permissions restricted to the owning user.
pub fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_is_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("bore")).unwrap();
        let mode = std::fs::metadata(paths.base()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn private_files_are_0600() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        write_private(&path, b"{}").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
