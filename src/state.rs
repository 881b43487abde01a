//! Persisted running set (`~/.bore/state.json`).
//!
//! The file records which tunnels and groups the user intends to be
//! running and the host each was started against, so the daemon can
//! restore them after a restart. It is rewritten synchronously on every
//! intent-changing control request.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{BoreError, Result};
use crate::paths::write_private;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEntry {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StateFile {
    start_time_unix: u64,
    tunnels: Vec<TunnelEntry>,
    groups: Vec<GroupEntry>,
}

pub struct StateStore {
    path: PathBuf,
    started_at: Instant,
    inner: RwLock<StateFile>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        let start_time_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            path,
            started_at: Instant::now(),
            inner: RwLock::new(StateFile {
                start_time_unix,
                tunnels: Vec::new(),
                groups: Vec::new(),
            }),
        }
    }

    /// Read the running set from disk. A missing file is not an error.
    /// The in-memory start time always reflects this process, never what
    /// was read.
    pub fn load(&self) -> Result<()> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&data)?;
        if looks_like_legacy(&value) {
            return Err(BoreError::State(format!(
                "{} uses the obsolete format without per-tunnel hosts; remove it and re-enable your tunnels",
                self.path.display()
            )));
        }

        let parsed: StateFile = serde_json::from_value(value)?;
        let mut inner = self.inner.write().unwrap();
        inner.tunnels = parsed.tunnels;
        inner.groups = parsed.groups;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let data = serde_json::to_string_pretty(&*inner)?;
        write_private(&self.path, data.as_bytes())?;
        Ok(())
    }

    pub fn add_tunnel(&self, name: &str, host: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.tunnels.retain(|t| t.name != name);
        inner.tunnels.push(TunnelEntry {
            name: name.to_string(),
            host: host.to_string(),
        });
    }

    pub fn remove_tunnel(&self, name: &str) {
        self.inner.write().unwrap().tunnels.retain(|t| t.name != name);
    }

    pub fn add_group(&self, name: &str, host: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.groups.retain(|g| g.name != name);
        inner.groups.push(GroupEntry {
            name: name.to_string(),
            host: host.to_string(),
        });
    }

    pub fn remove_group(&self, name: &str) {
        self.inner.write().unwrap().groups.retain(|g| g.name != name);
    }

    pub fn tunnels(&self) -> Vec<TunnelEntry> {
        self.inner.read().unwrap().tunnels.clone()
    }

    pub fn groups(&self) -> Vec<GroupEntry> {
        self.inner.read().unwrap().groups.clone()
    }

    pub fn contains_tunnel(&self, name: &str) -> bool {
        self.inner.read().unwrap().tunnels.iter().any(|t| t.name == name)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.tunnels.clear();
        inner.groups.clear();
    }

    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// The pre-host format stored tunnels and groups as bare name arrays.
fn looks_like_legacy(value: &serde_json::Value) -> bool {
    let legacy_array = |v: Option<&serde_json::Value>| {
        v.and_then(|v| v.as_array())
            .map(|a| a.iter().any(|e| e.is_string()))
            .unwrap_or(false)
    };
    legacy_array(value.get("active_tunnels"))
        || legacy_array(value.get("active_groups"))
        || legacy_array(value.get("tunnels"))
        || legacy_array(value.get("groups"))
}
