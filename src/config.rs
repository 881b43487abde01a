//! User configuration (`~/.bore/config.yaml`).
//!
//! The YAML file mirrors the struct hierarchy:
//!
//! ```yaml
//! defaults:
//!   reconnect:
//!     enabled: true
//!     initial_backoff_secs: 1
//!     max_backoff_secs: 30
//!     multiplier: 2.0
//!   keep_alive:
//!     interval_secs: 30
//! hosts:
//!   prod:
//!     hostname: prod.example.com
//!     user: deploy
//!     identity_file: ~/.ssh/id_ed25519
//! tunnels:
//!   web:
//!     kind: local
//!     local_port: 8080
//!     remote_host: 127.0.0.1
//!     remote_port: 80
//! groups:
//!   dev:
//!     description: everything for local development
//!     tunnels: [web]
//! ```
//!
//! Fields omitted in a host entry are filled in from `~/.ssh/config` at
//! connect time; explicit values here always win.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    pub hosts: HashMap<String, HostCfg>,
    pub tunnels: HashMap<String, TunnelCfg>,
    pub groups: HashMap<String, GroupCfg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub reconnect: ReconnectCfg,
    pub keep_alive: KeepAliveCfg,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            reconnect: ReconnectCfg::default(),
            keep_alive: KeepAliveCfg::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectCfg {
    pub enabled: bool,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub multiplier: f64,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_secs: 1,
            max_backoff_secs: 30,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveCfg {
    pub interval_secs: u64,
}

impl Default for KeepAliveCfg {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

/// A host entry. Every field is optional; missing values are resolved
/// against the user's SSH config and then hard defaults (port 22, alias
/// as hostname).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostCfg {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub proxy_jump: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Local,
    Remote,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Local => write!(f, "local"),
            TunnelKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelCfg {
    pub kind: TunnelKind,
    #[serde(default = "default_loopback")]
    pub local_host: String,
    pub local_port: u16,
    #[serde(default = "default_loopback")]
    pub remote_host: String,
    pub remote_port: u16,
}

fn default_loopback() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupCfg {
    #[serde(default)]
    pub description: String,
    pub tunnels: Vec<String>,
}

impl Config {
    /// Read and validate the config file. A missing file yields the
    /// built-in defaults, matching first-run behavior.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| BoreError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn tunnel(&self, name: &str) -> Option<&TunnelCfg> {
        self.tunnels.get(name)
    }

    pub fn host(&self, name: &str) -> Option<&HostCfg> {
        self.hosts.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupCfg> {
        self.groups.get(name)
    }

    pub fn group_tunnels(&self, name: &str) -> Result<Vec<String>> {
        self.groups
            .get(name)
            .map(|g| g.tunnels.clone())
            .ok_or_else(|| BoreError::UnknownGroup(name.to_string()))
    }

    /// Check the whole configuration and report every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let rc = &self.defaults.reconnect;
        if rc.multiplier <= 1.0 {
            problems.push("defaults.reconnect.multiplier: must be greater than 1.0".to_string());
        }
        if rc.max_backoff_secs < rc.initial_backoff_secs {
            problems.push(
                "defaults.reconnect.max_backoff_secs: must be >= initial_backoff_secs".to_string(),
            );
        }

        for (name, tunnel) in &self.tunnels {
            if tunnel.local_port == 0 {
                problems.push(format!(
                    "tunnels.{}.local_port: must be between 1 and 65535",
                    name
                ));
            }
            if tunnel.remote_port == 0 {
                problems.push(format!(
                    "tunnels.{}.remote_port: must be between 1 and 65535",
                    name
                ));
            }
        }

        // Two configured tunnels can never share a local port.
        let mut ports: HashMap<u16, &str> = HashMap::new();
        let mut names: Vec<&String> = self.tunnels.keys().collect();
        names.sort();
        for name in names {
            let tunnel = &self.tunnels[name.as_str()];
            if let Some(other) = ports.get(&tunnel.local_port) {
                problems.push(format!(
                    "tunnels.{}.local_port: port {} conflicts with tunnel '{}'",
                    name, tunnel.local_port, other
                ));
            } else {
                ports.insert(tunnel.local_port, name);
            }
        }

        for (name, group) in &self.groups {
            if group.tunnels.is_empty() {
                problems.push(format!(
                    "groups.{}.tunnels: must contain at least one tunnel",
                    name
                ));
            }
            for tunnel_name in &group.tunnels {
                if !self.tunnels.contains_key(tunnel_name) {
                    problems.push(format!(
                        "groups.{}.tunnels: references unknown tunnel '{}'",
                        name, tunnel_name
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BoreError::Config(problems.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(kind: TunnelKind, local_port: u16, remote_port: u16) -> TunnelCfg {
        TunnelCfg {
            kind,
            local_host: "localhost".into(),
            local_port,
            remote_host: "localhost".into(),
            remote_port,
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&tmp.path().join("config.yaml")).unwrap();
        assert!(cfg.tunnels.is_empty());
        assert!(cfg.defaults.reconnect.enabled);
        assert_eq!(cfg.defaults.keep_alive.interval_secs, 30);
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
defaults:
  reconnect:
    initial_backoff_secs: 2
    max_backoff_secs: 60
    multiplier: 1.5
hosts:
  prod:
    hostname: prod.example.com
    user: deploy
tunnels:
  web:
    kind: local
    local_port: 8080
    remote_host: 10.0.0.1
    remote_port: 80
groups:
  dev:
    description: dev stack
    tunnels: [web]
"#;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.defaults.reconnect.multiplier, 1.5);
        let web = cfg.tunnel("web").unwrap();
        assert_eq!(web.kind, TunnelKind::Local);
        assert_eq!(web.local_host, "localhost");
        assert_eq!(web.remote_host, "10.0.0.1");
        assert_eq!(cfg.group_tunnels("dev").unwrap(), vec!["web".to_string()]);
    }

    #[test]
    fn port_boundaries() {
        let mut cfg = Config::default();
        cfg.tunnels
            .insert("lo".into(), tunnel(TunnelKind::Local, 1, 65535));
        assert!(cfg.validate().is_ok());

        cfg.tunnels
            .insert("zero".into(), tunnel(TunnelKind::Local, 0, 80));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn port_above_u16_rejected_at_parse() {
        let yaml = "tunnels:\n  big:\n    kind: local\n    local_port: 65536\n    remote_port: 80\n";
        let err = serde_yaml::from_str::<Config>(yaml);
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_local_ports_rejected() {
        let mut cfg = Config::default();
        cfg.tunnels
            .insert("a".into(), tunnel(TunnelKind::Local, 7777, 80));
        cfg.tunnels
            .insert("b".into(), tunnel(TunnelKind::Remote, 7777, 81));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("7777"));
    }

    #[test]
    fn empty_group_rejected() {
        let mut cfg = Config::default();
        cfg.groups.insert(
            "empty".into(),
            GroupCfg {
                description: String::new(),
                tunnels: vec![],
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn group_with_unknown_tunnel_rejected() {
        let mut cfg = Config::default();
        cfg.groups.insert(
            "g".into(),
            GroupCfg {
                description: String::new(),
                tunnels: vec!["ghost".into()],
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn multiplier_must_exceed_one() {
        let mut cfg = Config::default();
        cfg.defaults.reconnect.multiplier = 1.0;
        assert!(cfg.validate().is_err());
    }
}
