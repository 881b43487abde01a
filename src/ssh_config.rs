//! Host resolution against the user's `~/.ssh/config`.
//!
//! A host alias is resolved by merging the bore config entry (if any) with
//! whatever the SSH config knows about the alias. Explicit bore fields win;
//! whatever is still missing falls back to hard defaults (port 22, the
//! alias itself as the hostname).

use std::io::{BufReader, Cursor};
use std::path::PathBuf;

use ssh2_config::{HostParams, ParseRule, SshConfig};
use tracing::debug;

use crate::config::HostCfg;

/// Fully resolved connection parameters for one host alias.
#[derive(Debug, Clone)]
pub struct ResolvedHost {
    pub alias: String,
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub proxy_jump: Option<String>,
}

/// Reader over the user's SSH config. Absence of the file is not an error;
/// queries then return nothing and defaults apply.
pub struct SshConfigReader {
    cfg: Option<SshConfig>,
}

impl SshConfigReader {
    pub fn new() -> Self {
        let Some(home) = dirs::home_dir() else {
            return Self { cfg: None };
        };
        Self::from_path(home.join(".ssh").join("config"))
    }

    pub fn from_path(path: PathBuf) -> Self {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self { cfg: None },
        };

        let mut reader = BufReader::new(Cursor::new(content));
        match SshConfig::default().parse(&mut reader, ParseRule::ALLOW_UNKNOWN_FIELDS) {
            Ok(cfg) => Self { cfg: Some(cfg) },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to parse SSH config, ignoring it");
                Self { cfg: None }
            }
        }
    }

    fn query(&self, alias: &str) -> Option<HostParams> {
        self.cfg.as_ref().map(|cfg| cfg.query(alias))
    }
}

impl Default for SshConfigReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a bore host entry with the SSH config for `alias`.
pub fn resolve_host(alias: &str, entry: Option<&HostCfg>, reader: &SshConfigReader) -> ResolvedHost {
    let entry = entry.cloned().unwrap_or_default();
    let params = reader.query(alias);

    let hostname = entry
        .hostname
        .or_else(|| params.as_ref().and_then(|p| p.host_name.clone()))
        .unwrap_or_else(|| alias.to_string());

    let user = entry
        .user
        .or_else(|| params.as_ref().and_then(|p| p.user.clone()))
        .unwrap_or_else(whoami::username);

    let port = entry
        .port
        .or_else(|| params.as_ref().and_then(|p| p.port))
        .unwrap_or(22);

    let identity_file = entry
        .identity_file
        .map(|path| PathBuf::from(shellexpand::tilde(&path).to_string()))
        .or_else(|| {
            params
                .as_ref()
                .and_then(|p| p.identity_file.as_ref())
                .and_then(|files| files.first().cloned())
        });

    // ssh2-config has no first-class ProxyJump field; it lands in the
    // ignored-fields bag under its lowercased name.
    let proxy_jump = entry.proxy_jump.or_else(|| {
        params.as_ref().and_then(|p| {
            p.ignored_fields
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("proxyjump"))
                .and_then(|(_, values)| values.first().cloned())
        })
    });

    ResolvedHost {
        alias: alias.to_string(),
        hostname,
        user,
        port,
        identity_file,
        proxy_jump,
    }
}

/// Resolve a proxy-jump alias. Identical to [`resolve_host`], except a
/// missing user inherits the outer connection's user instead of the
/// local account name.
pub fn resolve_proxy_host(
    alias: &str,
    reader: &SshConfigReader,
    outer_user: &str,
) -> ResolvedHost {
    let mut resolved = resolve_host(alias, None, reader);
    let from_ssh_config = reader
        .query(alias)
        .and_then(|p| p.user)
        .is_some();
    if !from_ssh_config {
        resolved.user = outer_user.to_string();
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_from(content: &str) -> SshConfigReader {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config");
        std::fs::write(&path, content).unwrap();
        SshConfigReader::from_path(path)
    }

    #[test]
    fn explicit_fields_win_over_ssh_config() {
        let reader = reader_from("Host prod\n  HostName ssh-config.example.com\n  Port 2200\n");
        let entry = HostCfg {
            hostname: Some("explicit.example.com".into()),
            user: Some("deploy".into()),
            port: None,
            identity_file: None,
            proxy_jump: None,
        };

        let resolved = resolve_host("prod", Some(&entry), &reader);
        assert_eq!(resolved.hostname, "explicit.example.com");
        assert_eq!(resolved.user, "deploy");
        assert_eq!(resolved.port, 2200);
    }

    #[test]
    fn missing_everything_falls_back_to_defaults() {
        let reader = reader_from("");
        let resolved = resolve_host("somewhere", None, &reader);
        assert_eq!(resolved.hostname, "somewhere");
        assert_eq!(resolved.port, 22);
        assert!(resolved.proxy_jump.is_none());
    }

    #[test]
    fn no_ssh_config_file_is_fine() {
        let reader = SshConfigReader::from_path(PathBuf::from("/nonexistent/ssh/config"));
        let resolved = resolve_host("host", None, &reader);
        assert_eq!(resolved.hostname, "host");
    }

    #[test]
    fn tilde_in_identity_file_is_expanded() {
        let reader = reader_from("");
        let entry = HostCfg {
            identity_file: Some("~/.ssh/id_ed25519".into()),
            ..Default::default()
        };
        let resolved = resolve_host("h", Some(&entry), &reader);
        let identity = resolved.identity_file.unwrap();
        assert!(!identity.to_string_lossy().starts_with('~'));
    }
}
