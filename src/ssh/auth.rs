//! Non-interactive SSH authentication.
//!
//! Methods are tried in priority order: the SSH agent, then the
//! configured identity file, then the usual default key locations. The
//! daemon never prompts; an encrypted key without an agent is skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::load_secret_key;
use tracing::{debug, info};

use crate::error::{BoreError, Result};

use super::handler::ClientHandler;

pub async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    identity_file: Option<&Path>,
) -> Result<()> {
    if let Ok(true) = try_agent_auth(handle, user).await {
        info!(user = %user, "authenticated via SSH agent");
        return Ok(());
    }

    for key_path in candidate_keys(identity_file) {
        if !key_path.exists() {
            continue;
        }
        debug!(key = %key_path.display(), "trying identity file");
        match try_key_auth(handle, user, &key_path).await {
            Ok(true) => {
                info!(user = %user, key = %key_path.display(), "authenticated via key");
                return Ok(());
            }
            Ok(false) => debug!(key = %key_path.display(), "key refused"),
            Err(e) => debug!(key = %key_path.display(), error = %e, "key unusable"),
        }
    }

    Err(BoreError::AuthUnavailable(
        "SSH agent and key authentication both failed".to_string(),
    ))
}

fn candidate_keys(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut keys = Vec::new();
    if let Some(path) = explicit {
        keys.push(path.to_path_buf());
    }
    if let Some(home) = dirs::home_dir() {
        let ssh_dir = home.join(".ssh");
        keys.push(ssh_dir.join("id_ed25519"));
        keys.push(ssh_dir.join("id_rsa"));
        keys.push(ssh_dir.join("id_ecdsa"));
    }
    keys
}

async fn try_agent_auth(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
    if std::env::var("SSH_AUTH_SOCK").is_err() {
        return Ok(false);
    }

    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| BoreError::AuthUnavailable(format!("failed to connect to agent: {}", e)))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| BoreError::AuthUnavailable(format!("failed to list agent identities: {}", e)))?;

    for identity in identities {
        // AgentClient is not Clone; each attempt gets a fresh connection.
        let mut agent_for_auth = russh::keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| BoreError::AuthUnavailable(format!("failed to connect to agent: {}", e)))?;

        match handle
            .authenticate_publickey_with(user, identity, None, &mut agent_for_auth)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            _ => continue,
        }
    }

    Ok(false)
}

async fn try_key_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key_path: &Path,
) -> Result<bool> {
    let key = load_secret_key(key_path, None).map_err(|e| {
        BoreError::AuthUnavailable(format!("failed to load key {}: {}", key_path.display(), e))
    })?;
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

    let result = handle
        .authenticate_publickey(user, key_with_alg)
        .await
        .map_err(|e| BoreError::AuthUnavailable(e.to_string()))?;

    Ok(result.success())
}
