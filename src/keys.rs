//! SSH key material and login-name helpers.
//!
//! This module handles:
//! - Loading (or generating) the gateway's host key and client keys
//! - Computing key fingerprints for directory lookups
//! - Parsing `user@host` login names and target addresses

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::{PrivateKey, PublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

/// Parse an OpenSSH public key line into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... root@alice.sandbox"
pub fn parse_ssh_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// SHA256 fingerprint of an OpenSSH public key line, as printed by `ssh-keygen -l`.
pub fn fingerprint_from_openssh(public_key: &str) -> Result<String> {
    let (_, key_data) = parse_ssh_key(public_key)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;
    Ok(fingerprint_from_bytes(&decoded))
}

/// SSH fingerprint = SHA256 over the key in wire format, unpadded base64.
pub fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    fingerprint_from_bytes(&key.public_key_bytes())
}

/// Render a public key as an `authorized_keys` line.
pub fn public_key_to_openssh(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    format!("{} {}", key.algorithm().as_str(), key.public_key_base64())
}

/// Split a login name of the form `user@hostname`.
///
/// Anything other than exactly two non-empty parts is not a target login.
pub fn parse_target_login(login: &str) -> Option<(String, String)> {
    let mut parts = login.split('@');
    let user = parts.next()?;
    let hostname = parts.next()?;
    if parts.next().is_some() || user.is_empty() || hostname.is_empty() {
        return None;
    }
    Some((user.to_string(), hostname.to_string()))
}

/// Append the default SSH port when `address` carries none.
///
/// IPv6 literals come back bracketed (`[::1]:22`), bare or bracketed.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return addr.to_string();
    }
    let bare = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, 22).to_string();
    }
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:22", address)
    }
}

/// Load a private key from file or generate a new Ed25519 one.
pub async fn load_or_generate_key(path: &Path, what: &str) -> Result<PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading {} from {}", what, path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load {} from {}", what, path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 {}", what);
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .with_context(|| format!("Failed to generate {}", what))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let key_bytes = key
        .to_openssh(LineEnding::LF)
        .with_context(|| format!("Failed to encode {}", what))?;
    tokio::fs::write(path, key_bytes.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    info!("Saved {} to {}", what, path.display());
    Ok(key)
}

/// Load every configured client key. When none of them exist yet the first
/// path gets a freshly generated key; missing extra paths are an error.
pub async fn load_client_keys(paths: &[PathBuf]) -> Result<Vec<Arc<PrivateKey>>> {
    let first = paths
        .first()
        .ok_or_else(|| anyhow!("At least one client key path is required"))?;

    if !paths.iter().any(|p| p.exists()) {
        let key = load_or_generate_key(first, "client key").await?;
        return Ok(vec![Arc::new(key)]);
    }

    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load client key from {}", path.display()))?;
        keys.push(Arc::new(key));
    }
    Ok(keys)
}
