//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Keys the gateway uses to log in to target hosts. The first one is
    /// generated when none exist.
    pub client_key_paths: Vec<PathBuf>,

    /// Docker image for sandboxes
    pub sandbox_image: String,

    /// Host directory holding sandbox homes and the shared directory
    pub sandbox_dir: PathBuf,

    /// Gateway address as seen from inside sandboxes
    pub sandbox_egress: String,

    /// Sandbox resource limits
    #[serde(default)]
    pub sandbox_resources: SandboxResourcesConfig,

    /// Path to the state file (users, keys, nodes, grants, sessions)
    pub state_file: PathBuf,

    /// Root directory of session replays
    pub replay_dir: PathBuf,

    /// Reserved grant user that authorizes port forwarding
    pub tunnel_user: String,

    /// Login used on target hosts
    pub target_user: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("bastion");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            client_key_paths: vec![data_dir.join("client_key")],
            sandbox_image: "bastion-sandbox".to_string(),
            sandbox_dir: data_dir.join("sandboxes"),
            sandbox_egress: "172.17.0.1".to_string(),
            sandbox_resources: SandboxResourcesConfig::default(),
            state_file: data_dir.join("state.json"),
            replay_dir: data_dir.join("replays"),
            tunnel_user: "__tunnel__".to_string(),
            target_user: "root".to_string(),
        }
    }
}

/// Sandbox resource limits. Unset means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxResourcesConfig {
    /// Memory limit (e.g., "2g")
    pub memory_limit: Option<String>,

    /// CPU quota (e.g., "1.5" for 1.5 CPUs)
    pub cpu_limit: Option<f64>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.sandbox_dir)
            .with_context(|| format!("Failed to create sandbox directory: {}", self.sandbox_dir.display()))?;

        std::fs::create_dir_all(&self.replay_dir)
            .with_context(|| format!("Failed to create replay directory: {}", self.replay_dir.display()))?;

        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create host key directory: {}", parent.display()))?;
        }

        Ok(())
    }

    pub fn listen_socket(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))
    }

    pub fn egress_ip(&self) -> Result<IpAddr> {
        self.sandbox_egress
            .parse()
            .with_context(|| format!("Invalid sandbox egress address: {}", self.sandbox_egress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_socket().unwrap().port(), 2222);
        assert_eq!(config.egress_ip().unwrap().to_string(), "172.17.0.1");
        assert_eq!(config.tunnel_user, "__tunnel__");
        assert_eq!(config.target_user, "root");
        assert_eq!(config.client_key_paths.len(), 1);
        assert!(config.sandbox_resources.memory_limit.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:2200"
            sandbox_egress = "10.1.0.1"

            [sandbox_resources]
            memory_limit = "1g"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:2200");
        assert_eq!(config.sandbox_egress, "10.1.0.1");
        assert_eq!(config.sandbox_resources.memory_limit.as_deref(), Some("1g"));
        assert_eq!(config.sandbox_image, "bastion-sandbox");
    }

    #[test]
    fn test_invalid_addresses() {
        let config = GatewayConfig {
            listen_addr: "nowhere".to_string(),
            sandbox_egress: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(config.listen_socket().is_err());
        assert!(config.egress_ip().is_err());
    }
}
