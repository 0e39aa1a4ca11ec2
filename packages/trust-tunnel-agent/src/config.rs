//! Agent configuration, loaded from a TOML file at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("error parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Container runtime the agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Containerd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub session_config: SessionConfig,
    pub container_config: ContainerConfig,
    pub sidecar_config: SidecarConfig,
    pub auth_config: AuthConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5006,
            session_config: SessionConfig::default(),
            container_config: ContainerConfig::default(),
            sidecar_config: SidecarConfig::default(),
            auth_config: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How physical-host sessions tunnel: "nsenter" or "sshd".
    pub phys_tunnel: String,
    /// Seconds a stale session is held for reclaim after an abnormal client
    /// disconnect.
    pub delay_release_session_timeout_secs: u64,
}

impl SessionConfig {
    pub fn delay_release_timeout(&self) -> Duration {
        Duration::from_secs(self.delay_release_session_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            phys_tunnel: "nsenter".to_string(),
            delay_release_session_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Runtime API endpoint, e.g. `unix:///var/run/docker.sock`.
    pub endpoint: String,
    /// Docker API version pin for daemon compatibility.
    pub docker_api_version: String,
    /// Prefix under which the target root filesystem is mounted.
    pub rootfs_prefix: String,
    pub container_runtime: ContainerRuntime,
    /// containerd namespace used when loading containers.
    pub namespace: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            docker_api_version: "1.41".to_string(),
            rootfs_prefix: String::new(),
            container_runtime: ContainerRuntime::Docker,
            namespace: "k8s.io".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub image: String,
    /// Registry credential string passed through to image pulls.
    pub image_hub_auth: String,
    /// Maximum number of concurrently live sidecar containers.
    pub limit: usize,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            image_hub_auth: String::new(),
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Registered auth plugin name; empty admits every request.
    pub name: String,
    pub params: HashMap<String, String>,
}

/// Loads the agent configuration from `path`.
pub fn load(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
            host = "127.0.0.1"
            port = 5007

            [session_config]
            phys_tunnel = "sshd"
            delay_release_session_timeout_secs = 60

            [container_config]
            endpoint = "unix:///run/containerd/containerd.sock"
            container_runtime = "containerd"
            namespace = "moby"
            rootfs_prefix = "/rootfs"

            [sidecar_config]
            image = "trust-tunnel-sidecar:v2"
            limit = 3

            [auth_config]
            name = "example"
            [auth_config.params]
            users = "alice,bob"
        "#;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5007);
        assert_eq!(config.session_config.phys_tunnel, "sshd");
        assert_eq!(
            config.session_config.delay_release_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.container_config.container_runtime,
            ContainerRuntime::Containerd
        );
        assert_eq!(config.sidecar_config.limit, 3);
        assert_eq!(config.auth_config.name, "example");
        assert_eq!(
            config.auth_config.params.get("users").map(String::as_str),
            Some("alice,bob")
        );
    }

    #[test]
    fn empty_config_gets_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.port, 5006);
        assert_eq!(config.session_config.phys_tunnel, "nsenter");
        assert_eq!(config.container_config.container_runtime, ContainerRuntime::Docker);
        assert!(config.auth_config.name.is_empty());
    }

    #[test]
    fn missing_file_errors() {
        assert!(matches!(
            load("/no/such/config.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
