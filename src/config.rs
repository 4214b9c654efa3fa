use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::BridgeConfig;
use crate::controller::DEFAULT_SETTLE_DELAY;
use crate::session::SessionRegistry;
use crate::target::ConnectionTarget;
use crate::transport::DeliveryMode;

/// Client config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub targets: Vec<ConnectionTarget>,
    /// User scripts, in addition to the built-in ones.
    #[serde(default)]
    pub scripts: Vec<Script>,
}

/// Session engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll-mode read interval.
    pub poll_interval_ms: u64,
    /// Wait between connecting and sending a session's initial command.
    pub settle_delay_ms: u64,
    /// Upper bound on open sessions. 0 disables the limit.
    pub max_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: BridgeConfig::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn max_sessions(&self) -> Option<usize> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            poll_interval: self.poll_interval(),
        }
    }
}

/// How the PTY transport reaches remote hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub delivery: DeliveryMode,
    /// Remote-shell client program.
    pub program: String,
    /// Extra arguments placed before the destination, e.g. `-o` options.
    pub extra_args: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Push,
            program: "ssh".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// A named snippet that can be fanned out to many targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

impl Script {
    fn builtin(name: &str, description: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            content: content.to_string(),
        }
    }
}

/// Scripts every installation has.
pub fn builtin_scripts() -> Vec<Script> {
    vec![
        Script::builtin(
            "System Info",
            "Uptime, memory and disk usage",
            r#"echo "--- System Info ---"; uptime; echo ""; echo "--- Memory ---"; free -h; echo ""; echo "--- Disk Usage ---"; df -h"#,
        ),
        Script::builtin(
            "Docker Stats",
            "Running containers",
            r#"docker ps --format "table {{.ID}}\t{{.Image}}\t{{.Status}}\t{{.Names}}""#,
        ),
        Script::builtin("OS Release", "Distribution details", "cat /etc/os-release"),
    ]
}

/// Built-in scripts followed by the user's. A user script with the same
/// name as a built-in one replaces it.
#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    scripts: Vec<Script>,
}

impl ScriptLibrary {
    pub fn new(user: &[Script]) -> Self {
        let mut scripts: Vec<Script> = builtin_scripts()
            .into_iter()
            .filter(|b| !user.iter().any(|u| u.name.eq_ignore_ascii_case(&b.name)))
            .collect();
        scripts.extend(user.iter().cloned());
        Self { scripts }
    }

    /// Case-insensitive lookup by name.
    pub fn get(&self, name: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        self.scripts.iter()
    }
}

impl ClientConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path. On Unix the file is created 0600.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(())
    }

    pub fn scripts(&self) -> ScriptLibrary {
        ScriptLibrary::new(&self.scripts)
    }
}

/// `$XDG_CONFIG_HOME/shellmux/config.toml`, or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("shellmux").join("config.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write config {}: {1}", .0.display())]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

/// Warn if a config file is world-readable; it may hold passwords.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); it may contain passwords, \
             consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Whether `mode` has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
