//! Daemon configuration: TOML file with environment overrides.
//!
//! Resolution order for every path-like setting is env var, then config
//! file, then the built-in default under the user data directory.

use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardError};

pub const ENV_SOCKET: &str = "NODEWARD_SOCKET";
pub const ENV_SDK_SOCKET: &str = "NODEWARD_SDK_SOCKET";
pub const ENV_PLUGIN_DIR: &str = "NODEWARD_PLUGIN_DIR";
pub const ENV_LOG: &str = "NODEWARD_LOG";

const NODEWARD_SUBDIR: &str = "nodeward";
const DEFAULT_TICK_MS: u64 = 10;
const DEFAULT_SDK_GROUP: &str = "nodeward";

/// Nodeward data directory (~/.local/share/nodeward)
pub fn data_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join(NODEWARD_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Plugins directory ($NODEWARD_PLUGIN_DIR or ~/.local/share/nodeward/plugins)
pub fn plugin_dir() -> PathBuf {
    env::var(ENV_PLUGIN_DIR)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("plugins"))
}

/// Command socket path ($NODEWARD_SOCKET or ~/.local/share/nodeward/ward.sock)
pub fn command_socket_path() -> PathBuf {
    env::var(ENV_SOCKET)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("ward.sock"))
}

/// SDK socket path ($NODEWARD_SDK_SOCKET or ~/.local/share/nodeward/ward-sdk.sock)
pub fn sdk_socket_path() -> PathBuf {
    env::var(ENV_SDK_SOCKET)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("ward-sdk.sock"))
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_sdk_group() -> String {
    DEFAULT_SDK_GROUP.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Command socket path, mode 0600.
    pub socket: Option<PathBuf>,
    /// SDK socket path, mode 0660 with `sdk_group`.
    pub sdk_socket: Option<PathBuf>,
    /// Directory scanned for `.so` plugins at startup.
    pub plugin_dir: Option<PathBuf>,
    /// Group granted access to the SDK socket.
    #[serde(default = "default_sdk_group")]
    pub sdk_group: String,
    /// Scheduler tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Instances enabled right after startup, with optional `name=param`.
    #[serde(default)]
    pub enable_list: Vec<String>,
    /// Log filter applied when $NODEWARD_LOG is unset.
    pub log_level: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            sdk_socket: None,
            plugin_dir: None,
            sdk_group: default_sdk_group(),
            tick_ms: default_tick_ms(),
            enable_list: Vec::new(),
            log_level: None,
        }
    }
}

impl DaemonConfig {
    /// $NODEWARD config path: ~/.config/nodeward/nodewardd.toml
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(NODEWARD_SUBDIR)
            .join("nodewardd.toml")
    }

    /// Loads a config file, falling back to defaults when it does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            WardError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;

        if config.tick_ms == 0 {
            return Err(WardError::Config("tick_ms must be positive".to_string()));
        }

        tracing::trace!(tick_ms = config.tick_ms, enable_list = ?config.enable_list, "Daemon config loaded");
        Ok(config)
    }

    /// Command socket path with env override applied.
    pub fn command_socket(&self) -> PathBuf {
        env::var(ENV_SOCKET)
            .ok()
            .map(PathBuf::from)
            .or_else(|| self.socket.clone())
            .unwrap_or_else(|| data_dir().join("ward.sock"))
    }

    /// SDK socket path with env override applied.
    pub fn sdk_socket(&self) -> PathBuf {
        env::var(ENV_SDK_SOCKET)
            .ok()
            .map(PathBuf::from)
            .or_else(|| self.sdk_socket.clone())
            .unwrap_or_else(|| data_dir().join("ward-sdk.sock"))
    }

    /// Plugin directory with env override applied.
    pub fn plugin_dir(&self) -> PathBuf {
        env::var(ENV_PLUGIN_DIR)
            .ok()
            .map(PathBuf::from)
            .or_else(|| self.plugin_dir.clone())
            .unwrap_or_else(|| data_dir().join("plugins"))
    }

    /// Splits an `enable_list` entry into `(instance, param)`.
    pub fn parse_enable_entry(entry: &str) -> (&str, &str) {
        match entry.split_once('=') {
            Some((name, param)) => (name.trim(), param),
            None => (entry.trim(), ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.tick_ms, DEFAULT_TICK_MS);
        assert_eq!(config.sdk_group, DEFAULT_SDK_GROUP);
        assert!(config.enable_list.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodewardd.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
socket = "/run/nodeward/ward.sock"
sdk_socket = "/run/nodeward/ward-sdk.sock"
plugin_dir = "/opt/nodeward/plugins"
sdk_group = "telemetry"
tick_ms = 25
enable_list = ["cpu_stat", "hotspot_scan=interval:5"]
log_level = "debug"
"#
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.tick_ms, 25);
        assert_eq!(config.sdk_group, "telemetry");
        assert_eq!(config.enable_list.len(), 2);
        assert_eq!(
            config.plugin_dir.as_deref(),
            Some(std::path::Path::new("/opt/nodeward/plugins"))
        );
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_zero_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodewardd.toml");
        std::fs::write(&path, "tick_ms = 0\n").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(WardError::Config(_))
        ));
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodewardd.toml");
        std::fs::write(&path, "tick_ms = [this is not toml").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(WardError::Config(_))
        ));
    }

    // All three override vars are set and cleared in this one test so it
    // cannot race another env-reading test in the binary.
    #[test]
    fn env_overrides_beat_config_file_and_defaults() {
        let mut config = DaemonConfig::default();
        config.socket = Some(PathBuf::from("/from/file/ward.sock"));
        config.sdk_socket = Some(PathBuf::from("/from/file/ward-sdk.sock"));
        // plugin_dir stays unset so the override is checked against the
        // built-in default too.

        env::set_var(ENV_SOCKET, "/from/env/ward.sock");
        env::set_var(ENV_SDK_SOCKET, "/from/env/ward-sdk.sock");
        env::set_var(ENV_PLUGIN_DIR, "/from/env/plugins");

        let socket = config.command_socket();
        let sdk = config.sdk_socket();
        let plugins = config.plugin_dir();
        let free_socket = command_socket_path();
        let free_sdk = sdk_socket_path();
        let free_plugins = plugin_dir();

        env::remove_var(ENV_SOCKET);
        env::remove_var(ENV_SDK_SOCKET);
        env::remove_var(ENV_PLUGIN_DIR);

        assert_eq!(socket, PathBuf::from("/from/env/ward.sock"));
        assert_eq!(sdk, PathBuf::from("/from/env/ward-sdk.sock"));
        assert_eq!(plugins, PathBuf::from("/from/env/plugins"));
        assert_eq!(free_socket, PathBuf::from("/from/env/ward.sock"));
        assert_eq!(free_sdk, PathBuf::from("/from/env/ward-sdk.sock"));
        assert_eq!(free_plugins, PathBuf::from("/from/env/plugins"));

        // With the vars cleared, file values win over defaults again.
        assert_eq!(
            config.command_socket(),
            PathBuf::from("/from/file/ward.sock")
        );
        assert_eq!(
            config.sdk_socket(),
            PathBuf::from("/from/file/ward-sdk.sock")
        );
        assert!(config.plugin_dir().ends_with("plugins"));
    }

    #[test]
    fn enable_entries_split_on_first_equals() {
        assert_eq!(
            DaemonConfig::parse_enable_entry("cpu_stat"),
            ("cpu_stat", "")
        );
        assert_eq!(
            DaemonConfig::parse_enable_entry("hotspot_scan=a=b"),
            ("hotspot_scan", "a=b")
        );
    }
}
