//! Node profile

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    pub wifi: WifiConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub radio_stack: RadioStackConfig,
    /// Per-link sections keyed by plugin tag (`batman_mesh`, `wifi_mesh`,
    /// `bluetooth_pan`). Only listed links are managed.
    #[serde(default)]
    pub plugins: BTreeMap<String, toml::Table>,
}

/// Role of this node in the network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    #[default]
    Client,
    Transport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub mode: NodeMode,

    /// Broadcast identity override; derived from the hardware address if unset
    #[serde(default)]
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Identifier prefix shared by every node of the network
    pub prefix: String,

    /// Pre-shared key for node access points
    pub psk: String,

    /// Operating frequency in MHz
    pub freq: u32,

    #[serde(default = "default_client_iface")]
    pub client_iface: String,

    #[serde(default = "default_ap_iface")]
    pub ap_iface: String,

    /// Radio used for the IBSS mesh; the client interface if unset
    #[serde(default)]
    pub mesh_iface: Option<String>,

    /// Prefix advertised by client-role nodes
    #[serde(default)]
    pub client_ap_prefix: Option<String>,
}

fn default_client_iface() -> String { "wlan0".to_string() }
fn default_ap_iface() -> String { "uap0".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Health tick interval in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// WiFi scan cadence in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Recovery attempts before a link is marked failed
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Pause between cleanup and setup during recovery
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Log commands instead of running them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            scan_interval_secs: default_scan_interval(),
            max_recovery_attempts: default_max_recovery_attempts(),
            settle_delay_ms: default_settle_delay(),
            dry_run: false,
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_tick_interval() -> u64 { 60 }
fn default_scan_interval() -> u64 { 5 }
fn default_max_recovery_attempts() -> u32 { 5 }
fn default_settle_delay() -> u64 { 2000 }

/// The companion radio-stack daemon restarted after WiFi reassociation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadioStackConfig {
    /// Program and arguments; no process is managed when empty
    #[serde(default)]
    pub command: Vec<String>,
}

impl Config {
    /// Load and validate a profile from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.prefix.is_empty() {
            return Err(ConfigError::Invalid("wifi.prefix must not be empty".into()));
        }
        if self.wifi.psk.is_empty() {
            return Err(ConfigError::Invalid("wifi.psk must not be empty".into()));
        }
        if self.wifi.freq == 0 {
            return Err(ConfigError::Invalid("wifi.freq must be a frequency in MHz".into()));
        }
        if self.supervisor.tick_interval_secs == 0 || self.supervisor.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid("supervisor intervals must be positive".into()));
        }
        if self.supervisor.max_recovery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.max_recovery_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn is_transport(&self) -> bool {
        self.node.mode == NodeMode::Transport
    }

    pub fn mesh_iface(&self) -> &str {
        self.wifi.mesh_iface.as_deref().unwrap_or(&self.wifi.client_iface)
    }

    /// Prefix this node advertises its own identity under
    pub fn identity_prefix(&self) -> &str {
        match self.node.mode {
            NodeMode::Client => self
                .wifi
                .client_ap_prefix
                .as_deref()
                .unwrap_or(&self.wifi.prefix),
            NodeMode::Transport => &self.wifi.prefix,
        }
    }

    /// Typed view of one plugin section; missing keys take their defaults
    pub fn plugin_settings<T>(&self, tag: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        match self.plugins.get(tag) {
            None => Ok(T::default()),
            Some(table) => toml::Value::Table(table.clone())
                .try_into()
                .map_err(|e| ConfigError::Invalid(format!("plugins.{tag}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[wifi]
prefix = "RETCON"
psk = "meshpass"
freq = 2462
"#;

    #[test]
    fn test_minimal_profile_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.node.mode, NodeMode::Client);
        assert_eq!(config.wifi.client_iface, "wlan0");
        assert_eq!(config.wifi.ap_iface, "uap0");
        assert_eq!(config.mesh_iface(), "wlan0");
        assert_eq!(config.supervisor.tick_interval_secs, 60);
        assert_eq!(config.supervisor.scan_interval_secs, 5);
        assert_eq!(config.supervisor.max_recovery_attempts, 5);
        assert_eq!(config.supervisor.settle_delay(), Duration::from_secs(2));
        assert!(!config.supervisor.dry_run);
        assert!(config.radio_stack.command.is_empty());
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_identity_prefix_by_role() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.identity_prefix(), "RETCON");

        config.wifi.client_ap_prefix = Some("RETCON-C".to_string());
        assert_eq!(config.identity_prefix(), "RETCON-C");

        config.node.mode = NodeMode::Transport;
        assert_eq!(config.identity_prefix(), "RETCON");
    }

    #[test]
    fn test_access_point_keys_are_ignored() {
        // profiles shared with the access point service carry its keys too
        let config = Config::from_toml_str(&format!(
            "{MINIMAL}client_ap_prefix = \"RETCON-C\"\nclient_ap_psk = \"apsecret\"\n"
        ))
        .unwrap();
        assert_eq!(config.wifi.client_ap_prefix.as_deref(), Some("RETCON-C"));
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let err = Config::from_toml_str("[wifi]\nprefix = \"RETCON\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_empty_prefix_is_invalid() {
        let err = Config::from_toml_str("[wifi]\nprefix = \"\"\npsk = \"x\"\nfreq = 2462\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_plugin_settings_typed_view() {
        #[derive(Debug, Default, Deserialize)]
        struct Mesh {
            essid: Option<String>,
        }

        let config = Config::from_toml_str(&format!(
            "{MINIMAL}\n[plugins.batman_mesh]\nessid = \"TEST-MESH\"\n[plugins.wifi_mesh]\n"
        ))
        .unwrap();

        let mesh: Mesh = config.plugin_settings("batman_mesh").unwrap();
        assert_eq!(mesh.essid.as_deref(), Some("TEST-MESH"));

        let absent: Mesh = config.plugin_settings("bluetooth_pan").unwrap();
        assert!(absent.essid.is_none());
    }

    #[test]
    fn test_plugin_settings_type_mismatch() {
        #[derive(Debug, Default, Deserialize)]
        struct Mesh {
            #[allow(dead_code)]
            mtu: Option<u32>,
        }

        let config =
            Config::from_toml_str(&format!("{MINIMAL}\n[plugins.batman_mesh]\nmtu = \"big\"\n"))
                .unwrap();
        let err = config.plugin_settings::<Mesh>("batman_mesh").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
