//! Managed network links
//!
//! Each link kind implements [`LinkDriver`]: how to derive its configuration,
//! bring it up, tear it down, probe it and read telemetry. The
//! [`machine::LinkMachine`] drives any driver through the recovery states.

pub mod bluetooth;
pub mod machine;
pub mod mesh;
pub mod wifi;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, NodeMode};
use crate::error::{ConfigError, LinkError};
use crate::host::Host;
use crate::peer::RestartHook;
use crate::probe::ProbeReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Mesh,
    WifiClient,
    BluetoothPan,
}

impl LinkKind {
    pub const ALL: [LinkKind; 3] = [LinkKind::Mesh, LinkKind::WifiClient, LinkKind::BluetoothPan];

    /// Section name under `[plugins]` in the profile
    pub fn plugin_tag(&self) -> &'static str {
        match self {
            LinkKind::Mesh => "batman_mesh",
            LinkKind::WifiClient => "wifi_mesh",
            LinkKind::BluetoothPan => "bluetooth_pan",
        }
    }

    pub fn from_plugin_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.plugin_tag() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Mesh => "mesh",
            LinkKind::WifiClient => "wifi_client",
            LinkKind::BluetoothPan => "bluetooth_pan",
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Unconfigured,
    Initializing,
    Running,
    Degraded,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unconfigured => "unconfigured",
            LinkState::Initializing => "initializing",
            LinkState::Running => "running",
            LinkState::Degraded => "degraded",
            LinkState::Failed => "failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry counter for recovery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryBudget {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RecoveryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Count one attempt; returns its 1-based number
    pub fn spend(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Parameters computed once per initialisation and reused by recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkConfig {
    pub interfaces: Vec<String>,
    pub network_name: String,
    pub frequency: Option<u32>,
    pub channel: Option<u8>,
    pub cell_id: Option<String>,
    pub role: NodeMode,
}

impl LinkConfig {
    pub fn primary_interface(&self) -> &str {
        self.interfaces.first().map(String::as_str).unwrap_or_default()
    }
}

/// Link-specific readings for the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkTelemetry {
    pub address: Option<String>,
    pub peer_count: Option<usize>,
    pub connected_devices: Option<usize>,
    pub associated_ssid: Option<String>,
    pub secs_since_association: Option<u64>,
}

/// What a driver constructor gets to see
pub struct LinkContext<'a> {
    pub config: &'a Config,
    pub host: &'a Host,
    /// This node's broadcast identity
    pub node_ssid: &'a str,
    pub restart_hook: &'a RestartHook,
}

/// Driver constructor for one link kind
pub type LinkFactory = fn(&LinkContext<'_>) -> Result<Arc<dyn LinkDriver>, ConfigError>;

/// Every link kind the supervisor can manage
pub const REGISTRY: [(LinkKind, LinkFactory); 3] = [
    (LinkKind::Mesh, mesh::build),
    (LinkKind::WifiClient, wifi::build),
    (LinkKind::BluetoothPan, bluetooth::build),
];

/// Link-specific procedures
#[async_trait::async_trait]
pub trait LinkDriver: Send + Sync {
    fn kind(&self) -> LinkKind;

    /// Derive the link configuration; `None` when the link is disabled for
    /// this node's role
    fn configure(&self) -> Option<LinkConfig>;

    /// Bring the link up. Must be safe to re-run after a partial failure.
    async fn setup(&self, config: &LinkConfig) -> Result<(), LinkError>;

    /// Best-effort teardown before a retry
    async fn cleanup(&self, config: &LinkConfig);

    async fn probe(&self, config: &LinkConfig) -> ProbeReport;

    async fn telemetry(&self, config: &LinkConfig) -> LinkTelemetry;

    /// Radio-stack interface definitions for this link
    fn interfaces_fragment(&self) -> String;
}
