//! Managed WiFi client association
//!
//! The link itself only keeps the scan loop alive; association decisions are
//! made by the [`PeerSelectionEngine`] on its own cadence.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use super::{LinkConfig, LinkContext, LinkDriver, LinkKind, LinkTelemetry};
use crate::config::NodeMode;
use crate::error::{ConfigError, LinkError};
use crate::host::Host;
use crate::netinfo;
use crate::peer::{PeerSelectionEngine, SelectionSettings, SelectionTimings, MIN_STRENGTH};
use crate::probe::{self, ProbeReport};
use crate::radio;

/// `[plugins.wifi_mesh]`
#[derive(Debug, Clone, Deserialize)]
pub struct WifiSettings {
    /// Strength a lower-identity fallback must exceed on transport nodes
    #[serde(default = "default_min_strength")]
    pub min_strength: i32,

    /// Seconds before a valid association is reconsidered
    #[serde(default = "default_reassociate_after")]
    pub reassociate_after_secs: u64,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            min_strength: default_min_strength(),
            reassociate_after_secs: default_reassociate_after(),
        }
    }
}

fn default_min_strength() -> i32 { MIN_STRENGTH }
fn default_reassociate_after() -> u64 { 600 }

/// Radio-stack interfaces: TCP client towards the gateway we associate with,
/// TCP server on our own access point
pub fn tcp_fragment(client_iface: &str, ap_iface: &str) -> String {
    format!(
        "
  [[TCP Client Interface]]
  type = TCPClientInterface
  enabled = yes
  mode = full
  name = retcon_tcp_client_iface_{client_iface}
  target_host = retcon.gateway
  target_port = 4242

  [[TCP Server Interface]]
  type = TCPServerInterface
  enabled = yes
  mode = gateway
  device = {ap_iface}
  name = retcon_tcp_server_iface_{ap_iface}
  listen_port = 4242

"
    )
}

pub fn build(ctx: &LinkContext<'_>) -> Result<Arc<dyn LinkDriver>, ConfigError> {
    let settings: WifiSettings = ctx.config.plugin_settings(LinkKind::WifiClient.plugin_tag())?;
    let wifi = &ctx.config.wifi;

    let engine = PeerSelectionEngine::new(
        ctx.host.clone(),
        SelectionSettings {
            iface: wifi.client_iface.clone(),
            prefix: wifi.prefix.as_bytes().to_vec(),
            psk: wifi.psk.clone(),
            frequency: wifi.freq,
            is_transport: ctx.config.is_transport(),
            own_identity: ctx.node_ssid.as_bytes().to_vec(),
            min_strength: settings.min_strength,
        },
        SelectionTimings {
            reassociate_after: Duration::from_secs(settings.reassociate_after_secs),
            ..SelectionTimings::default()
        },
        ctx.restart_hook.clone(),
    );

    Ok(Arc::new(WifiClientDriver::new(
        ctx.host.clone(),
        Arc::new(engine),
        wifi.ap_iface.clone(),
        ctx.config.node.mode,
        ctx.config.supervisor.scan_interval(),
    )))
}

pub struct WifiClientDriver {
    host: Host,
    engine: Arc<PeerSelectionEngine>,
    ap_iface: String,
    role: NodeMode,
    scan_interval: Duration,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl WifiClientDriver {
    pub fn new(
        host: Host,
        engine: Arc<PeerSelectionEngine>,
        ap_iface: String,
        role: NodeMode,
        scan_interval: Duration,
    ) -> Self {
        Self {
            host,
            engine,
            ap_iface,
            role,
            scan_interval,
            scan_task: Mutex::new(None),
        }
    }

    pub async fn scan_loop_alive(&self) -> bool {
        self.scan_task
            .lock()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn ensure_scan_loop(&self) {
        let mut task = self.scan_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        info!(iface = %self.engine.settings().iface, "Starting scan loop");
        *task = Some(tokio::spawn(self.engine.clone().run_loop(self.scan_interval)));
    }
}

impl Drop for WifiClientDriver {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl LinkDriver for WifiClientDriver {
    fn kind(&self) -> LinkKind {
        LinkKind::WifiClient
    }

    fn configure(&self) -> Option<LinkConfig> {
        let settings = self.engine.settings();
        let mut interfaces = vec![settings.iface.clone()];
        if self.role == NodeMode::Transport {
            interfaces.push(self.ap_iface.clone());
        }

        Some(LinkConfig {
            interfaces,
            network_name: String::from_utf8_lossy(&settings.prefix).into_owned(),
            frequency: Some(settings.frequency),
            channel: Some(radio::freq_to_channel(settings.frequency)),
            cell_id: None,
            role: self.role,
        })
    }

    async fn setup(&self, config: &LinkConfig) -> Result<(), LinkError> {
        let iface = config.primary_interface();
        if !netinfo::interface_exists(&self.host, iface).await {
            return Err(LinkError::InterfaceMissing(iface.to_string()));
        }
        self.ensure_scan_loop().await;
        Ok(())
    }

    async fn cleanup(&self, _config: &LinkConfig) {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            info!("Scan loop stopped");
        }
    }

    async fn probe(&self, config: &LinkConfig) -> ProbeReport {
        let alive = self.scan_loop_alive().await;
        probe::probe_wifi_client(&self.host, config.primary_interface(), alive).await
    }

    async fn telemetry(&self, config: &LinkConfig) -> LinkTelemetry {
        let record = self.engine.record().await;
        LinkTelemetry {
            address: netinfo::ipv4_of(&self.host, config.primary_interface())
                .await
                .map(|a| a.to_string()),
            associated_ssid: record.ssid,
            secs_since_association: record.associated_at.map(|t| t.elapsed().as_secs()),
            ..Default::default()
        }
    }

    fn interfaces_fragment(&self) -> String {
        tcp_fragment(&self.engine.settings().iface, &self.ap_iface)
    }
}
