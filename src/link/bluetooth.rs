//! Bluetooth PAN access point (client-role nodes only)

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use super::{LinkConfig, LinkContext, LinkDriver, LinkKind, LinkTelemetry};
use crate::config::NodeMode;
use crate::error::{ConfigError, LinkError};
use crate::exec::Cmd;
use crate::host::Host;
use crate::netinfo;
use crate::probe::{self, ProbeReport, PAN_IFACE};

pub const PAN_ADDRESS: &str = "192.168.4.1";
pub const PAN_PREFIX: u8 = 24;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICES_TIMEOUT: Duration = Duration::from_secs(5);

const NETDEV_PATH: &str = "/etc/systemd/network/pan0.netdev";
const NETWORK_PATH: &str = "/etc/systemd/network/pan0.network";
const NAP_SERVICE_PATH: &str = "/etc/systemd/system/bt-network.service";

const NETDEV_UNIT: &str = "[NetDev]
Name=pan0
Kind=bridge
";

const NAP_SERVICE_UNIT: &str = "[Unit]
Description=Bluetooth Network Access Point
After=bluetooth.service
Requires=bluetooth.service

[Service]
Type=simple
ExecStart=/usr/bin/bt-network -s nap pan0
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
";

/// `[plugins.bluetooth_pan]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BluetoothSettings {
    /// Advertised adapter name; `<prefix>-BT` if unset
    #[serde(default)]
    pub name: Option<String>,
}

/// systemd-networkd bridge with a DHCP server for connecting devices
pub fn network_unit() -> String {
    format!(
        "[Match]
Name=pan0

[Network]
Address={PAN_ADDRESS}/{PAN_PREFIX}
DHCPServer=yes

[DHCPServer]
PoolOffset=10
PoolSize=50
DNS={PAN_ADDRESS}
"
    )
}

/// Control batch fed to `bluetoothctl`
pub fn control_batch(name: &str) -> String {
    [
        "power on".to_string(),
        format!("system-alias {name}"),
        "discoverable on".to_string(),
        "pairable on".to_string(),
        "agent NoInputNoOutput".to_string(),
        "default-agent".to_string(),
        "quit".to_string(),
    ]
    .join("\n")
}

pub fn build(ctx: &LinkContext<'_>) -> Result<Arc<dyn LinkDriver>, ConfigError> {
    let settings: BluetoothSettings =
        ctx.config.plugin_settings(LinkKind::BluetoothPan.plugin_tag())?;
    Ok(Arc::new(BluetoothPanDriver {
        host: ctx.host.clone(),
        role: ctx.config.node.mode,
        name: settings
            .name
            .unwrap_or_else(|| format!("{}-BT", ctx.config.wifi.prefix)),
        service_settle: Duration::from_secs(1),
    }))
}

pub struct BluetoothPanDriver {
    host: Host,
    role: NodeMode,
    name: String,
    service_settle: Duration,
}

impl BluetoothPanDriver {
    async fn systemctl(&self, args: &[&str], critical: bool) -> Result<bool, LinkError> {
        self.host
            .run(Cmd::new("systemctl").args(args.iter().copied()), critical)
            .await
    }

    async fn configure_adapter(&self) -> Result<(), LinkError> {
        info!(name = %self.name, "Configuring Bluetooth adapter");
        self.host
            .run(
                Cmd::new("bluetoothctl")
                    .stdin(control_batch(&self.name))
                    .timeout(CONTROL_TIMEOUT),
                false,
            )
            .await?;
        Ok(())
    }

    async fn setup_pan_network(&self) -> Result<(), LinkError> {
        if self.host.write_if_absent(NETDEV_PATH, NETDEV_UNIT).await? {
            info!(path = NETDEV_PATH, "Created PAN bridge definition");
        }
        if self.host.write_if_absent(NETWORK_PATH, &network_unit()).await? {
            info!(path = NETWORK_PATH, "Created PAN network definition");
        }

        self.systemctl(&["daemon-reload"], false).await?;
        self.host
            .run(
                Cmd::new("systemctl")
                    .args(["restart", "systemd-networkd"])
                    .may_fail(),
                false,
            )
            .await?;
        Ok(())
    }

    async fn start_nap_service(&self) -> Result<(), LinkError> {
        if !self.host.succeeds(Cmd::new("which").arg("bt-network")).await {
            warn!("bt-network not found (provided by bluez-tools)");
        }

        if self
            .host
            .write_if_absent(NAP_SERVICE_PATH, NAP_SERVICE_UNIT)
            .await?
        {
            info!(path = NAP_SERVICE_PATH, "Created NAP service unit");
            self.systemctl(&["daemon-reload"], false).await?;
        }

        self.systemctl(&["enable", "bt-network"], false).await?;
        self.systemctl(&["restart", "bt-network"], true).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LinkDriver for BluetoothPanDriver {
    fn kind(&self) -> LinkKind {
        LinkKind::BluetoothPan
    }

    fn configure(&self) -> Option<LinkConfig> {
        if self.role != NodeMode::Client {
            return None;
        }
        Some(LinkConfig {
            interfaces: vec![PAN_IFACE.to_string()],
            network_name: self.name.clone(),
            frequency: None,
            channel: None,
            cell_id: None,
            role: self.role,
        })
    }

    async fn setup(&self, _config: &LinkConfig) -> Result<(), LinkError> {
        if !probe::unit_active(&self.host, "bluetooth").await {
            self.systemctl(&["start", "bluetooth"], true).await?;
        }
        tokio::time::sleep(self.service_settle).await;

        self.configure_adapter().await?;
        self.setup_pan_network().await?;
        self.start_nap_service().await?;

        info!(name = %self.name, "Bluetooth PAN up");
        Ok(())
    }

    async fn cleanup(&self, _config: &LinkConfig) {
        let _ = self.systemctl(&["stop", "bt-network"], false).await;
        let _ = self.systemctl(&["restart", "bluetooth"], false).await;
    }

    async fn probe(&self, _config: &LinkConfig) -> ProbeReport {
        probe::probe_bluetooth(&self.host).await
    }

    async fn telemetry(&self, _config: &LinkConfig) -> LinkTelemetry {
        let connected = self
            .host
            .output(
                Cmd::new("bluetoothctl")
                    .args(["devices", "Connected"])
                    .timeout(DEVICES_TIMEOUT),
            )
            .await
            .map(|out| netinfo::count_connected_devices(&out.stdout))
            .unwrap_or(0);

        LinkTelemetry {
            address: Some(format!("{PAN_ADDRESS}/{PAN_PREFIX}")),
            connected_devices: Some(connected),
            ..Default::default()
        }
    }

    fn interfaces_fragment(&self) -> String {
        if self.role != NodeMode::Client {
            return String::new();
        }
        format!(
            "
[[Bluetooth PAN TCP Server]]
  type = TCPServerInterface
  interface_enabled = True
  listen_ip = {PAN_ADDRESS}
  listen_port = 4242

"
        )
    }
}
