//! batman-adv Layer-2 mesh over an IBSS radio

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::{LinkConfig, LinkContext, LinkDriver, LinkKind, LinkTelemetry};
use crate::config::NodeMode;
use crate::error::{ConfigError, LinkError};
use crate::exec::Cmd;
use crate::host::Host;
use crate::netinfo::{self, Ipv4Assignment};
use crate::probe::{self, ProbeReport, BATMAN_IFACE};
use crate::radio;

/// batman-adv encapsulation needs headroom above the usual 1500
pub const DEFAULT_MTU: u32 = 1532;

const MODULE_SYSFS: &str = "/sys/module/batman_adv";
const DNSMASQ_REDIRECT: &str = "/etc/NetworkManager/dnsmasq-shared.d/retcon_redirect.conf";
const REDIRECT_NAMES: [&str; 5] = [
    "retcon.gateway",
    "retcon.local",
    "retcon.radio",
    "retcon.com",
    "retcon",
];

const AUTO_INTERFACE_FRAGMENT: &str = "
[[Batman Mesh AutoInterface]]
  type = AutoInterface
  interface_enabled = True
  mode = full
  devices = bat0

";

/// `[plugins.batman_mesh]`
#[derive(Debug, Clone, Deserialize)]
pub struct MeshSettings {
    /// IBSS network name; `<prefix>-MESH` if unset
    #[serde(default)]
    pub essid: Option<String>,

    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            essid: None,
            mtu: default_mtu(),
        }
    }
}

fn default_mtu() -> u32 { DEFAULT_MTU }

/// `10.99.<mac[-2]>.<mac[-1]>/16`
pub fn mesh_address(mac: &[u8; 6]) -> Ipv4Assignment {
    Ipv4Assignment::new([10, 99, mac[4], mac[5]].into(), 16)
}

/// dnsmasq lines pointing the well-known names at `ip`
pub fn redirect_config(ip: std::net::Ipv4Addr) -> String {
    REDIRECT_NAMES
        .iter()
        .map(|name| format!("address=/{name}/{ip}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build(ctx: &LinkContext<'_>) -> Result<Arc<dyn LinkDriver>, ConfigError> {
    let settings: MeshSettings = ctx.config.plugin_settings(LinkKind::Mesh.plugin_tag())?;
    Ok(Arc::new(MeshDriver {
        host: ctx.host.clone(),
        mesh_iface: ctx.config.mesh_iface().to_string(),
        ap_iface: ctx.config.wifi.ap_iface.clone(),
        prefix: ctx.config.wifi.prefix.clone(),
        frequency: ctx.config.wifi.freq,
        role: ctx.config.node.mode,
        settings,
    }))
}

pub struct MeshDriver {
    host: Host,
    mesh_iface: String,
    ap_iface: String,
    prefix: String,
    frequency: u32,
    role: NodeMode,
    settings: MeshSettings,
}

impl MeshDriver {
    async fn run(&self, program: &str, args: &[&str], critical: bool) -> Result<bool, LinkError> {
        self.host
            .run(Cmd::new(program).args(args.iter().copied()), critical)
            .await
    }

    async fn load_module(&self) -> Result<(), LinkError> {
        self.run("modprobe", &["batman-adv"], false).await?;
        if !self.host.exists(MODULE_SYSFS) {
            return Err(LinkError::ModuleMissing("batman-adv".into()));
        }
        Ok(())
    }

    async fn assign_mesh_address(&self) -> Result<(), LinkError> {
        let Some(mac) = netinfo::mac_of(&self.host, BATMAN_IFACE).await else {
            warn!("{BATMAN_IFACE} has no hardware address yet, skipping address assignment");
            return Ok(());
        };
        let address = mesh_address(&mac);

        if netinfo::ipv4_of(&self.host, BATMAN_IFACE).await.map(|a| a.addr) == Some(address.addr) {
            info!(address = %address, "Mesh address already assigned");
            return Ok(());
        }

        let address_arg = address.to_string();
        if self
            .run("ip", &["addr", "add", &address_arg, "dev", BATMAN_IFACE], false)
            .await?
        {
            info!(address = %address, "Assigned mesh address");
        }
        Ok(())
    }

    async fn update_dnsmasq_redirect(&self) {
        let Some(ap) = netinfo::ipv4_of(&self.host, &self.ap_iface).await else {
            warn!(iface = %self.ap_iface, "AP interface has no address, dnsmasq redirect not updated");
            return;
        };
        match self.host.rewrite(DNSMASQ_REDIRECT, &redirect_config(ap.addr)).await {
            Ok(()) => info!(ip = %ap.addr, "Updated dnsmasq redirects"),
            Err(e) => warn!(error = %e, "Could not update dnsmasq redirects"),
        }
    }
}

#[async_trait::async_trait]
impl LinkDriver for MeshDriver {
    fn kind(&self) -> LinkKind {
        LinkKind::Mesh
    }

    fn configure(&self) -> Option<LinkConfig> {
        let essid = self
            .settings
            .essid
            .clone()
            .unwrap_or_else(|| format!("{}-MESH", self.prefix));
        let channel = radio::freq_to_channel(self.frequency);
        let cell_id = radio::cell_id(&essid);

        info!(
            iface = %self.mesh_iface,
            essid = %essid,
            channel,
            cell_id = %cell_id,
            "Mesh configuration"
        );

        Some(LinkConfig {
            interfaces: vec![self.mesh_iface.clone(), BATMAN_IFACE.to_string()],
            network_name: essid,
            frequency: Some(radio::channel_to_freq(channel)),
            channel: Some(channel),
            cell_id: Some(cell_id),
            role: self.role,
        })
    }

    async fn setup(&self, config: &LinkConfig) -> Result<(), LinkError> {
        let iface = config.primary_interface();
        let freq = config
            .frequency
            .unwrap_or(radio::DEFAULT_FREQUENCY)
            .to_string();
        let cell_id = config.cell_id.clone().unwrap_or_else(|| radio::cell_id(&config.network_name));
        let mtu = self.settings.mtu.to_string();

        self.load_module().await?;

        self.host
            .run(Cmd::new("nmcli").args(["device", "disconnect", iface]).may_fail(), false)
            .await?;
        self.run("ip", &["link", "set", iface, "down"], true).await?;
        self.run("iw", &[iface, "set", "type", "ibss"], true).await?;
        self.run("ip", &["link", "set", iface, "mtu", &mtu], false).await?;
        self.run("ip", &["link", "set", iface, "up"], true).await?;
        self.run(
            "iw",
            &[iface, "ibss", "join", &config.network_name, &freq, "fixed-freq", &cell_id],
            true,
        )
        .await?;

        self.run("batctl", &["if", "add", iface], true).await?;
        self.run("ip", &["link", "set", BATMAN_IFACE, "up"], true).await?;

        self.run("batctl", &["orig_interval", "1000"], false).await?;
        self.run("batctl", &["bridge_loop_avoidance", "1"], false).await?;
        self.run("batctl", &["distributed_arp_table", "1"], false).await?;

        self.assign_mesh_address().await?;

        if config.role == NodeMode::Transport {
            self.update_dnsmasq_redirect().await;
        }

        Ok(())
    }

    async fn cleanup(&self, config: &LinkConfig) {
        let iface = config.primary_interface();
        let steps: [(&str, Vec<&str>); 4] = [
            ("batctl", vec!["if", "del", iface]),
            ("ip", vec!["link", "set", BATMAN_IFACE, "down"]),
            ("iw", vec![iface, "ibss", "leave"]),
            ("ip", vec!["link", "set", iface, "down"]),
        ];
        for (program, args) in steps {
            let _ = self
                .host
                .run(Cmd::new(program).args(args).may_fail(), false)
                .await;
        }
    }

    async fn probe(&self, config: &LinkConfig) -> ProbeReport {
        probe::probe_mesh(&self.host, config.primary_interface()).await
    }

    async fn telemetry(&self, _config: &LinkConfig) -> LinkTelemetry {
        LinkTelemetry {
            address: netinfo::ipv4_of(&self.host, BATMAN_IFACE)
                .await
                .map(|a| a.to_string()),
            peer_count: Some(netinfo::originator_count(&self.host).await.unwrap_or(0)),
            ..Default::default()
        }
    }

    fn interfaces_fragment(&self) -> String {
        AUTO_INTERFACE_FRAGMENT.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_mesh_address_from_mac_tail() {
        let address = mesh_address(&[0xb8, 0x27, 0xeb, 0x12, 0x34, 0x56]);
        assert_eq!(address.to_string(), "10.99.52.86/16");
    }

    #[test]
    fn test_redirect_config() {
        let config = redirect_config(Ipv4Addr::new(10, 42, 0, 1));
        assert_eq!(
            config,
            "address=/retcon.gateway/10.42.0.1\n\
             address=/retcon.local/10.42.0.1\n\
             address=/retcon.radio/10.42.0.1\n\
             address=/retcon.com/10.42.0.1\n\
             address=/retcon/10.42.0.1"
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = MeshSettings::default();
        assert_eq!(settings.mtu, 1532);
        assert!(settings.essid.is_none());
    }
}
