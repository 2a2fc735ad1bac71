//! Node broadcast identity
//!
//! A node advertises `<prefix><ascii85(hardware address)>`. Transport nodes
//! compare candidate identities against their own to decide who connects to
//! whom, so the derivation must be stable across restarts.

use tracing::{info, warn};

use crate::config::Config;
use crate::host::Host;
use crate::netinfo;

/// ASCII85 (Adobe alphabet) with `z` folding of all-zero groups, no padding
pub fn ascii85(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 5 / 4 + 5);

    for chunk in data.chunks(4) {
        let mut group = [0u8; 4];
        group[..chunk.len()].copy_from_slice(chunk);
        let mut word = u32::from_be_bytes(group);

        if chunk.len() == 4 && word == 0 {
            out.push('z');
            continue;
        }

        let mut digits = [0u8; 5];
        for digit in digits.iter_mut().rev() {
            *digit = (word % 85) as u8 + b'!';
            word /= 85;
        }
        // a partial group of n bytes keeps n + 1 characters
        for &digit in &digits[..chunk.len() + 1] {
            out.push(digit as char);
        }
    }
    out
}

/// Identity for a given prefix and hardware address
pub fn identity_from_mac(prefix: &str, mac: &[u8; 6]) -> String {
    format!("{prefix}{}", ascii85(mac))
}

/// Resolve this node's broadcast identity from the profile and the host
pub async fn resolve_node_ssid(config: &Config, host: &Host) -> String {
    if let Some(ssid) = &config.node.ssid {
        info!(ssid = %ssid, "Using node identity from profile");
        return ssid.clone();
    }

    let prefix = config.identity_prefix();
    for iface in [&config.wifi.ap_iface, &config.wifi.client_iface] {
        if let Some(mac) = netinfo::mac_of(host, iface).await {
            let ssid = identity_from_mac(prefix, &mac);
            info!(
                ssid = %ssid,
                iface = %iface,
                mac = %netinfo::format_mac(&mac),
                "Derived node identity"
            );
            return ssid;
        }
    }

    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "node".to_string());
    warn!(
        hostname = %name,
        "No hardware address readable, deriving node identity from host name"
    );
    format!("{prefix}{name}")
}
