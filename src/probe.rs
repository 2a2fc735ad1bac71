//! Link health probes
//!
//! A probe is a conjunction of independent read-only checks. Checks never
//! error: a missing resource is a failed check with a reason.

use serde::Serialize;
use tracing::debug;

use crate::exec::Cmd;
use crate::host::Host;
use crate::netinfo::{self, QUERY_TIMEOUT};

pub const BATMAN_IFACE: &str = "bat0";
pub const PAN_IFACE: &str = "pan0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub checks: Vec<CheckResult>,
}

impl ProbeReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a check; returns whether it passed
    pub fn check(&mut self, name: &'static str, passed: bool, detail: impl Into<String>) -> bool {
        self.checks.push(CheckResult {
            name,
            passed,
            detail: detail.into(),
        });
        passed
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed)
    }
}

/// batman-adv mesh over an IBSS radio
pub async fn probe_mesh(host: &Host, mesh_iface: &str) -> ProbeReport {
    let mut report = ProbeReport::new();

    report.check(
        "batman_module",
        host.exists("/sys/module/batman_adv"),
        "batman_adv kernel module not loaded",
    );

    let exists = netinfo::interface_exists(host, mesh_iface).await;
    let up = exists && netinfo::interface_up(host, mesh_iface).await;
    report.check(
        "mesh_iface_up",
        up,
        if exists {
            format!("{mesh_iface} is down")
        } else {
            format!("{mesh_iface} does not exist")
        },
    );

    let mode = host
        .output(
            Cmd::new("iw")
                .args(["dev", mesh_iface, "info"])
                .timeout(QUERY_TIMEOUT),
        )
        .await
        .and_then(|out| netinfo::parse_iw_type(&out.stdout));
    report.check(
        "ibss_mode",
        mode.as_deref() == Some("IBSS"),
        format!(
            "{mesh_iface} is in {} mode, expected IBSS",
            mode.as_deref().unwrap_or("unknown")
        ),
    );

    let attached = host
        .read_trimmed(&format!("/sys/class/net/{mesh_iface}/batman_adv/mesh_iface"))
        .await;
    report.check(
        "attached_to_bat0",
        attached.as_deref() == Some(BATMAN_IFACE),
        format!(
            "{mesh_iface} attached to {}, expected {BATMAN_IFACE}",
            attached.as_deref().unwrap_or("nothing")
        ),
    );

    let bat_up = netinfo::interface_exists(host, BATMAN_IFACE).await
        && netinfo::interface_up(host, BATMAN_IFACE).await;
    report.check(
        "bat0_up",
        bat_up,
        format!("{BATMAN_IFACE} missing or down"),
    );

    report
}

/// Managed WiFi client association
pub async fn probe_wifi_client(host: &Host, client_iface: &str, scan_loop_alive: bool) -> ProbeReport {
    let mut report = ProbeReport::new();

    let exists = netinfo::interface_exists(host, client_iface).await;
    let up = exists && netinfo::interface_up(host, client_iface).await;
    report.check(
        "client_iface_up",
        up,
        if exists {
            format!("{client_iface} is down")
        } else {
            format!("{client_iface} does not exist")
        },
    );
    report.check("scan_loop_alive", scan_loop_alive, "scan loop is not running");

    report
}

/// Bluetooth PAN access point
pub async fn probe_bluetooth(host: &Host) -> ProbeReport {
    let mut report = ProbeReport::new();

    report.check(
        "bluetooth_active",
        unit_active(host, "bluetooth").await,
        "bluetooth.service is not active",
    );
    report.check(
        "bt_network_active",
        unit_active(host, "bt-network").await,
        "bt-network.service is not active",
    );

    if !netinfo::interface_exists(host, PAN_IFACE).await {
        debug!("{PAN_IFACE} not present yet (appears once a device connects)");
    }

    report
}

pub(crate) async fn unit_active(host: &Host, unit: &str) -> bool {
    host.succeeds(
        Cmd::new("systemctl")
            .args(["is-active", unit])
            .timeout(QUERY_TIMEOUT),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::DryRunRunner;
    use std::sync::Arc;

    fn write_flags(root: &std::path::Path, iface: &str, flags: &str) {
        let dir = root.join("sys/class/net").join(iface);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("flags"), flags).unwrap();
    }

    #[test]
    fn test_report_is_conjunction() {
        let mut report = ProbeReport::new();
        assert!(report.passed());

        report.check("a", true, "");
        report.check("b", false, "b broke");
        report.check("c", false, "c broke");

        assert!(!report.passed());
        let first = report.first_failure().unwrap();
        assert_eq!(first.name, "b");
        assert_eq!(first.detail, "b broke");
    }

    #[tokio::test]
    async fn test_wifi_client_needs_interface_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let host = Host::new(Arc::new(DryRunRunner), dir.path());

        let report = probe_wifi_client(&host, "wlan0", true).await;
        assert_eq!(report.first_failure().unwrap().detail, "wlan0 does not exist");

        write_flags(dir.path(), "wlan0", "0x1002\n");
        let report = probe_wifi_client(&host, "wlan0", true).await;
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.name, "client_iface_up");
        assert_eq!(failure.detail, "wlan0 is down");

        write_flags(dir.path(), "wlan0", "0x1003\n");
        assert!(probe_wifi_client(&host, "wlan0", true).await.passed());
        assert!(!probe_wifi_client(&host, "wlan0", false).await.passed());
    }
}
