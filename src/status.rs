//! Link status snapshots
//!
//! Built fresh on every request from the machine's published core and a
//! new telemetry read. Nothing here is cached or mutated.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::link::machine::LinkCore;
use crate::link::{LinkDriver, LinkKind, LinkState, LinkTelemetry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub link: LinkKind,
    pub state: LinkState,
    pub interface: Option<String>,
    pub network_name: Option<String>,
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_devices: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secs_since_association: Option<u64>,
    /// Seconds since the last entry into `running`; null if never
    pub uptime_secs: Option<u64>,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub last_error: Option<String>,
}

/// Assemble a snapshot from already-read parts
pub fn build_status(kind: LinkKind, core: &LinkCore, telemetry: LinkTelemetry, now: Instant) -> LinkStatus {
    LinkStatus {
        link: kind,
        state: core.state,
        interface: core
            .config
            .as_ref()
            .map(|c| c.primary_interface().to_string()),
        network_name: core.config.as_ref().map(|c| c.network_name.clone()),
        address: telemetry.address,
        peer_count: telemetry.peer_count,
        connected_devices: telemetry.connected_devices,
        associated_ssid: telemetry.associated_ssid,
        secs_since_association: telemetry.secs_since_association,
        uptime_secs: core
            .running_since
            .map(|since| now.saturating_duration_since(since).as_secs()),
        recovery_attempts: core.budget.attempts,
        max_recovery_attempts: core.budget.max_attempts,
        last_error: core.last_error.clone(),
    }
}

/// Reads one link's status without taking its machine lock
#[derive(Clone)]
pub struct StatusReporter {
    driver: Arc<dyn LinkDriver>,
    core: Arc<RwLock<LinkCore>>,
}

impl StatusReporter {
    pub fn new(driver: Arc<dyn LinkDriver>, core: Arc<RwLock<LinkCore>>) -> Self {
        Self { driver, core }
    }

    pub async fn snapshot(&self) -> LinkStatus {
        let core = self.core.read().await.clone();
        let telemetry = match &core.config {
            Some(config) => self.driver.telemetry(config).await,
            None => LinkTelemetry::default(),
        };
        build_status(self.driver.kind(), &core, telemetry, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeMode;
    use crate::link::{LinkConfig, RecoveryBudget};
    use std::time::Duration;

    fn core(state: LinkState, running_since: Option<Instant>) -> LinkCore {
        LinkCore {
            state,
            budget: RecoveryBudget {
                attempts: 2,
                max_attempts: 5,
            },
            config: Some(LinkConfig {
                interfaces: vec!["wlan1".into(), "bat0".into()],
                network_name: "RETCON-MESH".into(),
                frequency: Some(2462),
                channel: Some(11),
                cell_id: Some("02:7d:bd:1f:7a:7d".into()),
                role: NodeMode::Transport,
            }),
            running_since,
            last_error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_since_running() {
        let started = Instant::now();
        tokio::time::advance(Duration::from_secs(42)).await;

        let status = build_status(
            LinkKind::Mesh,
            &core(LinkState::Running, Some(started)),
            LinkTelemetry {
                address: Some("10.99.52.86/16".into()),
                peer_count: Some(3),
                ..Default::default()
            },
            Instant::now(),
        );

        assert_eq!(status.uptime_secs, Some(42));
        assert_eq!(status.interface.as_deref(), Some("wlan1"));
        assert_eq!(status.network_name.as_deref(), Some("RETCON-MESH"));
        assert_eq!(status.peer_count, Some(3));
        assert_eq!(status.recovery_attempts, 2);
        assert_eq!(status.max_recovery_attempts, 5);
    }

    #[test]
    fn test_uptime_null_before_running() {
        let status = build_status(
            LinkKind::Mesh,
            &core(LinkState::Degraded, None),
            LinkTelemetry::default(),
            Instant::now(),
        );
        assert_eq!(status.uptime_secs, None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["link"], "mesh");
        assert!(json["uptime_secs"].is_null());
        assert!(json.get("peer_count").is_none());
    }
}
