//! Supervisor loop
//!
//! Builds the configured links, initialises them together and then ticks
//! them on a fixed interval. Ticks of different links run concurrently on
//! the same task; each link's machine is behind its own lock so probes and
//! recovery of one link never overlap.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, SupervisorError};
use crate::host::Host;
use crate::identity;
use crate::link::machine::{LinkMachine, RecoveryPolicy};
use crate::link::{LinkContext, LinkDriver, LinkKind, LinkState, REGISTRY};
use crate::peer::RestartHook;
use crate::probe::ProbeReport;
use crate::status::{LinkStatus, StatusReporter};

struct ManagedLink {
    kind: LinkKind,
    driver: Arc<dyn LinkDriver>,
    machine: Mutex<LinkMachine>,
    reporter: StatusReporter,
}

/// One-off probe result for a link
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummary {
    pub link: LinkKind,
    pub enabled: bool,
    pub passed: bool,
    pub report: Option<ProbeReport>,
}

/// Cloneable handle; clones share the same links
#[derive(Clone)]
pub struct Supervisor {
    links: Arc<Vec<ManagedLink>>,
    tick_interval: Duration,
    node_ssid: Arc<str>,
}

impl Supervisor {
    /// Build from the profile, deriving the node identity from the host
    pub async fn from_config(
        config: &Config,
        host: Host,
        restart_hook: RestartHook,
    ) -> Result<Self, ConfigError> {
        let node_ssid = identity::resolve_node_ssid(config, &host).await;
        Self::new(config, host, restart_hook, &node_ssid)
    }

    pub fn new(
        config: &Config,
        host: Host,
        restart_hook: RestartHook,
        node_ssid: &str,
    ) -> Result<Self, ConfigError> {
        for tag in config.plugins.keys() {
            if LinkKind::from_plugin_tag(tag).is_none() {
                warn!(plugin = %tag, "Unknown plugin in profile, skipping");
            }
        }

        let policy = RecoveryPolicy {
            max_attempts: config.supervisor.max_recovery_attempts,
            settle_delay: config.supervisor.settle_delay(),
        };
        let ctx = LinkContext {
            config,
            host: &host,
            node_ssid,
            restart_hook: &restart_hook,
        };

        let mut links = Vec::new();
        for (kind, factory) in REGISTRY {
            if !config.plugins.contains_key(kind.plugin_tag()) {
                continue;
            }
            let driver = factory(&ctx)?;
            let machine = LinkMachine::new(driver.clone(), policy.clone());
            let reporter = StatusReporter::new(driver.clone(), machine.core());
            debug!(link = %kind, "Link registered");
            links.push(ManagedLink {
                kind,
                driver,
                machine: Mutex::new(machine),
                reporter,
            });
        }

        info!(
            node = %node_ssid,
            links = ?links.iter().map(|l| l.kind).collect::<Vec<_>>(),
            "Supervisor configured"
        );

        Ok(Self {
            links: Arc::new(links),
            tick_interval: config.supervisor.tick_interval(),
            node_ssid: node_ssid.into(),
        })
    }

    pub fn node_ssid(&self) -> &str {
        &self.node_ssid
    }

    pub fn kinds(&self) -> Vec<LinkKind> {
        self.links.iter().map(|l| l.kind).collect()
    }

    fn link(&self, kind: LinkKind) -> Result<&ManagedLink, SupervisorError> {
        self.links
            .iter()
            .find(|l| l.kind == kind)
            .ok_or(SupervisorError::UnknownLink(kind))
    }

    /// Initialise every link and wait for all of them
    pub async fn init_all(&self) {
        join_all(
            self.links
                .iter()
                .map(|link| async move { link.machine.lock().await.init().await }),
        )
        .await;
    }

    /// Tick every link and wait for all of them
    pub async fn tick_all(&self) {
        join_all(
            self.links
                .iter()
                .map(|link| async move { link.machine.lock().await.tick().await }),
        )
        .await;
    }

    /// Initialise, then tick until `shutdown` fires
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        self.init_all().await;

        info!(
            interval_secs = self.tick_interval.as_secs(),
            "Supervisor started"
        );

        let mut tick = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick_all().await;
                    self.log_summary().await;
                }
                _ = shutdown.recv() => {
                    info!("Supervisor shutting down");
                    break;
                }
            }
        }
    }

    async fn log_summary(&self) {
        for status in self.status().await {
            match status.state {
                LinkState::Running => {
                    if let Some(peers) = status.peer_count.filter(|p| *p > 0) {
                        info!(link = %status.link, peers, "Mesh peers");
                    }
                    if let Some(devices) = status.connected_devices.filter(|d| *d > 0) {
                        info!(link = %status.link, devices, "Bluetooth devices connected");
                    }
                }
                LinkState::Failed => {
                    warn!(link = %status.link, "Link failed, waiting for forced restart");
                }
                _ => debug!(link = %status.link, state = %status.state, "Link state"),
            }
        }
    }

    /// Fresh snapshot of every link
    pub async fn status(&self) -> Vec<LinkStatus> {
        join_all(self.links.iter().map(|l| l.reporter.snapshot())).await
    }

    pub async fn status_of(&self, kind: LinkKind) -> Result<LinkStatus, SupervisorError> {
        Ok(self.link(kind)?.reporter.snapshot().await)
    }

    /// Reset the link's budget and retry now. Waits for any tick in progress
    /// on the same link.
    pub async fn force_restart(&self, kind: LinkKind) -> Result<LinkStatus, SupervisorError> {
        let link = self.link(kind)?;
        link.machine.lock().await.force_restart().await;
        Ok(link.reporter.snapshot().await)
    }

    /// `{ "plugin_interfaces": <fragment> }` for one link
    pub fn get_config(&self, kind: LinkKind) -> Result<serde_json::Value, SupervisorError> {
        let link = self.link(kind)?;
        Ok(serde_json::json!({ "plugin_interfaces": link.driver.interfaces_fragment() }))
    }

    /// Radio-stack interface definitions of every managed link
    pub fn plugin_interfaces(&self) -> String {
        self.links
            .iter()
            .map(|l| l.driver.interfaces_fragment())
            .collect()
    }

    /// Compute each link's configuration and probe it once, without touching
    /// the state machines
    pub async fn probe_all(&self) -> Vec<ProbeSummary> {
        join_all(self.links.iter().map(|link| async move {
            match link.driver.configure() {
                Some(config) => {
                    let report = link.driver.probe(&config).await;
                    ProbeSummary {
                        link: link.kind,
                        enabled: true,
                        passed: report.passed(),
                        report: Some(report),
                    }
                }
                None => ProbeSummary {
                    link: link.kind,
                    enabled: false,
                    passed: false,
                    report: None,
                },
            }
        }))
        .await
    }
}
