//! Recovery state machine
//!
//! One machine per link. The machine owns the link's lifecycle and publishes
//! its state to a shared core so status reads never wait on a running
//! probe or recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{LinkConfig, LinkDriver, LinkKind, LinkState, RecoveryBudget};

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    /// Pause between cleanup and the setup retry
    pub settle_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// The published part of a machine
#[derive(Debug, Clone)]
pub struct LinkCore {
    pub state: LinkState,
    pub budget: RecoveryBudget,
    pub config: Option<LinkConfig>,
    /// Last entry into `Running`
    pub running_since: Option<Instant>,
    pub last_error: Option<String>,
}

impl LinkCore {
    fn new(max_attempts: u32) -> Self {
        Self {
            state: LinkState::Unconfigured,
            budget: RecoveryBudget::new(max_attempts),
            config: None,
            running_since: None,
            last_error: None,
        }
    }
}

pub struct LinkMachine {
    driver: Arc<dyn LinkDriver>,
    policy: RecoveryPolicy,
    core: Arc<RwLock<LinkCore>>,
}

impl LinkMachine {
    pub fn new(driver: Arc<dyn LinkDriver>, policy: RecoveryPolicy) -> Self {
        let core = Arc::new(RwLock::new(LinkCore::new(policy.max_attempts)));
        Self {
            driver,
            policy,
            core,
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.driver.kind()
    }

    /// Shared handle for status readers
    pub fn core(&self) -> Arc<RwLock<LinkCore>> {
        self.core.clone()
    }

    pub async fn state(&self) -> LinkState {
        self.core.read().await.state
    }

    pub async fn snapshot(&self) -> LinkCore {
        self.core.read().await.clone()
    }

    /// Compute the configuration and run the first setup
    pub async fn init(&mut self) {
        let kind = self.kind();

        let Some(config) = self.driver.configure() else {
            info!(link = %kind, "Link disabled for this node role");
            self.update(|core| {
                core.state = LinkState::Unconfigured;
                core.config = None;
            })
            .await;
            return;
        };

        info!(
            link = %kind,
            interfaces = ?config.interfaces,
            network = %config.network_name,
            "Initializing link"
        );
        self.update(|core| {
            core.state = LinkState::Initializing;
            core.config = Some(config.clone());
            core.budget.reset();
        })
        .await;

        match self.driver.setup(&config).await {
            Ok(()) => {
                info!(link = %kind, "Link up");
                self.enter_running().await;
            }
            Err(e) => {
                error!(link = %kind, error = %e, "Link setup failed");
                self.update(|core| {
                    core.state = LinkState::Degraded;
                    core.last_error = Some(e.to_string());
                })
                .await;
            }
        }
    }

    /// Probe once and react
    pub async fn tick(&mut self) {
        let kind = self.kind();
        let (state, config) = {
            let core = self.core.read().await;
            (core.state, core.config.clone())
        };

        let config = match (state, config) {
            (LinkState::Running | LinkState::Degraded, Some(config)) => config,
            _ => return,
        };

        let report = self.driver.probe(&config).await;
        if !report.passed() {
            if let Some(check) = report.first_failure() {
                warn!(link = %kind, check = check.name, reason = %check.detail, "Health probe failed");
            }
            if state == LinkState::Running {
                warn!(link = %kind, "Link degraded");
            }
            self.update(|core| core.state = LinkState::Degraded).await;
            self.attempt_recovery().await;
            return;
        }

        if state == LinkState::Degraded {
            info!(link = %kind, "Link recovered");
            self.enter_running().await;
        } else {
            self.update(|core| core.budget.reset()).await;
        }
    }

    /// Clean up and retry setup with the stored configuration
    pub async fn attempt_recovery(&mut self) {
        let kind = self.kind();
        let (budget, config) = {
            let core = self.core.read().await;
            (core.budget, core.config.clone())
        };
        let Some(config) = config else {
            return;
        };

        if budget.exhausted() {
            self.fail().await;
            return;
        }

        let mut attempt = 0;
        self.update(|core| attempt = core.budget.spend()).await;
        info!(
            link = %kind,
            attempt,
            max_attempts = budget.max_attempts,
            "Attempting recovery"
        );

        self.driver.cleanup(&config).await;
        tokio::time::sleep(self.policy.settle_delay).await;

        match self.driver.setup(&config).await {
            Ok(()) => {
                info!(link = %kind, attempt, "Recovery succeeded");
                self.enter_running().await;
            }
            Err(e) => {
                warn!(link = %kind, attempt, error = %e, "Recovery attempt failed");
                let mut exhausted = false;
                self.update(|core| {
                    core.state = LinkState::Degraded;
                    core.last_error = Some(e.to_string());
                    exhausted = core.budget.exhausted();
                })
                .await;
                if exhausted {
                    self.fail().await;
                }
            }
        }
    }

    /// Operator override: fresh budget and an immediate attempt
    pub async fn force_restart(&mut self) {
        let kind = self.kind();
        info!(link = %kind, "Forced restart requested");

        if self.core.read().await.config.is_none() {
            self.init().await;
            return;
        }

        self.update(|core| {
            core.budget.reset();
            core.state = LinkState::Degraded;
        })
        .await;
        self.attempt_recovery().await;
    }

    async fn enter_running(&self) {
        self.update(|core| {
            core.state = LinkState::Running;
            core.running_since = Some(Instant::now());
            core.budget.reset();
            core.last_error = None;
        })
        .await;
    }

    async fn fail(&self) {
        let mut attempts = 0;
        self.update(|core| {
            core.state = LinkState::Failed;
            attempts = core.budget.attempts;
        })
        .await;
        error!(
            link = %self.kind(),
            attempts,
            "Recovery budget exhausted, link failed until forced restart"
        );
    }

    async fn update(&self, f: impl FnOnce(&mut LinkCore)) {
        let mut core = self.core.write().await;
        f(&mut core);
    }
}
