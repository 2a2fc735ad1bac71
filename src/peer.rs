//! Peer selection for the managed WiFi client
//!
//! Nodes advertise access points named `<prefix><identity>`. The client radio
//! associates with one of them. On transport nodes the choice is biased so
//! two transports do not both pick each other: a transport skips candidates
//! whose identity sorts at or below its own while a reasonably strong
//! alternative remains.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::exec::Cmd;
use crate::host::Host;
use crate::netinfo::{self, Ipv4Assignment};

/// nmcli connection profile owned by this engine
pub const CONNECTION_ID: &str = "RETCON_WIFI_MESH";

/// Candidates at or below this strength are never preferred by the tie-break
pub const MIN_STRENGTH: i32 = 33;

pub const GATEWAY_HOSTNAME: &str = "retcon.gateway";

const HOSTS_PATH: &str = "/etc/hosts";

/// Called after every successful reassociation so the radio stack picks up
/// the new gateway
pub type RestartHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub fn noop_restart_hook() -> RestartHook {
    Arc::new(|| async {}.boxed())
}

/// One row of `nmcli device wifi list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub active: bool,
    pub ssid: Vec<u8>,
    pub frequency: u32,
    pub signal: i32,
    pub bssid: String,
}

/// A scanned access point eligible for association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub identity: Vec<u8>,
    pub signal_strength: i32,
    pub frequency: u32,
    /// BSSID the connection profile is bound to
    pub handle: String,
}

impl PeerCandidate {
    pub fn ssid(&self) -> String {
        String::from_utf8_lossy(&self.identity).into_owned()
    }
}

impl From<&ScanEntry> for PeerCandidate {
    fn from(entry: &ScanEntry) -> Self {
        Self {
            identity: entry.ssid.clone(),
            signal_strength: entry.signal,
            frequency: entry.frequency,
            handle: entry.bssid.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionTimings {
    /// Wait between requesting a scan and reading its results
    pub scan_settle: Duration,
    pub address_poll_interval: Duration,
    pub address_poll_attempts: u32,
    /// Pause after requesting the radio-stack restart
    pub post_restart_delay: Duration,
    /// A valid association older than this triggers a fresh scan
    pub reassociate_after: Duration,
}

impl Default for SelectionTimings {
    fn default() -> Self {
        Self {
            scan_settle: Duration::from_secs(3),
            address_poll_interval: Duration::from_secs(5),
            address_poll_attempts: 10,
            post_restart_delay: Duration::from_secs(10),
            reassociate_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionSettings {
    pub iface: String,
    pub prefix: Vec<u8>,
    pub psk: String,
    pub frequency: u32,
    pub is_transport: bool,
    /// This node's own broadcast identity
    pub own_identity: Vec<u8>,
    pub min_strength: i32,
}

/// Last association made by the engine
#[derive(Debug, Clone, Default)]
pub struct AssociationRecord {
    pub ssid: Option<String>,
    pub associated_at: Option<Instant>,
    pub address: Option<Ipv4Assignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoCandidates,
    Associated {
        ssid: String,
        address: Ipv4Assignment,
    },
}

/// Parse `nmcli -t -f ACTIVE,SSID,FREQ,SIGNAL,BSSID device wifi list`
pub fn parse_wifi_list(output: &str) -> Vec<ScanEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = netinfo::split_terse(line);
            if fields.len() < 5 {
                debug!(line, "Skipping malformed scan row");
                return None;
            }
            let frequency = fields[2]
                .split_whitespace()
                .next()
                .and_then(|f| f.parse().ok())?;
            let signal = fields[3].trim().parse().ok()?;
            Some(ScanEntry {
                active: fields[0] == "yes",
                ssid: fields[1].as_bytes().to_vec(),
                frequency,
                signal,
                bssid: fields[4].clone(),
            })
        })
        .collect()
}

/// Entries carrying the network prefix, split into usable candidates and
/// prefix matches on the wrong frequency
pub fn partition_candidates(
    entries: &[ScanEntry],
    prefix: &[u8],
    frequency: u32,
) -> (Vec<PeerCandidate>, Vec<PeerCandidate>) {
    entries
        .iter()
        .filter(|e| e.ssid.starts_with(prefix))
        .map(PeerCandidate::from)
        .partition(|c| c.frequency == frequency)
}

/// Pick the candidate to associate with
pub fn select_candidate<'a>(
    candidates: &'a [PeerCandidate],
    is_transport: bool,
    own_identity: &[u8],
    min_strength: i32,
) -> Option<&'a PeerCandidate> {
    let mut ranked: Vec<&PeerCandidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));

    let mut chosen = *ranked.first()?;
    if is_transport && ranked.len() > 1 {
        let mut next = 1;
        while next < ranked.len()
            && chosen.identity.as_slice() <= own_identity
            && ranked[next].signal_strength > min_strength
        {
            chosen = ranked[next];
            next += 1;
        }
    }
    Some(chosen)
}

/// Whether the current association should be reconsidered
pub fn needs_reassociation(
    active: Option<&ScanEntry>,
    prefix: &[u8],
    since_last: Option<Duration>,
    reassociate_after: Duration,
) -> bool {
    let Some(active) = active else {
        return true;
    };
    if !active.ssid.starts_with(prefix) {
        return true;
    }
    match since_last {
        Some(elapsed) => elapsed > reassociate_after,
        None => true,
    }
}

/// Drop every `<ipv4> retcon.gateway` line and append the new gateway
pub fn rewrite_hosts(existing: &str, gateway: std::net::Ipv4Addr) -> String {
    let mut out = String::with_capacity(existing.len() + 32);
    for line in existing.lines() {
        if is_gateway_line(line) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&format!("{gateway} {GATEWAY_HOSTNAME}\n"));
    out
}

fn is_gateway_line(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    matches!(
        (tokens.next(), tokens.next(), tokens.next()),
        (Some(addr), Some(GATEWAY_HOSTNAME), None) if addr.parse::<std::net::Ipv4Addr>().is_ok()
    )
}

/// Scan, rank and associate on the client radio
pub struct PeerSelectionEngine {
    host: Host,
    settings: SelectionSettings,
    timings: SelectionTimings,
    restart_hook: RestartHook,
    record: Arc<RwLock<AssociationRecord>>,
}

impl PeerSelectionEngine {
    pub fn new(
        host: Host,
        settings: SelectionSettings,
        timings: SelectionTimings,
        restart_hook: RestartHook,
    ) -> Self {
        Self {
            host,
            settings,
            timings,
            restart_hook,
            record: Arc::new(RwLock::new(AssociationRecord::default())),
        }
    }

    pub fn settings(&self) -> &SelectionSettings {
        &self.settings
    }

    pub async fn record(&self) -> AssociationRecord {
        self.record.read().await.clone()
    }

    /// Current scan table without triggering a new scan
    pub async fn scan_list(&self) -> Vec<ScanEntry> {
        let cmd = Cmd::new("nmcli").args([
            "-t",
            "-f",
            "ACTIVE,SSID,FREQ,SIGNAL,BSSID",
            "device",
            "wifi",
            "list",
            "ifname",
            &self.settings.iface,
            "--rescan",
            "no",
        ]);
        match self.host.output(cmd).await {
            Some(out) => parse_wifi_list(&out.stdout),
            None => Vec::new(),
        }
    }

    pub async fn should_scan(&self) -> bool {
        let entries = self.scan_list().await;
        let active = entries.iter().find(|e| e.active);
        let since_last = self.record.read().await.associated_at.map(|t| t.elapsed());
        needs_reassociation(
            active,
            &self.settings.prefix,
            since_last,
            self.timings.reassociate_after,
        )
    }

    /// One scan / select / associate cycle
    pub async fn run_cycle(&self) -> Result<CycleOutcome, LinkError> {
        let iface = self.settings.iface.clone();

        self.host
            .run(
                Cmd::new("nmcli")
                    .args(["device", "wifi", "rescan", "ifname", &iface])
                    .may_fail(),
                false,
            )
            .await?;
        tokio::time::sleep(self.timings.scan_settle).await;

        let entries = self.scan_list().await;
        let (candidates, mismatched) =
            partition_candidates(&entries, &self.settings.prefix, self.settings.frequency);
        for c in &mismatched {
            warn!(
                ssid = %c.ssid(),
                frequency = c.frequency,
                expected = self.settings.frequency,
                "Node access point on the wrong frequency, ignoring"
            );
        }

        let Some(chosen) = select_candidate(
            &candidates,
            self.settings.is_transport,
            &self.settings.own_identity,
            self.settings.min_strength,
        ) else {
            debug!(iface = %iface, "No node access points in range");
            return Ok(CycleOutcome::NoCandidates);
        };
        let chosen = chosen.clone();
        let ssid = chosen.ssid();
        info!(
            ssid = %ssid,
            signal = chosen.signal_strength,
            candidates = candidates.len(),
            "Selected peer"
        );

        if let Some(active) = entries.iter().find(|e| e.active) {
            if active.ssid != chosen.identity {
                self.disconnect().await?;
            }
        }

        self.associate(&chosen).await?;

        let Some(address) = self.wait_for_address().await else {
            self.disconnect().await?;
            return Err(LinkError::Selection(format!(
                "no IPv4 address on {iface} after {} attempts",
                self.timings.address_poll_attempts
            )));
        };

        let hosts = self.host.read_or_empty(HOSTS_PATH).await?;
        self.host
            .rewrite(HOSTS_PATH, &rewrite_hosts(&hosts, address.gateway()))
            .await?;
        info!(ssid = %ssid, address = %address, gateway = %address.gateway(), "Associated");

        *self.record.write().await = AssociationRecord {
            ssid: Some(ssid.clone()),
            associated_at: Some(Instant::now()),
            address: Some(address),
        };

        info!("Restarting radio stack for new gateway");
        (self.restart_hook)().await;
        tokio::time::sleep(self.timings.post_restart_delay).await;

        Ok(CycleOutcome::Associated { ssid, address })
    }

    /// Runs until aborted
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        info!(iface = %self.settings.iface, "Scan loop started");
        loop {
            if self.should_scan().await {
                match self.run_cycle().await {
                    Ok(CycleOutcome::Associated { ssid, .. }) => {
                        debug!(ssid = %ssid, "Scan cycle associated");
                    }
                    Ok(CycleOutcome::NoCandidates) => {}
                    Err(e) => warn!(error = %e, "Peer selection failed, retrying next scan"),
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn disconnect(&self) -> Result<bool, LinkError> {
        self.host
            .run(
                Cmd::new("nmcli").args(["device", "disconnect", &self.settings.iface]),
                false,
            )
            .await
    }

    async fn associate(&self, chosen: &PeerCandidate) -> Result<(), LinkError> {
        let iface = &self.settings.iface;
        let ssid = chosen.ssid();

        self.host
            .run(
                Cmd::new("nmcli")
                    .args(["connection", "delete", CONNECTION_ID])
                    .may_fail(),
                false,
            )
            .await?;

        self.host
            .run(
                Cmd::new("nmcli").args([
                    "connection",
                    "add",
                    "type",
                    "wifi",
                    "con-name",
                    CONNECTION_ID,
                    "ifname",
                    iface,
                    "ssid",
                    &ssid,
                    "autoconnect",
                    "no",
                    "802-11-wireless.mode",
                    "infrastructure",
                    "802-11-wireless.bssid",
                    &chosen.handle,
                    "wifi-sec.key-mgmt",
                    "wpa-psk",
                    "wifi-sec.auth-alg",
                    "open",
                    "wifi-sec.psk",
                    &self.settings.psk,
                    "ipv4.method",
                    "auto",
                    "ipv6.method",
                    "auto",
                ]),
                true,
            )
            .await?;

        self.host
            .run(
                Cmd::new("nmcli").args(["connection", "up", CONNECTION_ID, "ifname", iface]),
                true,
            )
            .await?;
        Ok(())
    }

    async fn wait_for_address(&self) -> Option<Ipv4Assignment> {
        for attempt in 1..=self.timings.address_poll_attempts {
            tokio::time::sleep(self.timings.address_poll_interval).await;
            if let Some(address) = netinfo::ipv4_of(&self.host, &self.settings.iface).await {
                return Some(address);
            }
            debug!(attempt, "No address yet");
        }
        None
    }
}
