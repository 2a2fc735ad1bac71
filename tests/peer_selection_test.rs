//! Peer selection cycles against a scripted nmcli

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::FakeRunner;
use futures::FutureExt;
use retcon_node::peer::{
    CycleOutcome, PeerSelectionEngine, SelectionSettings, SelectionTimings, CONNECTION_ID,
};
use retcon_node::{LinkError, RestartHook};
use tempfile::TempDir;

const LIST: &str = "nmcli -t -f ACTIVE,SSID,FREQ,SIGNAL,BSSID device wifi list ifname wlan0";
const ADDRESS: &str = "ip -o -4 addr show dev wlan0";

fn instant_timings() -> SelectionTimings {
    SelectionTimings {
        scan_settle: Duration::ZERO,
        address_poll_interval: Duration::ZERO,
        address_poll_attempts: 3,
        post_restart_delay: Duration::ZERO,
        reassociate_after: Duration::from_secs(600),
    }
}

fn settings(is_transport: bool, own_identity: &str) -> SelectionSettings {
    SelectionSettings {
        iface: "wlan0".to_string(),
        prefix: b"RETCON".to_vec(),
        psk: "meshpass".to_string(),
        frequency: 2462,
        is_transport,
        own_identity: own_identity.as_bytes().to_vec(),
        min_strength: 33,
    }
}

fn counting_hook() -> (RestartHook, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let hook: RestartHook = Arc::new(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    });
    (hook, count)
}

fn engine(
    runner: &Arc<FakeRunner>,
    dir: &TempDir,
    settings: SelectionSettings,
    hook: RestartHook,
) -> PeerSelectionEngine {
    PeerSelectionEngine::new(
        common::host(runner, dir.path()),
        settings,
        instant_timings(),
        hook,
    )
}

#[tokio::test]
async fn test_cycle_associates_with_strongest_node() {
    let dir = TempDir::new().unwrap();
    common::write(
        dir.path(),
        "/etc/hosts",
        "127.0.0.1 localhost\n10.42.0.1 retcon.gateway\n",
    );
    let runner = FakeRunner::new();
    runner.stdout(
        LIST,
        "no:RETCONalpha:2462 MHz:40:AA\\:BB\\:CC\\:00\\:00\\:01\n\
         no:RETCONbeta:2462 MHz:71:AA\\:BB\\:CC\\:00\\:00\\:02\n\
         no:RETCONfar:2437 MHz:90:AA\\:BB\\:CC\\:00\\:00\\:03\n\
         no:HomeWifi:2462 MHz:99:AA\\:BB\\:CC\\:00\\:00\\:04\n",
    );
    runner.stdout(
        ADDRESS,
        "4: wlan0    inet 10.42.7.23/24 brd 10.42.7.255 scope global dynamic wlan0\n",
    );
    let (hook, restarts) = counting_hook();

    let engine = engine(&runner, &dir, settings(false, "RETCONme"), hook);
    let outcome = engine.run_cycle().await.unwrap();

    match outcome {
        CycleOutcome::Associated { ssid, address } => {
            assert_eq!(ssid, "RETCONbeta");
            assert_eq!(address.to_string(), "10.42.7.23/24");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(runner.called("nmcli device wifi rescan ifname wlan0"));
    assert!(runner.called(&format!("nmcli connection delete {CONNECTION_ID}")));
    assert!(runner.calls().iter().any(|c| {
        c.starts_with("nmcli connection add")
            && c.contains("ssid RETCONbeta")
            && c.contains("802-11-wireless.bssid AA:BB:CC:00:00:02")
            && c.contains("wifi-sec.psk meshpass")
    }));
    assert!(runner.called(&format!("nmcli connection up {CONNECTION_ID} ifname wlan0")));
    // nothing was active, nothing to drop
    assert!(!runner.called("nmcli device disconnect wlan0"));

    let hosts = std::fs::read_to_string(dir.path().join("etc/hosts")).unwrap();
    assert_eq!(hosts, "127.0.0.1 localhost\n10.42.7.1 retcon.gateway\n");

    assert_eq!(restarts.load(Ordering::SeqCst), 1);
    let record = engine.record().await;
    assert_eq!(record.ssid.as_deref(), Some("RETCONbeta"));
    assert!(record.associated_at.is_some());
}

#[tokio::test]
async fn test_cycle_without_candidates_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(LIST, "yes:HomeWifi:2462 MHz:80:AA\\:BB\\:CC\\:00\\:00\\:04\n");
    let (hook, restarts) = counting_hook();

    let engine = engine(&runner, &dir, settings(false, "RETCONme"), hook);
    assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::NoCandidates);

    assert!(!runner.called_starting_with("nmcli connection"));
    assert!(!runner.called("nmcli device disconnect wlan0"));
    assert_eq!(restarts.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("etc/hosts").exists());
}

#[tokio::test]
async fn test_cycle_without_address_disconnects() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(LIST, "no:RETCONbeta:2462 MHz:71:AA\\:BB\\:CC\\:00\\:00\\:02\n");
    let (hook, restarts) = counting_hook();

    let engine = engine(&runner, &dir, settings(false, "RETCONme"), hook);
    let err = engine.run_cycle().await.unwrap_err();

    assert!(matches!(err, LinkError::Selection(_)));
    assert!(runner.called("nmcli device disconnect wlan0"));
    assert_eq!(
        runner.calls().iter().filter(|c| c.as_str() == ADDRESS).count(),
        3
    );
    assert_eq!(restarts.load(Ordering::SeqCst), 0);
    assert!(engine.record().await.ssid.is_none());
}

#[tokio::test]
async fn test_cycle_drops_other_active_node_first() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(
        LIST,
        "yes:RETCONalpha:2462 MHz:30:AA\\:BB\\:CC\\:00\\:00\\:01\n\
         no:RETCONbeta:2462 MHz:71:AA\\:BB\\:CC\\:00\\:00\\:02\n",
    );
    runner.stdout(ADDRESS, "4: wlan0    inet 10.43.1.9/24 scope global wlan0\n");
    let (hook, _) = counting_hook();

    let engine = engine(&runner, &dir, settings(false, "RETCONme"), hook);
    engine.run_cycle().await.unwrap();

    let calls = runner.calls();
    let disconnect = calls
        .iter()
        .position(|c| c == "nmcli device disconnect wlan0")
        .unwrap();
    let add = calls
        .iter()
        .position(|c| c.starts_with("nmcli connection add"))
        .unwrap();
    assert!(disconnect < add);
}

#[tokio::test]
async fn test_transport_skips_lower_identity_when_alternative_is_strong() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(
        LIST,
        "no:RETCONA:2462 MHz:80:AA\\:BB\\:CC\\:00\\:00\\:0A\n\
         no:RETCONZ:2462 MHz:70:AA\\:BB\\:CC\\:00\\:00\\:0Z\n",
    );
    runner.stdout(ADDRESS, "4: wlan0    inet 10.44.0.5/24 scope global wlan0\n");
    let (hook, _) = counting_hook();

    let engine = engine(&runner, &dir, settings(true, "RETCONM"), hook);
    match engine.run_cycle().await.unwrap() {
        CycleOutcome::Associated { ssid, .. } => assert_eq!(ssid, "RETCONZ"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_should_scan_until_associated() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(LIST, "yes:RETCONbeta:2462 MHz:71:AA\\:BB\\:CC\\:00\\:00\\:02\n");
    runner.stdout(ADDRESS, "4: wlan0    inet 10.42.7.23/24 scope global wlan0\n");
    let (hook, _) = counting_hook();

    let engine = engine(&runner, &dir, settings(false, "RETCONme"), hook);
    // active on a node network but never associated by us
    assert!(engine.should_scan().await);

    engine.run_cycle().await.unwrap();
    assert!(!engine.should_scan().await);

    runner.stdout(LIST, "yes:HomeWifi:2462 MHz:99:AA\\:BB\\:CC\\:00\\:00\\:04\n");
    assert!(engine.should_scan().await);
}

#[tokio::test(start_paused = true)]
async fn test_scan_loop_keeps_retrying_without_address() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.stdout(LIST, "no:RETCONbeta:2462 MHz:71:AA\\:BB\\:CC\\:00\\:00\\:02\n");
    let (hook, restarts) = counting_hook();

    let engine = Arc::new(PeerSelectionEngine::new(
        common::host(&runner, dir.path()),
        settings(false, "RETCONme"),
        SelectionTimings {
            scan_settle: Duration::from_secs(1),
            address_poll_interval: Duration::from_secs(1),
            address_poll_attempts: 2,
            ..instant_timings()
        },
        hook,
    ));
    let scan_loop = tokio::spawn(engine.clone().run_loop(Duration::from_secs(5)));

    // each failed cycle takes 1s settle + 2s polling, then waits 5s
    tokio::time::sleep(Duration::from_secs(60)).await;

    let activate = format!("nmcli connection up {CONNECTION_ID} ifname wlan0");
    let activations = |calls: &[String]| calls.iter().filter(|c| **c == activate).count();
    let attempts = activations(&runner.calls());
    assert!(attempts >= 5, "only {attempts} association attempts");
    assert_eq!(
        runner
            .calls()
            .iter()
            .filter(|c| c.as_str() == "nmcli device disconnect wlan0")
            .count(),
        attempts
    );
    assert!(!scan_loop.is_finished());
    assert_eq!(restarts.load(Ordering::SeqCst), 0);
    assert!(engine.record().await.ssid.is_none());

    // still going
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(activations(&runner.calls()) > attempts);
    assert!(!scan_loop.is_finished());

    scan_loop.abort();
}
