//! Shared fixtures: a scripted command runner and a fake sysfs tree

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use retcon_node::{Cmd, CmdOutput, CommandRunner, Host, LinkError};

/// Records every command line and answers from prefix rules. Commands with
/// no matching rule succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, CmdOutput)>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer commands starting with `prefix`; the latest rule wins
    pub fn respond(&self, prefix: &str, output: CmdOutput) {
        self.rules
            .lock()
            .unwrap()
            .insert(0, (prefix.to_string(), output));
    }

    pub fn stdout(&self, prefix: &str, stdout: &str) {
        self.respond(prefix, CmdOutput::ok(stdout));
    }

    pub fn fail(&self, prefix: &str) {
        self.respond(prefix, CmdOutput::failed(1, "scripted failure"));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, line: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == line)
    }

    pub fn called_starting_with(&self, prefix: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c.starts_with(prefix))
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &Cmd) -> Result<CmdOutput, LinkError> {
        let line = cmd.line();
        self.calls.lock().unwrap().push(line.clone());

        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CmdOutput::ok("")))
    }
}

pub fn host(runner: &Arc<FakeRunner>, root: &Path) -> Host {
    Host::new(runner.clone(), root)
}

pub fn write(root: &Path, absolute: &str, contents: &str) {
    let path = root.join(absolute.trim_start_matches('/'));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// `/sys/class/net/<name>` with flags and a hardware address
pub fn net_iface(root: &Path, name: &str, up: bool, mac: &str) {
    write(
        root,
        &format!("/sys/class/net/{name}/flags"),
        if up { "0x1003\n" } else { "0x1002\n" },
    );
    write(root, &format!("/sys/class/net/{name}/address"), &format!("{mac}\n"));
}

pub fn load_batman_module(root: &Path) {
    std::fs::create_dir_all(root.join("sys/module/batman_adv")).unwrap();
}

pub fn unload_batman_module(root: &Path) {
    std::fs::remove_dir_all(root.join("sys/module/batman_adv")).unwrap();
}

/// A healthy batman-adv mesh on `mesh_iface`
pub fn healthy_mesh(root: &Path, runner: &FakeRunner, mesh_iface: &str) {
    load_batman_module(root);
    net_iface(root, mesh_iface, true, "b8:27:eb:aa:bb:cc");
    write(
        root,
        &format!("/sys/class/net/{mesh_iface}/batman_adv/mesh_iface"),
        "bat0\n",
    );
    net_iface(root, "bat0", true, "b8:27:eb:12:34:56");
    runner.stdout(
        &format!("iw dev {mesh_iface} info"),
        &format!("Interface {mesh_iface}\n\tifindex 4\n\ttype IBSS\n\twiphy 1\n"),
    );
    runner.stdout(
        "batctl o",
        "[B.A.T.M.A.N. adv 2022.0, MainIF/MAC: wlan1/b8:27:eb:aa:bb:cc (bat0/b8:27:eb:12:34:56 BATMAN_IV)]\n   Originator        last-seen (#/255) Nexthop           [outgoingIF]\n * b8:27:eb:01:02:03    0.420s   (255) b8:27:eb:01:02:03 [     wlan1]\n * b8:27:eb:04:05:06    0.910s   (230) b8:27:eb:04:05:06 [     wlan1]\n",
    );
}

pub const CLIENT_PROFILE: &str = r#"
[node]
mode = "client"
ssid = "RETCONnode"

[wifi]
prefix = "RETCON"
psk = "meshpass"
freq = 2462
client_iface = "wlan0"
ap_iface = "uap0"
mesh_iface = "wlan1"

[supervisor]
max_recovery_attempts = 2
settle_delay_ms = 0

[plugins.batman_mesh]
[plugins.wifi_mesh]
[plugins.bluetooth_pan]
"#;

pub const TRANSPORT_PROFILE: &str = r#"
[node]
mode = "transport"
ssid = "RETCONtransport"

[wifi]
prefix = "RETCON"
psk = "meshpass"
freq = 2462
mesh_iface = "wlan1"

[supervisor]
settle_delay_ms = 0

[plugins.batman_mesh]
essid = "TEST-MESH"
[plugins.bluetooth_pan]
[plugins.usb_autodetect]
"#;
