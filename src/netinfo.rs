//! Typed reads of interface and neighbour state
//!
//! Each query is a command or sysfs read followed by an explicit parse step.
//! The parse steps are pure functions so they can be tested against captured
//! output.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::exec::Cmd;
use crate::host::Host;

/// Bound on read-only query commands
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// IFF_UP
const IFF_UP: u32 = 0x1;

/// An IPv4 address with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Ipv4Assignment {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Assignment {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Gateway of the subnet: the first three octets with a final `.1`.
    /// Node access points hand out leases from `x.y.z.0/24` and sit on
    /// `.1`; zeroing the last octet would give the network address instead.
    pub fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.addr.octets();
        Ipv4Addr::new(a, b, c, 1)
    }
}

impl fmt::Display for Ipv4Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// First `inet a.b.c.d/nn` of `ip -o -4 addr show` output
pub fn parse_ipv4_assignment(output: &str) -> Option<Ipv4Assignment> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        let (addr, prefix) = tokens.next()?.split_once('/')?;
        Some(Ipv4Assignment::new(addr.parse().ok()?, prefix.parse().ok()?))
    })
}

/// `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Originators listed by `batctl o`, excluding its two header lines
pub fn count_originators(output: &str) -> usize {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return 0;
    }
    trimmed.lines().count().saturating_sub(2)
}

/// Devices listed by `bluetoothctl devices Connected`
pub fn count_connected_devices(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("Device "))
        .count()
}

/// Whether a `/sys/class/net/<if>/flags` value has IFF_UP set
pub fn flags_up(flags: &str) -> bool {
    let flags = flags.trim();
    let digits = flags.strip_prefix("0x").unwrap_or(flags);
    u32::from_str_radix(digits, 16)
        .map(|f| f & IFF_UP != 0)
        .unwrap_or(false)
}

/// The `type` line of `iw dev <if> info`
pub fn parse_iw_type(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("type ")
            .map(|t| t.trim().to_string())
    })
}

/// Split one line of `nmcli -t` output into fields. `\:` is a literal colon
/// and `\\` a literal backslash.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

pub async fn interface_exists(host: &Host, iface: &str) -> bool {
    host.exists(&format!("/sys/class/net/{iface}"))
}

pub async fn interface_up(host: &Host, iface: &str) -> bool {
    host.read_trimmed(&format!("/sys/class/net/{iface}/flags"))
        .await
        .map(|flags| flags_up(&flags))
        .unwrap_or(false)
}

pub async fn mac_of(host: &Host, iface: &str) -> Option<[u8; 6]> {
    let text = host
        .read_trimmed(&format!("/sys/class/net/{iface}/address"))
        .await?;
    parse_mac(&text)
}

pub async fn ipv4_of(host: &Host, iface: &str) -> Option<Ipv4Assignment> {
    let output = host
        .output(
            Cmd::new("ip")
                .args(["-o", "-4", "addr", "show", "dev", iface])
                .timeout(QUERY_TIMEOUT),
        )
        .await?;
    parse_ipv4_assignment(&output.stdout)
}

pub async fn originator_count(host: &Host) -> Option<usize> {
    let output = host
        .output(Cmd::new("batctl").arg("o").timeout(QUERY_TIMEOUT))
        .await?;
    Some(count_originators(&output.stdout))
}
