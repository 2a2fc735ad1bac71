//! 2.4 GHz channel plan and IBSS cell identifiers

use sha2::{Digest, Sha256};

pub const DEFAULT_CHANNEL: u8 = 11;
pub const DEFAULT_FREQUENCY: u32 = 2462;

const CHANNELS: [(u8, u32); 14] = [
    (1, 2412),
    (2, 2417),
    (3, 2422),
    (4, 2427),
    (5, 2432),
    (6, 2437),
    (7, 2442),
    (8, 2447),
    (9, 2452),
    (10, 2457),
    (11, 2462),
    (12, 2467),
    (13, 2472),
    (14, 2484),
];

/// Channel for a frequency in MHz, channel 11 when unknown
pub fn freq_to_channel(freq: u32) -> u8 {
    CHANNELS
        .iter()
        .find(|(_, f)| *f == freq)
        .map(|(c, _)| *c)
        .unwrap_or(DEFAULT_CHANNEL)
}

/// Frequency in MHz for a channel, 2462 when unknown
pub fn channel_to_freq(channel: u8) -> u32 {
    CHANNELS
        .iter()
        .find(|(c, _)| *c == channel)
        .map(|(_, f)| *f)
        .unwrap_or(DEFAULT_FREQUENCY)
}

/// Deterministic IBSS cell id for a network name: `02:` (locally
/// administered) followed by the first five bytes of SHA-256(essid).
pub fn cell_id(essid: &str) -> String {
    let digest = Sha256::digest(essid.as_bytes());
    let mut id = String::from("02");
    for byte in &digest[..5] {
        id.push_str(&format!(":{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_frequency_table() {
        for (channel, freq) in CHANNELS {
            assert_eq!(freq_to_channel(freq), channel);
            assert_eq!(channel_to_freq(channel), freq);
        }
        assert_eq!(freq_to_channel(2462), 11);
        assert_eq!(channel_to_freq(14), 2484);
    }

    #[test]
    fn test_unknown_values_fall_back_to_channel_11() {
        assert_eq!(freq_to_channel(5180), 11);
        assert_eq!(freq_to_channel(0), 11);
        assert_eq!(channel_to_freq(36), 2462);
        assert_eq!(channel_to_freq(0), 2462);
    }

    #[test]
    fn test_cell_id_is_deterministic() {
        assert_eq!(cell_id("RETCON-MESH"), "02:7d:bd:1f:7a:7d");
        assert_eq!(cell_id("TEST-MESH"), "02:c1:1e:d8:2d:6b");
        assert_eq!(cell_id("RETCON-MESH"), cell_id("RETCON-MESH"));
        assert_ne!(cell_id("RETCON-MESH"), cell_id("TEST-MESH"));
    }

    #[test]
    fn test_cell_id_shape() {
        let id = cell_id("anything");
        assert!(id.starts_with("02:"));
        assert_eq!(id.len(), 17);
        assert_eq!(id.split(':').count(), 6);
    }
}
