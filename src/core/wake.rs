//! Wake-on-LAN magic packets.

use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::core::models::WakeOnLan;
use crate::core::plugin::PluginError;

const MAGIC_PACKET_SIZE: usize = 102;

/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` and `AABBCCDDEEFF`.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], PluginError> {
    let cleaned: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let separators_ok = mac
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-');
    if cleaned.len() != 12 || !separators_ok {
        return Err(PluginError::Wake(format!("invalid MAC address '{}'", mac)));
    }

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        let hex = &cleaned[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(hex, 16)
            .map_err(|_| PluginError::Wake(format!("invalid MAC address '{}'", mac)))?;
    }
    Ok(out)
}

/// Six `0xFF` bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: &[u8; 6]) -> [u8; MAGIC_PACKET_SIZE] {
    let mut packet = [0xFFu8; MAGIC_PACKET_SIZE];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(mac);
    }
    packet
}

pub async fn send_magic_packet(wol: &WakeOnLan) -> Result<(), PluginError> {
    let mac = parse_mac(&wol.mac)?;
    let packet = magic_packet(&mac);
    let destination = format!("{}:{}", wol.broadcast, wol.port);

    debug!(mac = %wol.mac, destination = %destination, "Sending magic packet");

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.send_to(&packet, &destination).await?;

    info!(mac = %wol.mac, destination = %destination, "Wake-on-LAN packet sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_mac_spellings() {
        let expected = [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03];
        assert_eq!(parse_mac("AA:BB:CC:01:02:03").unwrap(), expected);
        assert_eq!(parse_mac("aa-bb-cc-01-02-03").unwrap(), expected);
        assert_eq!(parse_mac("aabbcc010203").unwrap(), expected);
    }

    #[test]
    fn rejects_malformed_mac() {
        assert!(parse_mac("AA:BB:CC").is_err());
        assert!(parse_mac("GG:BB:CC:01:02:03").is_err());
        assert!(parse_mac("AA BB CC 01 02 03").is_err());
    }

    #[test]
    fn packet_layout() {
        let mac = [1, 2, 3, 4, 5, 6];
        let packet = magic_packet(&mac);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        assert_eq!(&packet[6..12], &mac);
        assert_eq!(&packet[96..], &mac);
    }
}
