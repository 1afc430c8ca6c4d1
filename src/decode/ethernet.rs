//! Ethernet frame parsing: MAC addresses, VLAN/QinQ tags, EtherType.

use std::fmt;
use serde::{Deserialize, Serialize, Serializer, Deserializer};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100; // 802.1Q
pub const ETHERTYPE_QINQ: u16 = 0x88A8; // 802.1ad outer
pub const ETHERTYPE_QINQ_ALT: u16 = 0x9100;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const MIN_FRAME_SIZE: usize = 14;

/// A 6-byte hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() == 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(slice);
            Some(Self(bytes))
        } else {
            None
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(serde::de::Error::custom("invalid MAC address format"));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| serde::de::Error::custom("invalid MAC address byte"))?;
        }
        Ok(MacAddr(bytes))
    }
}

/// Result of walking the Ethernet + VLAN framing: the two MAC addresses, the
/// EtherType of the first non-tag layer, and the byte offset where it starts.
pub struct EthernetInfo {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: u16,
    pub vlan_id: Option<u16>,
    pub offset: usize,
}

/// Walk an Ethernet header, consuming any 802.1Q/802.1ad tags, and return the
/// EtherType and offset of the first payload layer.
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetInfo> {
    if data.len() < MIN_FRAME_SIZE {
        return None;
    }

    let dst_mac = MacAddr::from_slice(&data[0..6])?;
    let src_mac = MacAddr::from_slice(&data[6..12])?;
    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut offset = 14;
    let mut vlan_id = None;

    match ethertype {
        ETHERTYPE_QINQ | ETHERTYPE_QINQ_ALT => {
            if data.len() < offset + 4 {
                return None;
            }
            let outer_tci = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let inner_ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
            if inner_ethertype == ETHERTYPE_VLAN {
                if data.len() < offset + 4 {
                    return None;
                }
                let inner_tci = u16::from_be_bytes([data[offset], data[offset + 1]]);
                ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                offset += 4;
                vlan_id = Some(inner_tci & 0x0FFF);
            } else {
                ethertype = inner_ethertype;
                vlan_id = Some(outer_tci & 0x0FFF);
            }
        }
        ETHERTYPE_VLAN => {
            if data.len() < offset + 4 {
                return None;
            }
            let tci = u16::from_be_bytes([data[offset], data[offset + 1]]);
            ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
            vlan_id = Some(tci & 0x0FFF);
        }
        _ => {}
    }

    Some(EthernetInfo { src_mac, dst_mac, ethertype, vlan_id, offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ipv4_header() {
        let data = vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x08, 0x00,
        ];
        let info = parse_ethernet(&data).unwrap();
        assert!(info.dst_mac.is_broadcast());
        assert_eq!(info.src_mac.to_string(), "00:11:22:33:44:55");
        assert_eq!(info.ethertype, ETHERTYPE_IPV4);
        assert_eq!(info.offset, 14);
        assert!(info.vlan_id.is_none());
    }

    #[test]
    fn parses_vlan_tagged_frame() {
        let data = vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x81, 0x00,
            0x00, 0x64,
            0x08, 0x00,
        ];
        let info = parse_ethernet(&data).unwrap();
        assert_eq!(info.vlan_id, Some(100));
        assert_eq!(info.ethertype, ETHERTYPE_IPV4);
        assert_eq!(info.offset, 18);
    }

    #[test]
    fn rejects_short_frame() {
        let data = vec![0xff, 0xff, 0xff];
        assert!(parse_ethernet(&data).is_none());
    }
}
