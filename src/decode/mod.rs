//! Protocol classification and packet summarization (C2, §4.2).
//!
//! Two pure functions, [`parse`] and [`extract_flow_tuple`], walk a
//! [`Frame`](crate::frame::Frame) from the link layer up. Malformed frames
//! never fail: a best-effort summary with `protocol="unknown"` is always
//! produced, and the flow tuple's `valid` flag is the only signal that the
//! network/transport layers were absent or unparseable.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod transport;

use std::net::IpAddr;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, LinkType};
use ethernet::{parse_ethernet, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use ipv4::parse_ipv4;
use ipv6::parse_ipv6;
use transport::{parse_transport, sniff_application_protocol, TcpFlags};

/// An address a [`PacketSummary`] can point at: an IP (optionally with a
/// transport port) for network traffic, or a MAC for link-layer-only frames
/// like ARP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Endpoint {
    fn ip(addr: IpAddr, port: Option<u16>) -> Self {
        Self { address: addr.to_string(), port }
    }

    fn mac(addr: ethernet::MacAddr) -> Self {
        Self { address: addr.to_string(), port: None }
    }
}

/// Per-packet event record (§3 `PacketSummary`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketSummary {
    pub index: u64,
    /// Seconds elapsed since the session's first packet.
    pub time_offset: f64,
    pub src: Option<Endpoint>,
    pub dst: Option<Endpoint>,
    pub protocol: String,
    pub length: u32,
    pub info: String,
    pub flow_id: Option<u64>,
    pub stream_id: Option<u64>,
}

/// §3 `FlowTuple`. `valid=false` whenever L3 or L4 is absent (e.g. ARP).
#[derive(Debug, Clone, Copy)]
pub struct FlowTuple {
    pub valid: bool,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub l4_protocol: u8,
    pub tcp_flags: TcpFlags,
    pub tcp_seq: Option<u32>,
    pub tcp_payload_len: u32,
}

impl FlowTuple {
    fn invalid() -> Self {
        Self {
            valid: false,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            l4_protocol: 0,
            tcp_flags: TcpFlags::default(),
            tcp_seq: None,
            tcp_payload_len: 0,
        }
    }
}

struct L3L4<'a> {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: u8,
    transport: Option<transport::TransportInfo<'a>>,
}

fn decode_l3(ethertype: u16, payload: &[u8]) -> Option<L3L4<'_>> {
    match ethertype {
        ETHERTYPE_IPV4 => {
            let ip = parse_ipv4(payload)?;
            let transport = payload
                .get(ip.header_length..)
                .and_then(|rest| parse_transport(ip.protocol, rest));
            Some(L3L4 {
                src_ip: IpAddr::V4(ip.src_ip),
                dst_ip: IpAddr::V4(ip.dst_ip),
                protocol: ip.protocol,
                transport,
            })
        }
        ETHERTYPE_IPV6 => {
            let ip = parse_ipv6(payload)?;
            let transport = payload
                .get(ipv6::FIXED_HEADER_LEN..)
                .and_then(|rest| parse_transport(ip.next_header, rest));
            Some(L3L4 {
                src_ip: IpAddr::V6(ip.src_ip),
                dst_ip: IpAddr::V6(ip.dst_ip),
                protocol: ip.next_header,
                transport,
            })
        }
        _ => None,
    }
}

/// Name a packet's protocol. A TCP/UDP segment is named for its
/// application-layer protocol only when the payload itself carries evidence
/// of one (§8 scenario 2: a bare UDP datagram on port 53 with no DNS message
/// in it is still `"UDP"`, not `"DNS"`).
fn protocol_name(l3_protocol: u8, transport: Option<&transport::TransportInfo>) -> String {
    if let Some(name) = transport.and_then(|t| sniff_application_protocol(t.payload)) {
        return name.to_string();
    }
    ipv4::protocol_name(l3_protocol).to_string()
}

fn build_info(l3: &L3L4, protocol: &str) -> String {
    match &l3.transport {
        Some(t) if l3.protocol == ipv4::protocol::TCP => {
            let flags = t.tcp_flags.unwrap_or_default();
            format!(
                "{} → {} {} seq={} ack={} win={}",
                t.src_port.unwrap_or(0),
                t.dst_port.unwrap_or(0),
                flags,
                t.tcp_seq.unwrap_or(0),
                t.tcp_ack.unwrap_or(0),
                t.tcp_window.unwrap_or(0),
            )
        }
        Some(t) if l3.protocol == ipv4::protocol::UDP => {
            format!("{} → {} len={}", t.src_port.unwrap_or(0), t.dst_port.unwrap_or(0), t.payload_size)
        }
        _ => format!("{} {} → {}", protocol, l3.src_ip, l3.dst_ip),
    }
}

/// Classify a frame and extract its per-packet summary.
///
/// `session_start` is the timestamp of the session's first packet; the
/// caller (the engine) is responsible for pinning it on the first packet so
/// that packet's own `time_offset` comes out as zero.
pub fn parse(frame: &Frame, index: u64, session_start: chrono::DateTime<chrono::Utc>) -> PacketSummary {
    let time_offset = (frame.capture_time - session_start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
    let length = frame.wire_length;

    if !matches!(frame.link_type, LinkType::Ethernet) {
        return PacketSummary {
            index,
            time_offset,
            src: None,
            dst: None,
            protocol: "unknown".to_string(),
            length,
            info: "unsupported link type".to_string(),
            flow_id: None,
            stream_id: None,
        };
    }

    let eth = match parse_ethernet(&frame.data) {
        Some(e) => e,
        None => {
            return PacketSummary {
                index,
                time_offset,
                src: None,
                dst: None,
                protocol: "unknown".to_string(),
                length,
                info: "malformed frame".to_string(),
                flow_id: None,
                stream_id: None,
            }
        }
    };

    if eth.ethertype == ETHERTYPE_ARP {
        return PacketSummary {
            index,
            time_offset,
            src: Some(Endpoint::mac(eth.src_mac)),
            dst: Some(Endpoint::mac(eth.dst_mac)),
            protocol: "ARP".to_string(),
            length,
            info: format!("who-has/is-at {} → {}", eth.src_mac, eth.dst_mac),
            flow_id: None,
            stream_id: None,
        };
    }

    let payload = &frame.data[eth.offset.min(frame.data.len())..];
    let l3 = match decode_l3(eth.ethertype, payload) {
        Some(l3) => l3,
        None => {
            return PacketSummary {
                index,
                time_offset,
                src: None,
                dst: None,
                protocol: "unknown".to_string(),
                length,
                info: "unrecognized network layer".to_string(),
                flow_id: None,
                stream_id: None,
            }
        }
    };

    let (src_port, dst_port) = l3
        .transport
        .as_ref()
        .map(|t| (t.src_port, t.dst_port))
        .unwrap_or((None, None));
    let protocol = protocol_name(l3.protocol, l3.transport.as_ref());
    let info = build_info(&l3, &protocol);

    PacketSummary {
        index,
        time_offset,
        src: Some(Endpoint::ip(l3.src_ip, src_port)),
        dst: Some(Endpoint::ip(l3.dst_ip, dst_port)),
        protocol,
        length,
        info,
        flow_id: None,
        stream_id: None,
    }
}

/// Extract the raw TCP payload bytes of a frame, for the stream manager's
/// reassembly feed. Returns `None` whenever [`extract_flow_tuple`] would
/// report `valid=false`, or the transport layer isn't TCP.
pub fn extract_tcp_payload(frame: &Frame) -> Option<&[u8]> {
    if !matches!(frame.link_type, LinkType::Ethernet) {
        return None;
    }
    let eth = parse_ethernet(&frame.data)?;
    let payload = frame.data.get(eth.offset..)?;

    let (ip_header_len, protocol, l4_payload) = match eth.ethertype {
        ETHERTYPE_IPV4 => {
            let ip = parse_ipv4(payload)?;
            (ip.header_length, ip.protocol, payload.get(ip.header_length..)?)
        }
        ETHERTYPE_IPV6 => {
            let ip = parse_ipv6(payload)?;
            (ipv6::FIXED_HEADER_LEN, ip.next_header, payload.get(ipv6::FIXED_HEADER_LEN..)?)
        }
        _ => return None,
    };
    let _ = ip_header_len;
    if protocol != ipv4::protocol::TCP {
        return None;
    }
    if l4_payload.len() < 20 {
        return None;
    }
    let data_offset = ((l4_payload[12] >> 4) & 0x0F) as usize * 4;
    l4_payload.get(data_offset..)
}

/// Extract the L3/L4 flow tuple used by the flow tracker and stream manager.
/// `valid=false` whenever either layer is absent (e.g. ARP, or a malformed
/// frame).
pub fn extract_flow_tuple(frame: &Frame) -> FlowTuple {
    if !matches!(frame.link_type, LinkType::Ethernet) {
        return FlowTuple::invalid();
    }
    let eth = match parse_ethernet(&frame.data) {
        Some(e) => e,
        None => return FlowTuple::invalid(),
    };
    let payload = match frame.data.get(eth.offset..) {
        Some(p) => p,
        None => return FlowTuple::invalid(),
    };
    let l3 = match decode_l3(eth.ethertype, payload) {
        Some(l3) => l3,
        None => return FlowTuple::invalid(),
    };
    let transport = match l3.transport {
        Some(t) => t,
        None => return FlowTuple::invalid(),
    };

    FlowTuple {
        valid: true,
        src_ip: Some(l3.src_ip),
        dst_ip: Some(l3.dst_ip),
        src_port: transport.src_port,
        dst_port: transport.dst_port,
        l4_protocol: l3.protocol,
        tcp_flags: transport.tcp_flags.unwrap_or_default(),
        tcp_seq: transport.tcp_seq,
        tcp_payload_len: transport.payload_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use chrono::Utc;

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let mut eth = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x00, 0x11, 0x22, 0x33, 0x44, 0x66,
            0x08, 0x00,
        ];
        let ip = vec![
            0x45, 0x00, 0x00, 0x00, 0x00, 0x01, 0x40, 0x00,
            0x40, 0x11, 0x00, 0x00,
            10, 0, 0, 1,
            10, 0, 0, 2,
        ];
        let mut udp = vec![0x00, 0x35, 0x9c, 0x40, 0x00, 0x09, 0x00, 0x00];
        udp.extend(payload);
        eth.extend(ip);
        eth.extend(udp);
        eth
    }

    #[test]
    fn bare_udp_on_well_known_port_is_named_by_protocol_not_port() {
        // Port 53 with a payload that isn't a DNS message: must stay "UDP".
        let frame = Frame::new(udp_frame(b"hi"), Utc::now(), 100, LinkType::Ethernet);
        let start = frame.capture_time;
        let summary = parse(&frame, 1, start);
        assert_eq!(summary.protocol, "UDP");
        assert_eq!(summary.time_offset, 0.0);
        assert_eq!(summary.src.unwrap().port, Some(53));

        let tuple = extract_flow_tuple(&frame);
        assert!(tuple.valid);
        assert_eq!(tuple.l4_protocol, ipv4::protocol::UDP);
    }

    #[test]
    fn udp_carrying_a_real_dns_message_is_named_dns() {
        let dns_query = [0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let frame = Frame::new(udp_frame(&dns_query), Utc::now(), 100, LinkType::Ethernet);
        let summary = parse(&frame, 1, frame.capture_time);
        assert_eq!(summary.protocol, "DNS");
    }

    #[test]
    fn malformed_frame_is_best_effort() {
        let frame = Frame::new(vec![1, 2, 3], Utc::now(), 3, LinkType::Ethernet);
        let summary = parse(&frame, 1, frame.capture_time);
        assert_eq!(summary.protocol, "unknown");
        let tuple = extract_flow_tuple(&frame);
        assert!(!tuple.valid);
    }
}
