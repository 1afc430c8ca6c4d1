//! Transport layer (TCP/UDP) parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use super::ipv4::protocol;

/// TCP control bits relevant to flow tracking and reassembly (§3 `FlowTuple`).
/// ECE/CWR are not part of the spec's flag set and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_byte(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push_str("none"); }
        write!(f, "[{}]", s)
    }
}

const HTTP_METHODS: &[&[u8]] =
    &[b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE "];

/// Sniff an application-layer protocol from actual payload bytes. Returns
/// `None` when the bytes don't carry enough evidence — a bare TCP/UDP
/// segment on a well-known port with no recognizable payload is reported as
/// plain `"TCP"`/`"UDP"`, not guessed at by port number alone.
pub fn sniff_application_protocol(payload: &[u8]) -> Option<&'static str> {
    if looks_like_dns(payload) {
        return Some("DNS");
    }
    if looks_like_http(payload) {
        return Some("HTTP");
    }
    if looks_like_tls(payload) {
        return Some("TLS");
    }
    None
}

/// A DNS message's header: ID, then a 16-bit flags field whose opcode (bits
/// 11-14) is one of the four assigned values and whose Z bit (bit 6,
/// reserved, must be zero) is unset, followed by a plausible question count.
fn looks_like_dns(payload: &[u8]) -> bool {
    if payload.len() < 12 {
        return false;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let opcode = (flags >> 11) & 0x0F;
    let z = (flags >> 6) & 0x01;
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    opcode <= 2 && z == 0 && qdcount > 0 && qdcount < 64
}

/// An HTTP request line or response status line.
fn looks_like_http(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/1.") || HTTP_METHODS.iter().any(|m| payload.starts_with(m))
}

/// A TLS record header: content type 20-23 (change_cipher_spec through
/// application_data) followed by a `0x03` major version byte.
fn looks_like_tls(payload: &[u8]) -> bool {
    payload.len() >= 3 && matches!(payload[0], 0x14..=0x17) && payload[1] == 0x03
}

#[derive(Debug, Clone)]
pub struct TransportInfo<'a> {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
    pub tcp_seq: Option<u32>,
    pub tcp_ack: Option<u32>,
    pub tcp_window: Option<u16>,
    pub payload_size: u32,
    pub payload: &'a [u8],
}

pub fn parse_transport(ip_protocol: u8, data: &[u8]) -> Option<TransportInfo<'_>> {
    match ip_protocol {
        protocol::TCP => parse_tcp(data),
        protocol::UDP => parse_udp(data),
        _ => Some(TransportInfo {
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            tcp_seq: None,
            tcp_ack: None,
            tcp_window: None,
            payload_size: data.len() as u32,
            payload: data,
        }),
    }
}

fn parse_tcp(data: &[u8]) -> Option<TransportInfo<'_>> {
    if data.len() < 20 {
        return None;
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let data_offset = ((data[12] >> 4) & 0x0F) as usize * 4;
    if data_offset < 20 {
        return None;
    }

    let flags = TcpFlags::from_byte(data[13]);
    let window = u16::from_be_bytes([data[14], data[15]]);
    let payload = data.get(data_offset..).unwrap_or(&[]);

    Some(TransportInfo {
        src_port: Some(src_port),
        dst_port: Some(dst_port),
        tcp_flags: Some(flags),
        tcp_seq: Some(seq),
        tcp_ack: Some(ack),
        tcp_window: Some(window),
        payload_size: payload.len() as u32,
        payload,
    })
}

fn parse_udp(data: &[u8]) -> Option<TransportInfo<'_>> {
    if data.len() < 8 {
        return None;
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let payload = data.get(8..).unwrap_or(&[]);

    Some(TransportInfo {
        src_port: Some(src_port),
        dst_port: Some(dst_port),
        tcp_flags: None,
        tcp_seq: None,
        tcp_ack: None,
        tcp_window: None,
        payload_size: payload.len() as u32,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_syn() {
        let data = vec![
            0x01, 0xbb,
            0xd4, 0x31,
            0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
            0x50, 0x02,
            0xff, 0xff,
            0x00, 0x00,
            0x00, 0x00,
        ];
        let info = parse_tcp(&data).unwrap();
        assert_eq!(info.src_port, Some(443));
        assert_eq!(info.dst_port, Some(54321));
        assert!(info.tcp_flags.unwrap().is_syn_only());
        assert_eq!(info.tcp_seq, Some(1));
    }

    #[test]
    fn parses_udp() {
        let mut data = vec![0x00, 0x35, 0x30, 0x39, 0x00, 0x0a, 0x00, 0x00];
        data.extend(b"hi");
        let info = parse_udp(&data).unwrap();
        assert_eq!(info.src_port, Some(53));
        assert_eq!(info.payload_size, 2);
        assert_eq!(info.payload, b"hi");
    }

    #[test]
    fn bare_udp_payload_is_not_sniffed_as_dns() {
        // A well-known DNS port with a payload that isn't a DNS message at
        // all must not be named "DNS" by port number alone.
        assert_eq!(sniff_application_protocol(b"hi"), None);
    }

    #[test]
    fn dns_query_is_sniffed_from_payload() {
        let query = [
            0x12, 0x34, // id
            0x01, 0x00, // flags: standard query, recursion desired
            0x00, 0x01, // qdcount=1
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(sniff_application_protocol(&query), Some("DNS"));
    }

    #[test]
    fn http_request_is_sniffed_from_payload() {
        assert_eq!(sniff_application_protocol(b"GET /index.html HTTP/1.1\r\n"), Some("HTTP"));
    }

    #[test]
    fn tls_handshake_is_sniffed_from_payload() {
        assert_eq!(sniff_application_protocol(&[0x16, 0x03, 0x01, 0x00, 0x05]), Some("TLS"));
    }
}
