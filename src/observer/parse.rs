//! tcpdump record parsing.
//!
//! The capture runs `tcpdump -l -n -tt -e -v`, so each record starts with a
//! numeric epoch timestamp and carries link-layer addresses plus the IP
//! header detail (ttl, protocol). Verbose output wraps onto continuation
//! lines; the observer joins those before handing records here. Parsing is
//! best-effort string scanning: anything unrecognized yields `None` and is
//! counted, never propagated.

use std::net::Ipv4Addr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Arp,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    IcmpEchoRequest,
    IcmpEchoReply,
    IcmpTimeExceeded,
    IcmpDestUnreachable,
    TcpSyn,
    TcpSynAck,
    TcpAck,
    TcpFin,
    TcpRst,
    ArpRequest,
    ArpReply,
    DnsQuery,
    DnsResponse,
    Udp,
    Other,
}

/// One observed packet, as reported by the kernel capture.
#[derive(Debug, Clone, Serialize)]
pub struct PacketEvent {
    /// Kernel capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub device: String,
    pub interface: String,
    pub protocol: Protocol,
    pub packet_type: PacketKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
    pub length: u32,
}

/// Parse one (joined) tcpdump record into an event.
pub fn parse_record(device: &str, interface: &str, record: &str) -> Option<PacketEvent> {
    let record = record.trim();
    let ts_end = record.find(' ')?;
    let timestamp: f64 = record[..ts_end].parse().ok()?;
    let rest = &record[ts_end + 1..];

    let (src_mac, dst_mac) = parse_macs(rest);
    let length = parse_frame_length(rest).unwrap_or(0);
    let ttl = number_after(rest, "ttl ").and_then(|n| u8::try_from(n).ok());

    let mut event = PacketEvent {
        timestamp,
        device: device.to_string(),
        interface: interface.to_string(),
        protocol: Protocol::Other,
        packet_type: PacketKind::Other,
        src_ip: None,
        dst_ip: None,
        src_port: None,
        dst_port: None,
        src_mac,
        dst_mac,
        ttl,
        length,
    };

    if rest.contains("ethertype ARP") || rest.starts_with("ARP") {
        event.protocol = Protocol::Arp;
        classify_arp(rest, &mut event);
    } else if rest.contains("ICMP") {
        event.protocol = Protocol::Icmp;
        if let Some((src, _, dst, _)) = parse_addr_pair(rest) {
            event.src_ip = Some(src);
            event.dst_ip = Some(dst);
        }
        event.packet_type = classify_icmp(rest);
    } else if rest.contains("Flags [") {
        event.protocol = Protocol::Tcp;
        if let Some((src, sport, dst, dport)) = parse_addr_pair(rest) {
            event.src_ip = Some(src);
            event.dst_ip = Some(dst);
            event.src_port = sport;
            event.dst_port = dport;
        }
        event.packet_type = classify_tcp(rest);
    } else if rest.contains("UDP") {
        event.protocol = Protocol::Udp;
        if let Some((src, sport, dst, dport)) = parse_addr_pair(rest) {
            event.src_ip = Some(src);
            event.dst_ip = Some(dst);
            event.src_port = sport;
            event.dst_port = dport;
        }
        event.packet_type = match (event.src_port, event.dst_port) {
            (_, Some(53)) => PacketKind::DnsQuery,
            (Some(53), _) => PacketKind::DnsResponse,
            _ => PacketKind::Udp,
        };
    }

    Some(event)
}

fn classify_icmp(rest: &str) -> PacketKind {
    if rest.contains("echo request") {
        PacketKind::IcmpEchoRequest
    } else if rest.contains("echo reply") {
        PacketKind::IcmpEchoReply
    } else if rest.contains("time exceeded") {
        PacketKind::IcmpTimeExceeded
    } else if rest.contains("unreachable") {
        PacketKind::IcmpDestUnreachable
    } else {
        PacketKind::Other
    }
}

fn classify_tcp(rest: &str) -> PacketKind {
    let flags = rest
        .split("Flags [")
        .nth(1)
        .and_then(|s| s.split(']').next())
        .unwrap_or("");
    if flags.contains('S') && flags.contains('.') {
        PacketKind::TcpSynAck
    } else if flags.contains('S') {
        PacketKind::TcpSyn
    } else if flags.contains('F') {
        PacketKind::TcpFin
    } else if flags.contains('R') {
        PacketKind::TcpRst
    } else {
        PacketKind::TcpAck
    }
}

fn classify_arp(rest: &str, event: &mut PacketEvent) {
    if rest.contains("Request") {
        event.packet_type = PacketKind::ArpRequest;
        // "Request who-has 10.0.1.2 tell 10.0.1.1"
        event.dst_ip = ip_after(rest, "who-has ");
        event.src_ip = ip_after(rest, "tell ");
    } else if rest.contains("Reply") {
        event.packet_type = PacketKind::ArpReply;
        // "Reply 10.0.1.2 is-at aa:bb:..."
        event.src_ip = rest
            .split("Reply ")
            .nth(1)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|t| t.parse().ok());
    }
}

/// Link-layer addresses: `aa:bb:cc:dd:ee:ff > 11:22:33:44:55:66, ...`
fn parse_macs(rest: &str) -> (Option<String>, Option<String>) {
    let head = rest.split(',').next().unwrap_or("");
    let mut parts = head.split(" > ");
    let src = parts.next().map(str::trim).filter(|t| is_mac(t));
    let dst = parts.next().map(str::trim).filter(|t| is_mac(t));
    (src.map(str::to_string), dst.map(str::to_string))
}

fn is_mac(tok: &str) -> bool {
    tok.len() == 17
        && tok
            .chars()
            .enumerate()
            .all(|(i, c)| if i % 3 == 2 { c == ':' } else { c.is_ascii_hexdigit() })
}

/// Frame length: the `length N:` that terminates the link-level header,
/// e.g. `ethertype IPv4 (0x0800), length 98:`.
fn parse_frame_length(rest: &str) -> Option<u32> {
    let mut search = rest;
    while let Some(pos) = search.find("length ") {
        let tail = &search[pos + "length ".len()..];
        let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
        let after = &tail[digits.len()..];
        if after.starts_with(':')
            && let Ok(n) = digits.parse()
        {
            return Some(n);
        }
        search = tail;
    }
    None
}

/// First `A > B:` pair whose sides parse as IPv4 addresses, optionally
/// carrying a trailing `.port`.
fn parse_addr_pair(rest: &str) -> Option<(Ipv4Addr, Option<u16>, Ipv4Addr, Option<u16>)> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    for w in tokens.windows(3) {
        if w[1] != ">" {
            continue;
        }
        if let (Some((src, sport)), Some((dst, dport))) =
            (split_host_port(w[0]), split_host_port(w[2]))
        {
            return Some((src, sport, dst, dport));
        }
    }
    None
}

fn split_host_port(tok: &str) -> Option<(Ipv4Addr, Option<u16>)> {
    let tok = tok.trim_end_matches([',', ':']);
    if let Ok(ip) = tok.parse::<Ipv4Addr>() {
        return Some((ip, None));
    }
    let (host, port) = tok.rsplit_once('.')?;
    let ip = host.parse::<Ipv4Addr>().ok()?;
    let port = port.parse::<u16>().ok()?;
    Some((ip, Some(port)))
}

fn number_after(rest: &str, marker: &str) -> Option<u32> {
    let tail = rest.split(marker).nth(1)?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn ip_after(rest: &str, marker: &str) -> Option<Ipv4Addr> {
    rest.split(marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_end_matches([',', ':'])
        .parse()
        .ok()
}
