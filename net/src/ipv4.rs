//! IPv4: datagram validation, routing, egress header construction, and ICMP
//! echo.
//!
//! Ingress accepts only packets that parse as version 4 with a sane IHL,
//! whose header checksum folds to zero, and whose destination is our
//! address, broadcast, or multicast; everything else is dropped with a debug
//! line. The validated source address is threaded down to the transports,
//! which demultiplex on it.
//!
//! Egress builds a fresh 20-byte header (no options), routes via
//! [`next_hop`] and resolves the hop's MAC through the ARP cache; an
//! unresolved hop parks the packet there until the reply arrives.

use core::sync::atomic::{AtomicU16, Ordering};

use opal_lib::klog_debug;

use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError};
use crate::wire::internet_checksum;
use crate::{arp, ethernet, tcp, udp};

pub const IPV4_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 8;
pub const DEFAULT_TTL: u8 = 64;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// Don't-fragment, zero fragment offset.
const FLAGS_DF: u16 = 0x4000;

/// Identification for outgoing datagrams, monotonic per packet.
static IP_IDENT: AtomicU16 = AtomicU16::new(1);

// =============================================================================
// Ingress
// =============================================================================

/// Validate and dispatch one IPv4 packet (Ethernet header already consumed).
pub fn handle_rx(packet: &[u8]) {
    if packet.len() < IPV4_HEADER_LEN {
        klog_debug!("ipv4: packet too short ({} bytes)", packet.len());
        return;
    }

    let version = packet[0] >> 4;
    if version != 4 {
        klog_debug!("ipv4: bad version {}", version);
        return;
    }

    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if ihl < IPV4_HEADER_LEN || ihl > total_len || total_len > packet.len() {
        klog_debug!("ipv4: bad lengths (ihl={}, total={})", ihl, total_len);
        return;
    }

    if internet_checksum(&packet[..ihl]) != 0 {
        klog_debug!("ipv4: bad header checksum");
        return;
    }

    let dst = Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]);
    let ours = NET_STACK.ipv4();
    if dst != ours && !dst.is_broadcast() && !dst.is_multicast() {
        return;
    }

    let src = Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]);
    let protocol = packet[9];
    let payload = &packet[ihl..total_len];

    match IpProtocol::from_u8(protocol) {
        Some(IpProtocol::Icmp) => handle_icmp(src, payload),
        Some(IpProtocol::Tcp) => tcp::handle_rx(src, payload),
        Some(IpProtocol::Udp) => udp::handle_rx(src, payload),
        None => {
            klog_debug!("ipv4: unknown protocol {}", protocol);
        }
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Whether `dst` is on our directly connected subnet.
pub fn is_local(dst: Ipv4Addr) -> bool {
    dst.same_subnet(NET_STACK.ipv4(), NET_STACK.netmask())
}

/// Next hop for `dst`: the destination itself on the local subnet, the
/// configured gateway otherwise.
pub fn next_hop(dst: Ipv4Addr) -> Ipv4Addr {
    if is_local(dst) { dst } else { NET_STACK.gateway() }
}

// =============================================================================
// Egress
// =============================================================================

/// Wrap an L4 segment in an IPv4 header and send it towards `dst`.
///
/// Broadcast and multicast destinations go out as link broadcast without
/// neighbour resolution. A unicast hop whose MAC is unknown parks the packet
/// in the ARP cache; `Ok` is returned, and the reply handler completes the
/// transmit.
pub fn send(dst: Ipv4Addr, protocol: IpProtocol, mut pkt: PacketBuf) -> Result<(), NetError> {
    let src = NET_STACK.ipv4();
    let total_len = (IPV4_HEADER_LEN + pkt.len()) as u16;
    let ident = IP_IDENT.fetch_add(1, Ordering::Relaxed);

    let hdr = pkt.push_header(IPV4_HEADER_LEN)?;
    hdr[0] = 0x45;
    hdr[1] = 0;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[4..6].copy_from_slice(&ident.to_be_bytes());
    hdr[6..8].copy_from_slice(&FLAGS_DF.to_be_bytes());
    hdr[8] = DEFAULT_TTL;
    hdr[9] = protocol.as_u8();
    hdr[10..12].copy_from_slice(&0u16.to_be_bytes());
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);
    let checksum = internet_checksum(hdr);
    hdr[10..12].copy_from_slice(&checksum.to_be_bytes());

    if dst.is_broadcast() || dst.is_multicast() {
        // Group MAC mapping is out of scope; both leave as link broadcast.
        return ethernet::send_frame(MacAddr::BROADCAST, EtherType::Ipv4, pkt);
    }

    let hop = next_hop(dst);
    match arp::resolve_or_park(hop, pkt) {
        Some((mac, pkt)) => ethernet::send_frame(mac, EtherType::Ipv4, pkt),
        None => Ok(()),
    }
}

/// Reset per-layer counters (shutdown path).
pub fn reset() {
    IP_IDENT.store(1, Ordering::Relaxed);
}

// =============================================================================
// ICMP
// =============================================================================

/// Echo requests become echo replies with the identifier, sequence, and
/// payload preserved; every other ICMP type is dropped.
fn handle_icmp(src: Ipv4Addr, packet: &[u8]) {
    if packet.len() < ICMP_HEADER_LEN {
        klog_debug!("icmp: packet too short ({} bytes)", packet.len());
        return;
    }

    let icmp_type = packet[0];
    let icmp_code = packet[1];
    if icmp_type != ICMP_ECHO_REQUEST || icmp_code != 0 {
        klog_debug!("icmp: type {} code {} ignored", icmp_type, icmp_code);
        return;
    }

    let echo_payload = &packet[ICMP_HEADER_LEN..];
    let mut reply = match PacketBuf::alloc(packet.len()) {
        Ok(pkt) => pkt,
        Err(e) => {
            klog_debug!("icmp: echo reply dropped: {}", e);
            return;
        }
    };

    let mut header = [0u8; ICMP_HEADER_LEN];
    header[0] = ICMP_ECHO_REPLY;
    header[1] = 0;
    // Checksum filled below; identifier and sequence carried over verbatim.
    header[4..8].copy_from_slice(&packet[4..8]);

    if reply.append(&header).is_err() || reply.append(echo_payload).is_err() {
        return;
    }

    let checksum = internet_checksum(reply.payload());
    reply.payload_mut()[2..4].copy_from_slice(&checksum.to_be_bytes());

    if let Err(e) = send(src, IpProtocol::Icmp, reply) {
        klog_debug!("icmp: echo reply send failed: {}", e);
    }
}
