//! Shared scaffolding for the stack test suites: a canned interface
//! configuration, a transmit callback that captures frames for inspection,
//! and wire-format builders that produce valid checksums.

extern crate alloc;

use alloc::vec::Vec;

use opal_lib::IrqMutex;

use crate::stack::NET_STACK;
use crate::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr};
use crate::wire::{internet_checksum, pseudo_header_checksum};

pub const OUR_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
pub const OUR_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 2]);
pub const NETMASK: Ipv4Addr = Ipv4Addr([255, 255, 255, 0]);
pub const GATEWAY: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);

pub const PEER_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);

static CAPTURED: IrqMutex<Vec<Vec<u8>>> = IrqMutex::new(Vec::new());

fn capture_frame(frame: &[u8]) {
    let mut copy = Vec::new();
    copy.extend_from_slice(frame);
    CAPTURED.lock().push(copy);
}

/// Reset every stack table, apply the canned configuration, and arm the
/// capture callback. Every protocol test starts here so the suites stay
/// order-independent.
pub fn reset_world() {
    NET_STACK.initialize();
    NET_STACK.shutdown();
    NET_STACK.configure(OUR_MAC, OUR_IP, NETMASK, GATEWAY);
    NET_STACK.set_transmit_callback(capture_frame);
    CAPTURED.lock().clear();
}

/// Take every frame captured since the last call.
pub fn captured_frames() -> Vec<Vec<u8>> {
    core::mem::take(&mut *CAPTURED.lock())
}

pub fn clear_captured() {
    CAPTURED.lock().clear();
}

/// Teach the stack the peer's MAC by injecting an ARP reply, then discard
/// any capture noise.
pub fn warm_peer_arp() {
    NET_STACK.receive_packet(&arp_reply_frame(PEER_MAC, PEER_IP, OUR_MAC, OUR_IP));
    clear_captured();
}

// =============================================================================
// Frame builders
// =============================================================================

pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn arp_packet(
    oper: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(28);
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&0x0800u16.to_be_bytes());
    body.push(6);
    body.push(4);
    body.extend_from_slice(&oper.to_be_bytes());
    body.extend_from_slice(&sender_mac.0);
    body.extend_from_slice(&sender_ip.0);
    body.extend_from_slice(&target_mac.0);
    body.extend_from_slice(&target_ip.0);
    body
}

pub fn arp_request_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let body = arp_packet(1, sender_mac, sender_ip, MacAddr::ZERO, target_ip);
    eth_frame(MacAddr::BROADCAST, sender_mac, EtherType::Arp.as_u16(), &body)
}

pub fn arp_reply_frame(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let body = arp_packet(2, sender_mac, sender_ip, target_mac, target_ip);
    eth_frame(target_mac, sender_mac, EtherType::Arp.as_u16(), &body)
}

/// 20-byte option-less IPv4 header with a valid checksum.
pub fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, payload_len: usize) -> Vec<u8> {
    let total = (20 + payload_len) as u16;
    let mut hdr = Vec::with_capacity(20);
    hdr.push(0x45);
    hdr.push(0);
    hdr.extend_from_slice(&total.to_be_bytes());
    hdr.extend_from_slice(&0u16.to_be_bytes());
    hdr.extend_from_slice(&0x4000u16.to_be_bytes());
    hdr.push(64);
    hdr.push(protocol.as_u8());
    hdr.extend_from_slice(&0u16.to_be_bytes());
    hdr.extend_from_slice(&src.0);
    hdr.extend_from_slice(&dst.0);
    let checksum = internet_checksum(&hdr);
    hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
    hdr
}

/// Complete Ethernet frame carrying an IPv4 packet addressed to us.
pub fn ipv4_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, protocol: IpProtocol, l4: &[u8]) -> Vec<u8> {
    let mut packet = ipv4_header(src_ip, dst_ip, protocol, l4.len());
    packet.extend_from_slice(l4);
    eth_frame(OUR_MAC, PEER_MAC, EtherType::Ipv4.as_u16(), &packet)
}

/// ICMP echo request with a valid checksum.
pub fn icmp_echo_request(ident: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(8);
    packet.push(0);
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);
    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// UDP datagram with a valid pseudo-header checksum.
pub fn udp_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let mut segment = Vec::with_capacity(udp_len as usize);
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&udp_len.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(payload);
    let mut checksum = pseudo_header_checksum(src_ip, dst_ip, IpProtocol::Udp, &segment);
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    segment[6..8].copy_from_slice(&checksum.to_be_bytes());
    segment
}

/// Option-less TCP segment with a valid pseudo-header checksum.
#[allow(clippy::too_many_arguments)]
pub fn tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(20 + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(5 << 4);
    segment.push(flags);
    segment.extend_from_slice(&window.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(payload);
    let checksum = pseudo_header_checksum(src_ip, dst_ip, IpProtocol::Tcp, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

// =============================================================================
// Captured-frame accessors
// =============================================================================

pub fn eth_dst(frame: &[u8]) -> MacAddr {
    MacAddr([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]])
}

pub fn eth_src(frame: &[u8]) -> MacAddr {
    MacAddr([frame[6], frame[7], frame[8], frame[9], frame[10], frame[11]])
}

pub fn eth_ethertype(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

pub fn eth_payload(frame: &[u8]) -> &[u8] {
    &frame[14..]
}

/// The IPv4 header of a captured frame.
pub fn ip_header(frame: &[u8]) -> &[u8] {
    let ihl = ((frame[14] & 0x0F) as usize) * 4;
    &frame[14..14 + ihl]
}

/// The L4 segment of a captured IPv4 frame, bounded by the total length.
pub fn l4_segment(frame: &[u8]) -> &[u8] {
    let ihl = ((frame[14] & 0x0F) as usize) * 4;
    let total = u16::from_be_bytes([frame[16], frame[17]]) as usize;
    &frame[14 + ihl..14 + total]
}

pub fn ip_src(frame: &[u8]) -> Ipv4Addr {
    Ipv4Addr([frame[26], frame[27], frame[28], frame[29]])
}

pub fn ip_dst(frame: &[u8]) -> Ipv4Addr {
    Ipv4Addr([frame[30], frame[31], frame[32], frame[33]])
}
