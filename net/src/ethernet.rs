//! Ethernet framing: ingress demux and egress frame construction.

use opal_lib::klog_debug;

use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::types::{EtherType, MacAddr, NetError};
use crate::{arp, ipv4};

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_ADDR_LEN: usize = 6;

/// Demultiplex one received frame.
///
/// Frames shorter than the header are dropped, as are frames addressed to
/// neither our MAC, broadcast, nor a multicast group. Payload dispatch is by
/// EtherType; IPv6 is recognised and ignored.
pub fn handle_rx(frame: &[u8]) {
    if frame.len() < ETH_HEADER_LEN {
        klog_debug!("eth: frame too short ({} bytes)", frame.len());
        return;
    }

    let dst = MacAddr([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]]);
    let our_mac = NET_STACK.mac();
    if dst != our_mac && !dst.is_broadcast() && !dst.is_multicast() {
        return;
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let payload = &frame[ETH_HEADER_LEN..];

    match EtherType::from_u16(ethertype) {
        Some(EtherType::Ipv4) => ipv4::handle_rx(payload),
        Some(EtherType::Arp) => arp::handle_rx(payload),
        Some(EtherType::Ipv6) => {
            // No IPv6 data plane.
        }
        None => {
            klog_debug!("eth: unknown ethertype 0x{:04x}", ethertype);
        }
    }
}

/// Frame a packet and hand it to the NIC.
///
/// The Ethernet header is pushed into the packet's headroom; the buffer is
/// released when `pkt` drops, on every path.
pub fn send_frame(dst: MacAddr, ethertype: EtherType, mut pkt: PacketBuf) -> Result<(), NetError> {
    let src = NET_STACK.mac();

    let eth = pkt.push_header(ETH_HEADER_LEN)?;
    eth[0..ETH_ADDR_LEN].copy_from_slice(&dst.0);
    eth[ETH_ADDR_LEN..2 * ETH_ADDR_LEN].copy_from_slice(&src.0);
    eth[2 * ETH_ADDR_LEN..ETH_HEADER_LEN].copy_from_slice(&ethertype.as_u16().to_be_bytes());

    NET_STACK.transmit(pkt.payload());
    Ok(())
}
