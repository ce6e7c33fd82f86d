//! UDP: per-port bindings with FIFO datagram queues.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use opal_lib::{IrqMutex, klog_debug};

use crate::ipv4;
use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::types::{IpProtocol, Ipv4Addr, NetError, Port, SockAddr};
use crate::wire::pseudo_header_checksum;

pub const UDP_HEADER_LEN: usize = 8;
pub const MAX_BINDINGS: usize = 256;

/// Opaque reference to a binding slot. Carries the bound port so a recycled
/// slot cannot be reached through a stale handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHandle {
    index: usize,
    port: Port,
}

impl UdpHandle {
    pub fn port(&self) -> Port {
        self.port
    }
}

struct Datagram {
    source: SockAddr,
    data: Vec<u8>,
}

struct UdpBinding {
    port: Port,
    queue: VecDeque<Datagram>,
}

struct UdpTable {
    bindings: [Option<UdpBinding>; MAX_BINDINGS],
}

impl UdpTable {
    const fn new() -> Self {
        Self {
            bindings: [const { None }; MAX_BINDINGS],
        }
    }

    fn port_in_use(&self, port: Port) -> bool {
        self.bindings
            .iter()
            .any(|b| b.as_ref().is_some_and(|b| b.port == port))
    }

    fn slot_for(&mut self, handle: UdpHandle) -> Option<&mut UdpBinding> {
        self.bindings
            .get_mut(handle.index)?
            .as_mut()
            .filter(|b| b.port == handle.port)
    }
}

static UDP_TABLE: IrqMutex<UdpTable> = IrqMutex::new(UdpTable::new());

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(49152);

fn alloc_ephemeral_port(table: &UdpTable) -> Option<Port> {
    for _ in 0..(65535 - 49152) {
        let raw = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed);
        if !(49152..65535).contains(&raw) {
            NEXT_EPHEMERAL.store(49152, Ordering::Relaxed);
            continue;
        }
        let port = Port(raw);
        if !table.port_in_use(port) {
            return Some(port);
        }
    }
    None
}

// =============================================================================
// Binding management
// =============================================================================

/// Reserve `port`. Port 0 picks an ephemeral port. Duplicate ports are
/// refused with `Busy`, a full table with `Error`.
pub fn bind(port: Port) -> Result<UdpHandle, NetError> {
    let mut table = UDP_TABLE.lock();

    let port = if port.as_u16() == 0 {
        alloc_ephemeral_port(&table).ok_or(NetError::Busy)?
    } else {
        if table.port_in_use(port) {
            return Err(NetError::Busy);
        }
        port
    };

    let index = table
        .bindings
        .iter()
        .position(|b| b.is_none())
        .ok_or(NetError::Error)?;

    table.bindings[index] = Some(UdpBinding {
        port,
        queue: VecDeque::new(),
    });

    Ok(UdpHandle { index, port })
}

/// Release a binding and everything queued on it. Stale handles are ignored.
pub fn unbind(handle: UdpHandle) {
    let mut table = UDP_TABLE.lock();
    if table.slot_for(handle).is_some() {
        table.bindings[handle.index] = None;
    }
}

// =============================================================================
// Data transfer
// =============================================================================

/// Build and send one datagram from `src_port` to `dst`.
pub fn send(dst: SockAddr, src_port: Port, payload: &[u8]) -> Result<(), NetError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(NetError::Error);
    }

    let mut pkt = PacketBuf::alloc(payload.len())?;
    pkt.append(payload)?;

    let hdr = pkt.push_header(UDP_HEADER_LEN)?;
    hdr[0..2].copy_from_slice(&src_port.to_network_bytes());
    hdr[2..4].copy_from_slice(&dst.port.to_network_bytes());
    hdr[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    hdr[6..8].copy_from_slice(&0u16.to_be_bytes());

    let src_ip = NET_STACK.ipv4();
    let mut checksum = pseudo_header_checksum(src_ip, dst.ip, IpProtocol::Udp, pkt.payload());
    if checksum == 0 {
        // RFC 768: zero on the wire means "no checksum computed".
        checksum = 0xFFFF;
    }
    pkt.payload_mut()[6..8].copy_from_slice(&checksum.to_be_bytes());

    ipv4::send(dst.ip, IpProtocol::Udp, pkt)
}

/// Dequeue one datagram. `Ok(None)` when the queue is empty; `Error` for a
/// stale or invalid handle. Copies at most `buf.len()` bytes and reports the
/// actual datagram length copied along with its source.
pub fn recv_from(
    handle: UdpHandle,
    buf: &mut [u8],
) -> Result<Option<(usize, SockAddr)>, NetError> {
    let mut table = UDP_TABLE.lock();
    let binding = table.slot_for(handle).ok_or(NetError::Error)?;

    let Some(datagram) = binding.queue.pop_front() else {
        return Ok(None);
    };

    let n = datagram.data.len().min(buf.len());
    buf[..n].copy_from_slice(&datagram.data[..n]);
    Ok(Some((n, datagram.source)))
}

// =============================================================================
// Ingress
// =============================================================================

/// Enqueue one received datagram onto its binding, or drop it.
pub fn handle_rx(src_ip: Ipv4Addr, packet: &[u8]) {
    if packet.len() < UDP_HEADER_LEN {
        klog_debug!("udp: packet too short ({} bytes)", packet.len());
        return;
    }

    let src_port = Port::from_network_bytes([packet[0], packet[1]]);
    let dst_port = Port::from_network_bytes([packet[2], packet[3]]);
    let udp_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;

    if udp_len < UDP_HEADER_LEN || udp_len > packet.len() {
        klog_debug!("udp: bad length {} (frame {})", udp_len, packet.len());
        return;
    }

    let payload = &packet[UDP_HEADER_LEN..udp_len];

    let mut data = Vec::new();
    if data.try_reserve_exact(payload.len()).is_err() {
        klog_debug!("udp: datagram for port {} dropped (no memory)", dst_port);
        return;
    }
    data.extend_from_slice(payload);

    let mut table = UDP_TABLE.lock();
    let Some(binding) = table
        .bindings
        .iter_mut()
        .flatten()
        .find(|b| b.port == dst_port)
    else {
        klog_debug!("udp: no binding for port {}", dst_port);
        return;
    };

    binding.queue.push_back(Datagram {
        source: SockAddr::new(src_ip, src_port),
        data,
    });
}

// =============================================================================
// Diagnostics & teardown
// =============================================================================

/// Number of active bindings.
pub fn binding_count() -> usize {
    UDP_TABLE.lock().bindings.iter().flatten().count()
}

/// Datagrams queued on a binding; `None` for stale handles.
pub fn queue_len(handle: UdpHandle) -> Option<usize> {
    let mut table = UDP_TABLE.lock();
    table.slot_for(handle).map(|b| b.queue.len())
}

/// Drop all bindings and reset the ephemeral counter (shutdown path).
pub fn reset() {
    let mut table = UDP_TABLE.lock();
    for slot in table.bindings.iter_mut() {
        *slot = None;
    }
    NEXT_EPHEMERAL.store(49152, Ordering::Relaxed);
}
