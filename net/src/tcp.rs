//! TCP: connection table, state machine, and sequence-indexed data rings.
//!
//! The automaton is the eleven-state RFC 793 machine. A connection is
//! identified by `(remote ip, remote port, local port)`; the lone `Listen`
//! entry for a port matches on the local port alone and is itself promoted
//! to `SynReceived` when a SYN arrives (the socket layer re-arms a fresh
//! listener after `accept`). Segments that match no listed transition (RSTs
//! included) are dropped without a response, as are segments for unknown
//! connections.
//!
//! Data living between the application and the wire sits in fixed 8 KiB
//! rings addressed by 32-bit sequence deltas: the send ring holds
//! `[send_unacked, send_next)` and is trimmed by acceptable ACKs, the
//! receive ring holds in-order bytes up to `recv_next` until the application
//! drains them. Out-of-order segments are dropped; there is no reassembly,
//! no retransmission timer, and no congestion control.
//!
//! Segment construction and checksumming happen here; the wire packet is
//! handed to the IPv4 layer. The connection table lock is released before
//! any transmit.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use opal_lib::{IrqMutex, klog_debug};

use crate::ipv4;
use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::types::{IpProtocol, Ipv4Addr, NetError, Port, SockAddr};
use crate::wire::pseudo_header_checksum;

// =============================================================================
// Constants
// =============================================================================

/// Header length without options; this stack never emits options.
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum simultaneous connections (listeners included).
pub const MAX_CONNECTIONS: usize = 256;

/// Initial advertised window.
pub const DEFAULT_WINDOW: u16 = 65535;

/// Per-connection send ring capacity.
pub const SEND_BUFFER_SIZE: usize = 8192;

/// Per-connection receive ring capacity.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Fixed ISN for active opens. A production port derives a randomised ISN
/// per RFC 6528.
pub const ACTIVE_OPEN_ISS: u32 = 1000;

/// Fixed ISN seeded when a listener accepts a SYN.
const PASSIVE_OPEN_ISS: u32 = 2000;

bitflags! {
    /// TCP header flag bits (byte 13 of the header).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header, fields in host order.
#[derive(Clone, Copy, Debug)]
pub struct TcpHeader {
    pub src_port: Port,
    pub dst_port: Port,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words (5–15).
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }
}

/// Parse a TCP header. `None` if the slice is short or the data offset is
/// out of range.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }

    let data_offset = (data[12] >> 4) & 0x0F;
    if !(5..=15).contains(&data_offset) {
        return None;
    }
    if data.len() < (data_offset as usize) * 4 {
        return None;
    }

    Some(TcpHeader {
        src_port: Port::from_network_bytes([data[0], data[1]]),
        dst_port: Port::from_network_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: TcpFlags::from_bits_truncate(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

// =============================================================================
// Sequence arithmetic (RFC 793 §3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

// =============================================================================
// State machine
// =============================================================================

/// Connection state per RFC 793 §3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

// =============================================================================
// Sequence-indexed ring buffer
// =============================================================================

/// Fixed-capacity byte ring addressed by sequence numbers: the byte at
/// `start_seq + i` lives at ring offset `(head + i) % capacity`.
struct SeqRing {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    start_seq: u32,
}

impl SeqRing {
    fn with_capacity(capacity: usize, start_seq: u32) -> Result<Self, NetError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| NetError::OutOfMemory)?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            head: 0,
            len: 0,
            start_seq,
        })
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Re-seed an empty ring at a new base sequence (handshake time).
    fn reset(&mut self, start_seq: u32) {
        self.head = 0;
        self.len = 0;
        self.start_seq = start_seq;
    }

    /// Append at the tail. Returns the number of bytes written (bounded by
    /// free space).
    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let cap = self.buf.len();
        for (i, &byte) in data[..n].iter().enumerate() {
            let idx = (self.head + self.len + i) % cap;
            self.buf[idx] = byte;
        }
        self.len += n;
        n
    }

    /// Drain from the head into `out`, advancing `start_seq`.
    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.buf.len();
        for slot in out[..n].iter_mut() {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.len -= n;
        self.start_seq = self.start_seq.wrapping_add(n as u32);
        n
    }

    /// Drop bytes below `seq` (acknowledged data on the send side).
    fn release_to(&mut self, seq: u32) {
        while self.len > 0 && seq_lt(self.start_seq, seq) {
            self.head = (self.head + 1) % self.buf.len();
            self.len -= 1;
            self.start_seq = self.start_seq.wrapping_add(1);
        }
    }
}

// =============================================================================
// Connection table
// =============================================================================

struct TcpConnection {
    local: SockAddr,
    remote: SockAddr,
    state: TcpState,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    rcv_wnd: u16,
    send_ring: SeqRing,
    recv_ring: SeqRing,
}

/// Read-only view of a connection for callers and tests.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnInfo {
    pub local: SockAddr,
    pub remote: SockAddr,
    pub state: TcpState,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
}

struct Slot {
    /// Bumped every time the slot is released, so stale handles miss.
    generation: u32,
    conn: Option<TcpConnection>,
}

struct TcpTable {
    slots: [Slot; MAX_CONNECTIONS],
}

impl TcpTable {
    const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    generation: 0,
                    conn: None,
                }
            }; MAX_CONNECTIONS],
        }
    }

    fn get_mut(&mut self, handle: TcpHandle) -> Option<&mut TcpConnection> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.conn.as_mut()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.conn.is_none())
    }

    fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.conn = None;
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Demultiplex an incoming segment: exact tuple match first, then a
    /// listener on the local port.
    fn demux(&self, remote_ip: Ipv4Addr, remote_port: Port, local_port: Port) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(conn) = &slot.conn
                && conn.state != TcpState::Listen
                && conn.remote.ip == remote_ip
                && conn.remote.port == remote_port
                && conn.local.port == local_port
            {
                return Some(i);
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(conn) = &slot.conn
                && conn.state == TcpState::Listen
                && conn.local.port == local_port
            {
                return Some(i);
            }
        }
        None
    }

    fn listener_on(&self, port: Port) -> bool {
        self.slots.iter().any(|s| {
            s.conn
                .as_ref()
                .is_some_and(|c| c.state == TcpState::Listen && c.local.port == port)
        })
    }
}

static TCP_TABLE: IrqMutex<TcpTable> = IrqMutex::new(TcpTable::new());

/// Opaque reference to a connection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHandle {
    index: usize,
    generation: u32,
}

// =============================================================================
// Ephemeral port allocator
// =============================================================================

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(49152);

/// Next ephemeral port, monotonic from 49152 and wrapping at 65535.
fn alloc_ephemeral_port() -> Port {
    loop {
        let port = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed);
        if (49152..65535).contains(&port) {
            return Port(port);
        }
        NEXT_EPHEMERAL.store(49152, Ordering::Relaxed);
    }
}

// =============================================================================
// Segment emission
// =============================================================================

/// Everything needed to put one segment on the wire after the table lock is
/// gone.
#[derive(Clone, Copy, Debug)]
struct SegmentMeta {
    local: SockAddr,
    remote: SockAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
}

/// Build the wire segment, checksum it against the pseudo-header, and hand
/// it to IPv4. Allocation failure drops the segment silently.
fn transmit_segment(meta: &SegmentMeta, payload: &[u8]) {
    let mut pkt = match PacketBuf::alloc(payload.len()) {
        Ok(pkt) => pkt,
        Err(e) => {
            klog_debug!("tcp: segment to {} dropped: {}", meta.remote, e);
            return;
        }
    };
    if pkt.append(payload).is_err() {
        return;
    }

    let hdr = match pkt.push_header(TCP_HEADER_LEN) {
        Ok(hdr) => hdr,
        Err(_) => return,
    };
    hdr[0..2].copy_from_slice(&meta.local.port.to_network_bytes());
    hdr[2..4].copy_from_slice(&meta.remote.port.to_network_bytes());
    hdr[4..8].copy_from_slice(&meta.seq.to_be_bytes());
    hdr[8..12].copy_from_slice(&meta.ack.to_be_bytes());
    hdr[12] = (5 << 4) as u8;
    hdr[13] = meta.flags.bits();
    hdr[14..16].copy_from_slice(&meta.window.to_be_bytes());
    hdr[16..18].copy_from_slice(&0u16.to_be_bytes());
    hdr[18..20].copy_from_slice(&0u16.to_be_bytes());

    let checksum =
        pseudo_header_checksum(meta.local.ip, meta.remote.ip, IpProtocol::Tcp, pkt.payload());
    pkt.payload_mut()[16..18].copy_from_slice(&checksum.to_be_bytes());

    if let Err(e) = ipv4::send(meta.remote.ip, IpProtocol::Tcp, pkt) {
        klog_debug!("tcp: segment to {} not sent: {}", meta.remote, e);
    }
}

// =============================================================================
// Connection lifecycle
// =============================================================================

/// Active open: allocate a slot and an ephemeral port, emit SYN, enter
/// `SynSent`.
pub fn connect(remote: SockAddr) -> Result<TcpHandle, NetError> {
    let our_ip = NET_STACK.ipv4();
    if our_ip.is_unspecified() {
        return Err(NetError::Error);
    }

    let local_port = alloc_ephemeral_port();
    let send_ring = SeqRing::with_capacity(SEND_BUFFER_SIZE, ACTIVE_OPEN_ISS.wrapping_add(1))?;
    let recv_ring = SeqRing::with_capacity(RECV_BUFFER_SIZE, 0)?;

    let (handle, syn) = {
        let mut table = TCP_TABLE.lock();
        let index = table.free_slot().ok_or(NetError::Error)?;

        let local = SockAddr::new(our_ip, local_port);
        let mut conn = TcpConnection {
            local,
            remote,
            state: TcpState::SynSent,
            snd_una: ACTIVE_OPEN_ISS,
            snd_nxt: ACTIVE_OPEN_ISS,
            snd_wnd: DEFAULT_WINDOW,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW,
            send_ring,
            recv_ring,
        };

        let syn = SegmentMeta {
            local,
            remote,
            seq: conn.snd_nxt,
            ack: 0,
            flags: TcpFlags::SYN,
            window: conn.rcv_wnd,
        };
        // SYN consumes one sequence number.
        conn.snd_nxt = conn.snd_nxt.wrapping_add(1);

        let generation = table.slots[index].generation;
        table.slots[index].conn = Some(conn);

        klog_debug!("tcp: connect {} -> {} (slot {})", local, remote, index);
        (TcpHandle { index, generation }, syn)
    };

    transmit_segment(&syn, &[]);
    Ok(handle)
}

/// Passive open: reserve a `Listen` entry on `port`.
pub fn listen(port: Port) -> Result<TcpHandle, NetError> {
    let send_ring = SeqRing::with_capacity(SEND_BUFFER_SIZE, 0)?;
    let recv_ring = SeqRing::with_capacity(RECV_BUFFER_SIZE, 0)?;

    let mut table = TCP_TABLE.lock();
    if table.listener_on(port) {
        return Err(NetError::Busy);
    }
    let index = table.free_slot().ok_or(NetError::Error)?;

    table.slots[index].conn = Some(TcpConnection {
        local: SockAddr::new(NET_STACK.ipv4(), port),
        remote: SockAddr::UNSPECIFIED,
        state: TcpState::Listen,
        snd_una: 0,
        snd_nxt: 0,
        snd_wnd: 0,
        rcv_nxt: 0,
        rcv_wnd: DEFAULT_WINDOW,
        send_ring,
        recv_ring,
    });

    let generation = table.slots[index].generation;
    klog_debug!("tcp: listen on {} (slot {})", port, index);
    Ok(TcpHandle { index, generation })
}

/// Graceful close.
///
/// `Established`/`SynReceived` emit FIN|ACK and wait in `FinWait1`;
/// `CloseWait` emits FIN|ACK and waits in `LastAck`; `Listen`/`SynSent`
/// release the slot outright. Connections already tearing down are left
/// alone.
pub fn close(handle: TcpHandle) -> Result<(), NetError> {
    let fin = {
        let mut table = TCP_TABLE.lock();
        let conn = table.get_mut(handle).ok_or(NetError::Error)?;

        match conn.state {
            TcpState::Listen | TcpState::SynSent => {
                klog_debug!("tcp: close from {} releases slot {}", conn.state.name(), handle.index);
                table.release(handle.index);
                None
            }
            TcpState::SynReceived | TcpState::Established => {
                let meta = SegmentMeta {
                    local: conn.local,
                    remote: conn.remote,
                    seq: conn.snd_nxt,
                    ack: conn.rcv_nxt,
                    flags: TcpFlags::FIN | TcpFlags::ACK,
                    window: conn.rcv_wnd,
                };
                conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                conn.state = TcpState::FinWait1;
                Some(meta)
            }
            TcpState::CloseWait => {
                let meta = SegmentMeta {
                    local: conn.local,
                    remote: conn.remote,
                    seq: conn.snd_nxt,
                    ack: conn.rcv_nxt,
                    flags: TcpFlags::FIN | TcpFlags::ACK,
                    window: conn.rcv_wnd,
                };
                conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                conn.state = TcpState::LastAck;
                Some(meta)
            }
            _ => None,
        }
    };

    if let Some(meta) = fin {
        transmit_segment(&meta, &[]);
    }
    Ok(())
}

// =============================================================================
// Data transfer
// =============================================================================

/// Queue and emit data on an established connection.
///
/// The payload is truncated to the peer's window and the ring's free space
/// and leaves as a single PSH|ACK segment; there is no segmentation.
pub fn send(handle: TcpHandle, data: &[u8]) -> Result<usize, NetError> {
    let (meta, n) = {
        let mut table = TCP_TABLE.lock();
        let conn = table.get_mut(handle).ok_or(NetError::Error)?;
        if conn.state != TcpState::Established {
            return Err(NetError::Error);
        }

        let n = data
            .len()
            .min(conn.snd_wnd as usize)
            .min(conn.send_ring.free());
        if n == 0 {
            return Ok(0);
        }

        conn.send_ring.write(&data[..n]);
        let meta = SegmentMeta {
            local: conn.local,
            remote: conn.remote,
            seq: conn.snd_nxt,
            ack: conn.rcv_nxt,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window: conn.rcv_wnd,
        };
        conn.snd_nxt = conn.snd_nxt.wrapping_add(n as u32);
        (meta, n)
    };

    transmit_segment(&meta, &data[..n]);
    Ok(n)
}

/// Drain in-order received data. Non-blocking: returns 0 when the ring is
/// empty. Permitted in `Established`, and in `CloseWait` for data delivered
/// before the peer's FIN.
pub fn recv(handle: TcpHandle, buf: &mut [u8]) -> Result<usize, NetError> {
    let mut table = TCP_TABLE.lock();
    let conn = table.get_mut(handle).ok_or(NetError::Error)?;
    if conn.state != TcpState::Established && conn.state != TcpState::CloseWait {
        return Err(NetError::Error);
    }
    Ok(conn.recv_ring.read(buf))
}

// =============================================================================
// Queries
// =============================================================================

/// Current state, or `None` for a released slot.
pub fn state(handle: TcpHandle) -> Option<TcpState> {
    let mut table = TCP_TABLE.lock();
    table.get_mut(handle).map(|c| c.state)
}

/// Snapshot of a connection.
pub fn connection_info(handle: TcpHandle) -> Option<TcpConnInfo> {
    let mut table = TCP_TABLE.lock();
    table.get_mut(handle).map(|c| TcpConnInfo {
        local: c.local,
        remote: c.remote,
        state: c.state,
        snd_una: c.snd_una,
        snd_nxt: c.snd_nxt,
        snd_wnd: c.snd_wnd,
        rcv_nxt: c.rcv_nxt,
        rcv_wnd: c.rcv_wnd,
    })
}

/// Number of live connections (listeners included).
pub fn connection_count() -> usize {
    let table = TCP_TABLE.lock();
    table.slots.iter().filter(|s| s.conn.is_some()).count()
}

/// Release every connection and reset the ephemeral counter (shutdown
/// path).
pub fn reset() {
    let mut table = TCP_TABLE.lock();
    for i in 0..MAX_CONNECTIONS {
        if table.slots[i].conn.is_some() {
            table.release(i);
        }
    }
    NEXT_EPHEMERAL.store(49152, Ordering::Relaxed);
}

// =============================================================================
// Ingress
// =============================================================================

/// Process one TCP segment. `src_ip` is the validated source address from
/// the IPv4 header.
pub fn handle_rx(src_ip: Ipv4Addr, segment: &[u8]) {
    let Some(hdr) = parse_header(segment) else {
        return;
    };
    let payload = &segment[hdr.header_len()..];

    let response = {
        let mut table = TCP_TABLE.lock();
        let Some(index) = table.demux(src_ip, hdr.src_port, hdr.dst_port) else {
            klog_debug!(
                "tcp: no connection for {}:{} -> port {}",
                src_ip,
                hdr.src_port,
                hdr.dst_port
            );
            return;
        };
        process_segment(&mut table, index, src_ip, &hdr, payload)
    };

    if let Some(meta) = response {
        transmit_segment(&meta, &[]);
    }
}

/// Run one segment through the automaton. Called with the table lock held;
/// returns the response segment to emit after release.
fn process_segment(
    table: &mut TcpTable,
    index: usize,
    src_ip: Ipv4Addr,
    hdr: &TcpHeader,
    payload: &[u8],
) -> Option<SegmentMeta> {
    let conn = table.slots[index].conn.as_mut()?;
    let flags = hdr.flags;

    match conn.state {
        TcpState::Listen => {
            if !flags.contains(TcpFlags::SYN) || flags.contains(TcpFlags::RST) {
                return None;
            }
            // The listener itself becomes the connection; the socket layer
            // re-arms a new listener after accept.
            conn.remote = SockAddr::new(src_ip, hdr.src_port);
            if conn.local.ip.is_unspecified() {
                conn.local.ip = NET_STACK.ipv4();
            }
            conn.rcv_nxt = hdr.seq.wrapping_add(1);
            conn.recv_ring.reset(conn.rcv_nxt);
            conn.snd_una = PASSIVE_OPEN_ISS;
            conn.snd_nxt = PASSIVE_OPEN_ISS;
            conn.snd_wnd = hdr.window;
            conn.send_ring.reset(PASSIVE_OPEN_ISS.wrapping_add(1));

            let meta = SegmentMeta {
                local: conn.local,
                remote: conn.remote,
                seq: conn.snd_nxt,
                ack: conn.rcv_nxt,
                flags: TcpFlags::SYN | TcpFlags::ACK,
                window: conn.rcv_wnd,
            };
            conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
            conn.state = TcpState::SynReceived;
            klog_debug!("tcp: LISTEN -> SYN_RECEIVED ({})", conn.remote);
            Some(meta)
        }

        TcpState::SynSent => {
            if !flags.contains(TcpFlags::SYN | TcpFlags::ACK) || flags.contains(TcpFlags::RST) {
                return None;
            }
            conn.rcv_nxt = hdr.seq.wrapping_add(1);
            conn.recv_ring.reset(conn.rcv_nxt);
            conn.snd_una = hdr.ack;
            conn.snd_wnd = hdr.window;
            conn.state = TcpState::Established;
            klog_debug!("tcp: SYN_SENT -> ESTABLISHED ({})", conn.remote);

            Some(SegmentMeta {
                local: conn.local,
                remote: conn.remote,
                seq: conn.snd_nxt,
                ack: conn.rcv_nxt,
                flags: TcpFlags::ACK,
                window: conn.rcv_wnd,
            })
        }

        TcpState::SynReceived => {
            if !flags.contains(TcpFlags::ACK) || flags.contains(TcpFlags::RST) {
                return None;
            }
            conn.snd_una = hdr.ack;
            conn.snd_wnd = hdr.window;
            conn.state = TcpState::Established;
            klog_debug!("tcp: SYN_RECEIVED -> ESTABLISHED ({})", conn.remote);
            None
        }

        TcpState::Established => {
            if flags.contains(TcpFlags::FIN) {
                conn.rcv_nxt = hdr.seq.wrapping_add(1);
                conn.state = TcpState::CloseWait;
                klog_debug!("tcp: ESTABLISHED -> CLOSE_WAIT ({})", conn.remote);
                return Some(ack_segment(conn));
            }
            if !flags.contains(TcpFlags::ACK) {
                return None;
            }

            if seq_gt(hdr.ack, conn.snd_una) && seq_le(hdr.ack, conn.snd_nxt) {
                conn.snd_una = hdr.ack;
                conn.send_ring.release_to(hdr.ack);
                conn.snd_wnd = hdr.window;
            }

            if payload.is_empty() {
                return None;
            }
            if hdr.seq != conn.rcv_nxt {
                klog_debug!(
                    "tcp: out-of-order segment (seq={}, expected={})",
                    hdr.seq,
                    conn.rcv_nxt
                );
                return None;
            }
            if conn.recv_ring.free() < payload.len() {
                klog_debug!("tcp: receive ring full, segment dropped");
                return None;
            }
            conn.recv_ring.write(payload);
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);
            Some(ack_segment(conn))
        }

        TcpState::FinWait1 => {
            if flags.contains(TcpFlags::FIN | TcpFlags::ACK) {
                conn.rcv_nxt = hdr.seq.wrapping_add(1);
                conn.state = TcpState::TimeWait;
                klog_debug!("tcp: FIN_WAIT_1 -> TIME_WAIT ({})", conn.remote);
                Some(ack_segment(conn))
            } else if flags.contains(TcpFlags::ACK) {
                conn.state = TcpState::FinWait2;
                klog_debug!("tcp: FIN_WAIT_1 -> FIN_WAIT_2 ({})", conn.remote);
                None
            } else if flags.contains(TcpFlags::FIN) {
                conn.rcv_nxt = hdr.seq.wrapping_add(1);
                conn.state = TcpState::Closing;
                klog_debug!("tcp: FIN_WAIT_1 -> CLOSING ({})", conn.remote);
                Some(ack_segment(conn))
            } else {
                None
            }
        }

        TcpState::FinWait2 => {
            if flags.contains(TcpFlags::FIN) {
                conn.rcv_nxt = hdr.seq.wrapping_add(1);
                conn.state = TcpState::TimeWait;
                klog_debug!("tcp: FIN_WAIT_2 -> TIME_WAIT ({})", conn.remote);
                Some(ack_segment(conn))
            } else {
                None
            }
        }

        TcpState::Closing => {
            if flags.contains(TcpFlags::ACK) {
                conn.state = TcpState::TimeWait;
                klog_debug!("tcp: CLOSING -> TIME_WAIT ({})", conn.remote);
            }
            None
        }

        TcpState::LastAck => {
            if flags.contains(TcpFlags::ACK) {
                klog_debug!("tcp: LAST_ACK -> CLOSED ({})", conn.remote);
                table.release(index);
            }
            None
        }

        // No listed transitions from these states on network input.
        TcpState::Closed | TcpState::CloseWait | TcpState::TimeWait => None,
    }
}

/// Plain ACK carrying the connection's current sequence and window state.
fn ack_segment(conn: &TcpConnection) -> SegmentMeta {
    SegmentMeta {
        local: conn.local,
        remote: conn.remote,
        seq: conn.snd_nxt,
        ack: conn.rcv_nxt,
        flags: TcpFlags::ACK,
        window: conn.rcv_wnd,
    }
}
