//! ARP: request/reply handling and the neighbour cache.
//!
//! Only Ethernet-hardware / IPv4-protocol ARP is recognised. Every valid ARP
//! message opportunistically refreshes the cache from its sender pair;
//! requests for our configured address are answered with a unicast reply.
//!
//! # Cache
//!
//! Fixed 64 entries. Replacement picks the first invalid slot, then the
//! least-recently-used live entry (a monotonic use-stamp, bumped on every
//! hit; there is no timed eviction). An entry whose MAC is still unknown
//! parks up to [`MAX_PENDING_PACKETS`] outbound packets; the matching reply
//! flushes them through the link layer. Cache methods collect that work
//! under the lock and the caller performs the transmits after releasing it.

extern crate alloc;

use alloc::vec::Vec;

use opal_lib::{IrqMutex, klog_debug};

use crate::ethernet;
use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::types::{EtherType, Ipv4Addr, MacAddr, NetError};

pub const ARP_HEADER_LEN: usize = 28;
pub const ARP_CACHE_SIZE: usize = 64;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_HLEN_ETHERNET: u8 = 6;
const ARP_PLEN_IPV4: u8 = 4;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;

/// Outbound packets parked per unresolved entry before further ones are
/// dropped.
pub const MAX_PENDING_PACKETS: usize = 4;

// =============================================================================
// Cache
// =============================================================================

struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    /// Use-stamp for LRU replacement.
    last_used: u64,
    /// MAC is known. An entry that is not valid but holds pending packets is
    /// awaiting a reply.
    valid: bool,
    pending: Vec<PacketBuf>,
}

impl ArpEntry {
    const fn empty() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddr::ZERO,
            last_used: 0,
            valid: false,
            pending: Vec::new(),
        }
    }

    fn live(&self) -> bool {
        self.valid || !self.pending.is_empty()
    }
}

struct ArpCacheInner {
    entries: [ArpEntry; ARP_CACHE_SIZE],
    clock: u64,
}

impl ArpCacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find(&mut self, ip: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.live() && e.ip == ip)
    }

    /// Slot for a new entry: first dead slot, else the LRU live one. The
    /// victim's parked packets (if any) are returned so the caller can log
    /// and drop them outside the lock.
    fn take_slot(&mut self) -> (usize, Vec<PacketBuf>) {
        if let Some(idx) = self.entries.iter().position(|e| !e.live()) {
            return (idx, Vec::new());
        }

        let mut victim = 0usize;
        let mut oldest = u64::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.last_used < oldest {
                oldest = entry.last_used;
                victim = i;
            }
        }

        let dropped = core::mem::take(&mut self.entries[victim].pending);
        self.entries[victim] = ArpEntry::empty();
        (victim, dropped)
    }
}

pub struct ArpCache {
    inner: IrqMutex<ArpCacheInner>,
}

/// The global neighbour cache.
pub static ARP_CACHE: ArpCache = ArpCache::new();

/// Outcome of [`ArpCache::resolve`].
pub enum ResolveOutcome {
    /// MAC known; the packet comes back for the caller to frame and send.
    Resolved { mac: MacAddr, pkt: PacketBuf },
    /// Resolution already in flight; the packet is parked (or dropped if the
    /// pending queue was full).
    Queued,
    /// New unresolved entry created, packet parked; the caller must
    /// broadcast an ARP request.
    RequestNeeded,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(ArpCacheInner {
                entries: [const { ArpEntry::empty() }; ARP_CACHE_SIZE],
                clock: 0,
            }),
        }
    }

    /// Cached MAC for `ip`, refreshing its LRU stamp.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let mut inner = self.inner.lock();
        let stamp = inner.tick();
        let idx = inner.find(ip)?;
        let entry = &mut inner.entries[idx];
        if !entry.valid {
            return None;
        }
        entry.last_used = stamp;
        Some(entry.mac)
    }

    /// Record `ip -> mac` (from an observed ARP sender pair). Returns any
    /// packets that were parked waiting for this resolution; the caller
    /// transmits them after releasing the lock.
    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr) -> Vec<PacketBuf> {
        let mut inner = self.inner.lock();
        let stamp = inner.tick();

        if let Some(idx) = inner.find(ip) {
            let entry = &mut inner.entries[idx];
            entry.mac = mac;
            entry.valid = true;
            entry.last_used = stamp;
            return core::mem::take(&mut entry.pending);
        }

        let (idx, evicted) = inner.take_slot();
        if !evicted.is_empty() {
            klog_debug!("arp: evicted entry with {} parked packets", evicted.len());
        }
        let entry = &mut inner.entries[idx];
        entry.ip = ip;
        entry.mac = mac;
        entry.valid = true;
        entry.last_used = stamp;
        Vec::new()
    }

    /// Resolve `ip` for transmission of `pkt`, parking the packet when the
    /// MAC is not yet known.
    pub fn resolve(&self, ip: Ipv4Addr, pkt: PacketBuf) -> ResolveOutcome {
        let mut inner = self.inner.lock();
        let stamp = inner.tick();

        if let Some(idx) = inner.find(ip) {
            let entry = &mut inner.entries[idx];
            entry.last_used = stamp;
            if entry.valid {
                return ResolveOutcome::Resolved {
                    mac: entry.mac,
                    pkt,
                };
            }
            if entry.pending.len() < MAX_PENDING_PACKETS {
                entry.pending.push(pkt);
            } else {
                klog_debug!("arp: pending queue full for {}, dropping packet", ip);
            }
            return ResolveOutcome::Queued;
        }

        let (idx, evicted) = inner.take_slot();
        if !evicted.is_empty() {
            klog_debug!("arp: evicted entry with {} parked packets", evicted.len());
        }
        let entry = &mut inner.entries[idx];
        entry.ip = ip;
        entry.mac = MacAddr::ZERO;
        entry.valid = false;
        entry.last_used = stamp;
        entry.pending.clear();
        entry.pending.push(pkt);
        ResolveOutcome::RequestNeeded
    }

    /// Whether `ip` is resolved in the cache (no LRU bump).
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .any(|e| e.valid && e.ip == ip)
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.iter().filter(|e| e.live()).count()
    }

    /// Drop every entry and parked packet.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            *entry = ArpEntry::empty();
        }
        inner.clock = 0;
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Handle one ARP packet (Ethernet header already consumed).
pub fn handle_rx(packet: &[u8]) {
    if packet.len() < ARP_HEADER_LEN {
        klog_debug!("arp: packet too short ({} bytes)", packet.len());
        return;
    }

    let htype = u16::from_be_bytes([packet[0], packet[1]]);
    let ptype = u16::from_be_bytes([packet[2], packet[3]]);
    let hlen = packet[4];
    let plen = packet[5];
    let oper = u16::from_be_bytes([packet[6], packet[7]]);

    if htype != ARP_HTYPE_ETHERNET
        || ptype != ARP_PTYPE_IPV4
        || hlen != ARP_HLEN_ETHERNET
        || plen != ARP_PLEN_IPV4
    {
        klog_debug!(
            "arp: not ethernet/ipv4 (htype={}, ptype=0x{:04x})",
            htype,
            ptype
        );
        return;
    }

    let sender_mac = MacAddr([
        packet[8], packet[9], packet[10], packet[11], packet[12], packet[13],
    ]);
    let sender_ip = Ipv4Addr([packet[14], packet[15], packet[16], packet[17]]);
    let target_ip = Ipv4Addr([packet[24], packet[25], packet[26], packet[27]]);

    // Refresh the cache from the sender pair, then flush anything that was
    // waiting for it, outside the cache lock.
    let parked = ARP_CACHE.insert(sender_ip, sender_mac);
    for pkt in parked {
        let _ = ethernet::send_frame(sender_mac, EtherType::Ipv4, pkt);
    }

    match oper {
        ARP_OPER_REPLY => {
            klog_debug!("arp: {} is {}", sender_ip, sender_mac);
        }
        ARP_OPER_REQUEST => {
            let our_ip = NET_STACK.ipv4();
            if target_ip == our_ip && !our_ip.is_unspecified() {
                send_reply(sender_ip, sender_mac);
            }
        }
        other => {
            klog_debug!("arp: unknown opcode {}", other);
        }
    }
}

// =============================================================================
// Egress
// =============================================================================

fn build_packet(oper: u16, target_ip: Ipv4Addr, target_mac: MacAddr) -> Result<PacketBuf, NetError> {
    let our_mac = NET_STACK.mac();
    let our_ip = NET_STACK.ipv4();

    let mut body = [0u8; ARP_HEADER_LEN];
    body[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    body[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    body[4] = ARP_HLEN_ETHERNET;
    body[5] = ARP_PLEN_IPV4;
    body[6..8].copy_from_slice(&oper.to_be_bytes());
    body[8..14].copy_from_slice(&our_mac.0);
    body[14..18].copy_from_slice(&our_ip.0);
    body[18..24].copy_from_slice(&target_mac.0);
    body[24..28].copy_from_slice(&target_ip.0);

    let mut pkt = PacketBuf::alloc(ARP_HEADER_LEN)?;
    pkt.append(&body)?;
    Ok(pkt)
}

/// Broadcast an ARP request for `target_ip`.
pub fn send_request(target_ip: Ipv4Addr) {
    let pkt = match build_packet(ARP_OPER_REQUEST, target_ip, MacAddr::ZERO) {
        Ok(pkt) => pkt,
        Err(e) => {
            klog_debug!("arp: request for {} dropped: {}", target_ip, e);
            return;
        }
    };
    let _ = ethernet::send_frame(MacAddr::BROADCAST, EtherType::Arp, pkt);
}

fn send_reply(target_ip: Ipv4Addr, target_mac: MacAddr) {
    let pkt = match build_packet(ARP_OPER_REPLY, target_ip, target_mac) {
        Ok(pkt) => pkt,
        Err(e) => {
            klog_debug!("arp: reply to {} dropped: {}", target_ip, e);
            return;
        }
    };
    let _ = ethernet::send_frame(target_mac, EtherType::Arp, pkt);
}

/// Resolve the next-hop MAC for `pkt`, parking it and broadcasting a request
/// when unresolved. `None` means the packet is in flight through the cache
/// (or was dropped); the ARP reply handler finishes the job.
pub fn resolve_or_park(next_hop: Ipv4Addr, pkt: PacketBuf) -> Option<(MacAddr, PacketBuf)> {
    match ARP_CACHE.resolve(next_hop, pkt) {
        ResolveOutcome::Resolved { mac, pkt } => Some((mac, pkt)),
        ResolveOutcome::Queued => None,
        ResolveOutcome::RequestNeeded => {
            send_request(next_hop);
            None
        }
    }
}

/// Clear all neighbour state (shutdown path).
pub fn reset() {
    ARP_CACHE.clear();
}
