//! Opal network stack.
//!
//! A BSD-flavoured TCP/IP stack for a single-NIC desktop system: Ethernet
//! framing with an ARP cache, IPv4 with ICMP echo, UDP port bindings, a TCP
//! state machine, and a socket façade tying the transports together.
//!
//! # Data flow
//!
//! Ingress: the NIC driver calls [`stack::NET_STACK`]`.receive_packet` from
//! its DMA-completion path; the frame is demultiplexed down
//! Ethernet → ARP / IPv4 → ICMP / TCP / UDP and lands in a per-binding
//! datagram queue or a connection's receive ring. Egress mirrors the path in
//! reverse and leaves through the registered transmit callback.
//!
//! Every buffer on the packet path is an `alloc` allocation and therefore
//! comes out of the `opal-mm` kernel heap once the global allocator has been
//! switched over.
//!
//! # Concurrency
//!
//! Each shared table (ARP cache, UDP bindings, TCP connections, interface
//! config) sits behind its own `IrqMutex`. Locks are never held across the
//! transmit callback: cache and table methods collect work under the lock
//! and the caller performs the I/O afterwards.

#![no_std]

extern crate alloc;

// opal-mm provides the #[global_allocator] the alloc crate links against.
use opal_mm as _;

pub mod arp;
pub mod ethernet;
pub mod ipv4;
pub mod pktbuf;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod types;
pub mod udp;
pub mod wire;

pub mod test_fixtures;

pub mod arp_tests;
pub mod ipv4_tests;
pub mod socket_tests;
pub mod stack_tests;

pub use types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
