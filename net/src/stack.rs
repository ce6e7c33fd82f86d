//! Centralised stack state and the NIC boundary.
//!
//! [`NET_STACK`] is the single source of truth for the interface
//! configuration (MAC, IPv4 address, netmask, gateway) and owns the two
//! crossing points with the NIC driver: [`NetStack::receive_packet`] on
//! ingress (called from the driver's DMA-completion path; the stack copies
//! what it needs and never retains the buffer) and the registered transmit
//! callback on egress.
//!
//! `initialize()` is idempotent; `shutdown()` tears the layers down in
//! reverse creation order (UDP, TCP, IP, then Ethernet/ARP).

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use opal_lib::{IrqMutex, klog_debug, klog_info};
use spin::Once;

use crate::types::{Ipv4Addr, MacAddr};
use crate::{arp, ethernet, ipv4, tcp, udp};

/// Driver egress entry: hands one complete Ethernet frame to the NIC.
pub type TransmitFn = fn(&[u8]);

#[derive(Clone, Copy)]
struct IfaceConfig {
    mac: MacAddr,
    ipv4: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
}

impl IfaceConfig {
    const fn unconfigured() -> Self {
        Self {
            mac: MacAddr::ZERO,
            ipv4: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

static TRANSMIT_CALLBACK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub struct NetStack {
    config: IrqMutex<IfaceConfig>,
    init: Once<()>,
}

/// The global network stack instance.
pub static NET_STACK: NetStack = NetStack::new();

impl NetStack {
    pub const fn new() -> Self {
        Self {
            config: IrqMutex::new(IfaceConfig::unconfigured()),
            init: Once::new(),
        }
    }

    /// Bring the stack up. Safe to call repeatedly; later calls leave all
    /// existing state untouched.
    pub fn initialize(&self) {
        self.init.call_once(|| {
            klog_info!("netstack: online");
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.init.is_completed()
    }

    /// Assign the interface configuration.
    pub fn configure(
        &self,
        mac: MacAddr,
        ipv4: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) {
        let mut config = self.config.lock();
        config.mac = mac;
        config.ipv4 = ipv4;
        config.netmask = netmask;
        config.gateway = gateway;
        klog_info!("netstack: {} ({}) gw {}", ipv4, mac, gateway);
    }

    pub fn mac(&self) -> MacAddr {
        self.config.lock().mac
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        self.config.lock().ipv4
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.config.lock().netmask
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.config.lock().gateway
    }

    /// Register the driver egress entry used for all outgoing frames.
    pub fn set_transmit_callback(&self, callback: TransmitFn) {
        TRANSMIT_CALLBACK.store(callback as *mut (), Ordering::Release);
    }

    /// Drop the egress registration; frames are discarded until a new
    /// callback arrives.
    pub fn clear_transmit_callback(&self) {
        TRANSMIT_CALLBACK.store(ptr::null_mut(), Ordering::Release);
    }

    /// Hand a finished frame to the NIC. No stack lock is held here: the
    /// callers build and release their table locks before transmitting.
    pub fn transmit(&self, frame: &[u8]) {
        let raw = TRANSMIT_CALLBACK.load(Ordering::Acquire);
        if raw.is_null() {
            klog_debug!("netstack: no transmit callback, {} bytes dropped", frame.len());
            return;
        }
        // SAFETY: only `set_transmit_callback` stores here, always a valid
        // `TransmitFn`.
        let callback: TransmitFn = unsafe { core::mem::transmute(raw) };
        callback(frame);
    }

    /// Driver ingress entry, invoked on NIC DMA completion. The frame is
    /// parsed (and copied where it must outlive the call) before returning.
    pub fn receive_packet(&self, frame: &[u8]) {
        ethernet::handle_rx(frame);
    }

    /// Tear down all protocol state in reverse creation order.
    pub fn shutdown(&self) {
        udp::reset();
        tcp::reset();
        ipv4::reset();
        arp::reset();
        *self.config.lock() = IfaceConfig::unconfigured();
        klog_info!("netstack: shut down");
    }
}

impl Default for NetStack {
    fn default() -> Self {
        Self::new()
    }
}
