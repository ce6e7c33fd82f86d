//! Stack lifecycle tests: idempotent init, configuration, the transmit
//! boundary, and ordered shutdown.

use opal_lib::testing::TestResult;
use opal_lib::{assert_eq_test, assert_ok, assert_test, pass};

use crate::arp::ARP_CACHE;
use crate::stack::NET_STACK;
use crate::test_fixtures::{
    GATEWAY, NETMASK, OUR_IP, OUR_MAC, PEER_IP, PEER_MAC, arp_reply_frame, captured_frames,
    reset_world,
};
use crate::types::{Ipv4Addr, MacAddr, Port};
use crate::{tcp, udp};

pub fn test_initialize_is_idempotent() -> TestResult {
    reset_world();
    assert_test!(NET_STACK.is_initialized(), "initialized");

    // A second initialize must not disturb existing state.
    NET_STACK.initialize();
    assert_eq_test!(NET_STACK.ipv4(), OUR_IP, "address survives re-init");
    assert_eq_test!(NET_STACK.mac(), OUR_MAC, "MAC survives re-init");

    let binding = assert_ok!(udp::bind(Port(4000)), "bind");
    NET_STACK.initialize();
    assert_eq_test!(udp::binding_count(), 1, "bindings survive re-init");
    udp::unbind(binding);
    pass!()
}

pub fn test_configure_accessors() -> TestResult {
    reset_world();

    assert_eq_test!(NET_STACK.mac(), OUR_MAC, "mac");
    assert_eq_test!(NET_STACK.ipv4(), OUR_IP, "address");
    assert_eq_test!(NET_STACK.netmask(), NETMASK, "netmask");
    assert_eq_test!(NET_STACK.gateway(), GATEWAY, "gateway");
    pass!()
}

pub fn test_transmit_without_callback_is_safe() -> TestResult {
    reset_world();
    NET_STACK.clear_transmit_callback();

    // Frames are discarded, not crashed on.
    NET_STACK.transmit(&[0u8; 60]);
    NET_STACK.receive_packet(&arp_reply_frame(PEER_MAC, PEER_IP, OUR_MAC, OUR_IP));
    pass!()
}

pub fn test_runt_frames_ignored() -> TestResult {
    reset_world();

    NET_STACK.receive_packet(&[]);
    NET_STACK.receive_packet(&[0xFF; 5]);
    NET_STACK.receive_packet(&[0xFF; 13]);
    assert_eq_test!(captured_frames().len(), 0, "runt frames answered");
    pass!()
}

pub fn test_shutdown_clears_all_tables() -> TestResult {
    reset_world();

    let _binding = assert_ok!(udp::bind(Port(4100)), "bind");
    let _listener = assert_ok!(tcp::listen(Port(4101)), "listen");
    ARP_CACHE.insert(PEER_IP, PEER_MAC);

    assert_eq_test!(udp::binding_count(), 1, "udp live");
    assert_eq_test!(tcp::connection_count(), 1, "tcp live");
    assert_eq_test!(ARP_CACHE.entry_count(), 1, "arp live");

    NET_STACK.shutdown();

    assert_eq_test!(udp::binding_count(), 0, "udp cleared");
    assert_eq_test!(tcp::connection_count(), 0, "tcp cleared");
    assert_eq_test!(ARP_CACHE.entry_count(), 0, "arp cleared");
    assert_eq_test!(NET_STACK.ipv4(), Ipv4Addr::UNSPECIFIED, "address cleared");
    assert_eq_test!(NET_STACK.mac(), MacAddr::ZERO, "MAC cleared");
    pass!()
}

opal_lib::define_test_suite!(
    netstack,
    [
        test_initialize_is_idempotent,
        test_configure_accessors,
        test_transmit_without_callback_is_safe,
        test_runt_frames_ignored,
        test_shutdown_clears_all_tables,
    ]
);
