//! IPv4 tests: ICMP echo, ingress validation drops, and routing decisions.

use opal_lib::testing::TestResult;
use opal_lib::{assert_eq_test, assert_test, pass};

use crate::ipv4::{is_local, next_hop};
use crate::stack::NET_STACK;
use crate::test_fixtures::{
    GATEWAY, OUR_IP, PEER_IP, PEER_MAC, captured_frames, eth_dst, eth_ethertype, icmp_echo_request,
    ip_dst, ip_header, ip_src, ipv4_frame, l4_segment, reset_world, warm_peer_arp,
};
use crate::types::{EtherType, IpProtocol, Ipv4Addr};
use crate::wire::internet_checksum;

pub fn test_icmp_echo_reply() -> TestResult {
    reset_world();
    warm_peer_arp();

    let request = icmp_echo_request(0x1234, 0x0001, b"abcdefgh");
    NET_STACK.receive_packet(&ipv4_frame(PEER_IP, OUR_IP, IpProtocol::Icmp, &request));

    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "exactly one echo reply");
    let frame = &frames[0];

    assert_eq_test!(eth_dst(frame), PEER_MAC, "reply framed to the sender");
    assert_eq_test!(eth_ethertype(frame), EtherType::Ipv4.as_u16(), "reply is IPv4");

    let hdr = ip_header(frame);
    assert_eq_test!(hdr[0], 0x45, "version 4, no options");
    assert_eq_test!(hdr[8], 64, "TTL 64");
    assert_eq_test!(hdr[9], IpProtocol::Icmp.as_u8(), "protocol ICMP");
    assert_eq_test!(
        u16::from_be_bytes([hdr[6], hdr[7]]),
        0x4000,
        "don't-fragment set"
    );
    assert_eq_test!(internet_checksum(hdr), 0, "IP header checksum verifies");
    assert_eq_test!(ip_src(frame), OUR_IP, "source is ours");
    assert_eq_test!(ip_dst(frame), PEER_IP, "destination is the requester");

    let icmp = l4_segment(frame);
    assert_eq_test!(icmp[0], 0, "echo reply type");
    assert_eq_test!(icmp[1], 0, "code 0");
    assert_eq_test!(internet_checksum(icmp), 0, "ICMP checksum verifies");
    assert_eq_test!(
        u16::from_be_bytes([icmp[4], icmp[5]]),
        0x1234,
        "identifier preserved"
    );
    assert_eq_test!(
        u16::from_be_bytes([icmp[6], icmp[7]]),
        0x0001,
        "sequence preserved"
    );
    assert_eq_test!(&icmp[8..], b"abcdefgh", "payload preserved");
    pass!()
}

pub fn test_bad_header_checksum_dropped() -> TestResult {
    reset_world();
    warm_peer_arp();

    let request = icmp_echo_request(1, 1, b"x");
    let mut frame = ipv4_frame(PEER_IP, OUR_IP, IpProtocol::Icmp, &request);
    // Corrupt the IP header checksum.
    frame[24] ^= 0xFF;
    NET_STACK.receive_packet(&frame);

    assert_eq_test!(captured_frames().len(), 0, "corrupted packet answered");
    pass!()
}

pub fn test_wrong_version_dropped() -> TestResult {
    reset_world();
    warm_peer_arp();

    let request = icmp_echo_request(1, 1, b"x");
    let mut frame = ipv4_frame(PEER_IP, OUR_IP, IpProtocol::Icmp, &request);
    frame[14] = 0x65; // version 6, IHL 5
    NET_STACK.receive_packet(&frame);

    assert_eq_test!(captured_frames().len(), 0, "non-v4 packet answered");
    pass!()
}

pub fn test_foreign_destination_dropped() -> TestResult {
    reset_world();
    warm_peer_arp();

    let request = icmp_echo_request(1, 1, b"x");
    let frame = ipv4_frame(PEER_IP, Ipv4Addr([10, 0, 0, 99]), IpProtocol::Icmp, &request);
    NET_STACK.receive_packet(&frame);

    assert_eq_test!(captured_frames().len(), 0, "packet for another host answered");
    pass!()
}

pub fn test_unknown_protocol_dropped() -> TestResult {
    reset_world();
    warm_peer_arp();

    let mut packet = crate::test_fixtures::ipv4_header(PEER_IP, OUR_IP, IpProtocol::Icmp, 4);
    packet[9] = 99; // unknown protocol, fix the checksum afterwards
    packet[10] = 0;
    packet[11] = 0;
    let checksum = internet_checksum(&packet);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
    packet.extend_from_slice(&[1, 2, 3, 4]);

    NET_STACK.receive_packet(&crate::test_fixtures::eth_frame(
        crate::test_fixtures::OUR_MAC,
        PEER_MAC,
        EtherType::Ipv4.as_u16(),
        &packet,
    ));

    assert_eq_test!(captured_frames().len(), 0, "unknown protocol answered");
    pass!()
}

pub fn test_routing_decisions() -> TestResult {
    reset_world();

    assert_test!(is_local(Ipv4Addr([10, 0, 0, 77])), "same /24 is local");
    assert_test!(!is_local(Ipv4Addr([10, 0, 1, 77])), "other subnet is not local");

    assert_eq_test!(
        next_hop(Ipv4Addr([10, 0, 0, 77])),
        Ipv4Addr([10, 0, 0, 77]),
        "local hosts are their own next hop"
    );
    assert_eq_test!(
        next_hop(Ipv4Addr([192, 168, 1, 5])),
        GATEWAY,
        "off-subnet traffic routes via the gateway"
    );
    pass!()
}

opal_lib::define_test_suite!(
    ipv4,
    [
        test_icmp_echo_reply,
        test_bad_header_checksum_dropped,
        test_wrong_version_dropped,
        test_foreign_destination_dropped,
        test_unknown_protocol_dropped,
        test_routing_decisions,
    ]
);
