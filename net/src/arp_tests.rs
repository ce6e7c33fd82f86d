//! ARP tests: directed request/reply, cache LRU replacement, and the
//! park-and-flush path for unresolved next hops.

use opal_lib::testing::TestResult;
use opal_lib::{assert_eq_test, assert_ok, assert_test, pass};

use crate::arp::{ARP_CACHE, ARP_CACHE_SIZE};
use crate::pktbuf::PacketBuf;
use crate::stack::NET_STACK;
use crate::test_fixtures::{
    OUR_IP, OUR_MAC, PEER_IP, PEER_MAC, arp_reply_frame, arp_request_frame, captured_frames,
    clear_captured, eth_dst, eth_ethertype, eth_payload, reset_world,
};
use crate::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr};
use crate::{ipv4, wire};

pub fn test_reply_to_directed_request() -> TestResult {
    reset_world();

    NET_STACK.receive_packet(&arp_request_frame(PEER_MAC, PEER_IP, OUR_IP));

    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "exactly one reply frame");
    let frame = &frames[0];

    assert_eq_test!(eth_dst(frame), PEER_MAC, "reply goes to the requester");
    assert_eq_test!(eth_ethertype(frame), EtherType::Arp.as_u16(), "reply is ARP");

    let body = eth_payload(frame);
    let oper = u16::from_be_bytes([body[6], body[7]]);
    assert_eq_test!(oper, 2, "opcode is reply");
    assert_eq_test!(&body[8..14], &OUR_MAC.0[..], "sender MAC is ours");
    assert_eq_test!(&body[14..18], &OUR_IP.0[..], "sender IP is ours");
    assert_eq_test!(&body[18..24], &PEER_MAC.0[..], "target MAC is the requester");
    assert_eq_test!(&body[24..28], &PEER_IP.0[..], "target IP is the requester");

    // The request's sender pair is now cached.
    assert_eq_test!(ARP_CACHE.lookup(PEER_IP), Some(PEER_MAC), "sender cached");
    pass!()
}

pub fn test_request_for_other_host_ignored() -> TestResult {
    reset_world();

    NET_STACK.receive_packet(&arp_request_frame(
        PEER_MAC,
        PEER_IP,
        Ipv4Addr([10, 0, 0, 99]),
    ));

    assert_eq_test!(captured_frames().len(), 0, "no reply for a foreign target");
    // The sender pair is still learned.
    assert_test!(ARP_CACHE.contains(PEER_IP), "sender still cached");
    pass!()
}

pub fn test_malformed_arp_dropped() -> TestResult {
    reset_world();

    // Truncated packet.
    NET_STACK.receive_packet(&arp_request_frame(PEER_MAC, PEER_IP, OUR_IP)[..20]);
    // Wrong hardware type.
    let mut frame = arp_request_frame(PEER_MAC, PEER_IP, OUR_IP);
    frame[14] = 0x00;
    frame[15] = 0x07;
    NET_STACK.receive_packet(&frame);

    assert_eq_test!(captured_frames().len(), 0, "malformed ARP produced output");
    assert_eq_test!(ARP_CACHE.entry_count(), 0, "malformed ARP reached the cache");
    pass!()
}

pub fn test_cache_lru_replacement() -> TestResult {
    reset_world();

    // Fill all slots.
    for i in 0..ARP_CACHE_SIZE {
        let ip = Ipv4Addr([10, 0, 1, i as u8]);
        let mac = MacAddr([0x02, 0, 0, 0, 1, i as u8]);
        assert_test!(ARP_CACHE.insert(ip, mac).is_empty(), "no parked packets");
    }
    assert_eq_test!(ARP_CACHE.entry_count(), ARP_CACHE_SIZE, "cache full");

    // Refresh the oldest entry so it is no longer the LRU victim.
    let first = Ipv4Addr([10, 0, 1, 0]);
    assert_test!(ARP_CACHE.lookup(first).is_some(), "first entry resolvable");

    // One more insert evicts the now-oldest entry (the second one).
    let newcomer = Ipv4Addr([10, 0, 2, 1]);
    ARP_CACHE.insert(newcomer, MacAddr([0x02, 0, 0, 0, 2, 1]));

    assert_test!(ARP_CACHE.contains(first), "refreshed entry survives");
    assert_test!(ARP_CACHE.contains(newcomer), "newcomer present");
    assert_test!(
        !ARP_CACHE.contains(Ipv4Addr([10, 0, 1, 1])),
        "least recently used entry evicted"
    );
    assert_eq_test!(ARP_CACHE.entry_count(), ARP_CACHE_SIZE, "capacity unchanged");
    pass!()
}

pub fn test_unresolved_send_parks_and_flushes() -> TestResult {
    reset_world();

    let neighbour_ip = Ipv4Addr([10, 0, 0, 7]);
    let neighbour_mac = MacAddr([0x02, 0, 0, 0, 0, 7]);

    // Sending to an unresolved on-link host parks the packet and broadcasts
    // a request.
    let mut pkt = assert_ok!(PacketBuf::alloc(16), "packet allocation");
    assert_ok!(pkt.append(b"parked-payload"), "payload append");
    assert_ok!(ipv4::send(neighbour_ip, IpProtocol::Udp, pkt), "ipv4 send");

    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "only the ARP request leaves");
    assert_eq_test!(eth_ethertype(&frames[0]), EtherType::Arp.as_u16(), "frame is ARP");
    assert_eq_test!(eth_dst(&frames[0]), MacAddr::BROADCAST, "request is broadcast");
    let body = eth_payload(&frames[0]);
    assert_eq_test!(&body[24..28], &neighbour_ip.0[..], "request targets the hop");

    // The matching reply flushes the parked packet.
    clear_captured();
    NET_STACK.receive_packet(&arp_reply_frame(neighbour_mac, neighbour_ip, OUR_MAC, OUR_IP));

    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "parked packet flushed by the reply");
    let flushed = &frames[0];
    assert_eq_test!(eth_ethertype(flushed), EtherType::Ipv4.as_u16(), "flushed frame is IPv4");
    assert_eq_test!(eth_dst(flushed), neighbour_mac, "flushed frame uses resolved MAC");
    // Our IP header is intact, checksum included.
    assert_eq_test!(
        wire::internet_checksum(crate::test_fixtures::ip_header(flushed)),
        0,
        "flushed IP header checksum verifies"
    );
    pass!()
}

opal_lib::define_test_suite!(
    arp,
    [
        test_reply_to_directed_request,
        test_request_for_other_host_ignored,
        test_malformed_arp_dropped,
        test_cache_lru_replacement,
        test_unresolved_send_parks_and_flushes,
    ]
);
