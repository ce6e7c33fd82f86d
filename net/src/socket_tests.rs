//! Socket façade tests: delegation to the transports, the accept/re-arm
//! flow, option stubs, and teardown through close and drop.

use opal_lib::testing::TestResult;
use opal_lib::{assert_eq_test, assert_ok, assert_test, pass};

use crate::socket::{Socket, SocketOption, SocketType};
use crate::stack::NET_STACK;
use crate::tcp::{self, TcpState};
use crate::test_fixtures::{
    OUR_IP, PEER_IP, captured_frames, clear_captured, ipv4_frame, l4_segment, reset_world,
    tcp_segment, udp_datagram, warm_peer_arp,
};
use crate::types::{IpProtocol, NetError, Port, SockAddr};
use crate::udp;

const SYN: u8 = 0x02;
const ACK: u8 = 0x10;

pub fn test_datagram_round_trip() -> TestResult {
    reset_world();
    warm_peer_arp();

    let mut socket = Socket::new(SocketType::Datagram);
    assert_ok!(
        socket.bind(SockAddr::new(OUR_IP, Port(7))),
        "bind datagram socket"
    );
    assert_test!(socket.is_bound(), "bound after bind");

    let datagram = udp_datagram(PEER_IP, OUR_IP, 1234, 7, b"hello");
    NET_STACK.receive_packet(&ipv4_frame(PEER_IP, OUR_IP, IpProtocol::Udp, &datagram));

    let mut buf = [0u8; 32];
    let received = assert_ok!(socket.recv_from(&mut buf), "recvfrom");
    let Some((len, source)) = received else {
        return opal_lib::fail!("expected a datagram");
    };
    assert_eq_test!(&buf[..len], b"hello", "payload");
    assert_eq_test!(source, SockAddr::new(PEER_IP, Port(1234)), "source tuple");

    let sent = assert_ok!(socket.send_to(source, b"hello"), "sendto");
    assert_eq_test!(sent, 5, "full datagram sent");
    assert_eq_test!(captured_frames().len(), 1, "one frame emitted");

    socket.close();
    assert_eq_test!(udp::binding_count(), 0, "binding released on close");
    assert_test!(!socket.is_bound(), "flags reset on close");
    pass!()
}

pub fn test_stream_connect_and_send() -> TestResult {
    reset_world();
    warm_peer_arp();

    let mut socket = Socket::new(SocketType::Stream);
    assert_ok!(socket.connect(SockAddr::new(PEER_IP, Port(80))), "connect");
    assert_test!(socket.is_connected(), "connected after SYN leaves");
    assert_test!(socket.local_addr().port.is_ephemeral(), "ephemeral local port");

    // Complete the handshake.
    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "SYN emitted");
    let syn = l4_segment(&frames[0]);
    let local_port = u16::from_be_bytes([syn[0], syn[1]]);
    let our_next = u32::from_be_bytes([syn[4], syn[5], syn[6], syn[7]]).wrapping_add(1);
    NET_STACK.receive_packet(&ipv4_frame(
        PEER_IP,
        OUR_IP,
        IpProtocol::Tcp,
        &tcp_segment(
            PEER_IP, OUR_IP, 80, local_port, 4000, our_next, SYN | ACK, 8192, &[],
        ),
    ));
    clear_captured();

    let sent = assert_ok!(socket.send(b"GET /"), "send");
    assert_eq_test!(sent, 5, "payload accepted");
    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "data segment emitted");
    assert_eq_test!(&l4_segment(&frames[0])[20..], b"GET /", "payload on the wire");

    socket.close();
    assert_test!(!socket.is_connected(), "flags reset on close");
    pass!()
}

pub fn test_accept_wraps_connection_and_rearms() -> TestResult {
    reset_world();
    warm_peer_arp();

    let mut listener = Socket::new(SocketType::Stream);
    assert_ok!(listener.bind(SockAddr::new(OUR_IP, Port(80))), "bind");
    assert_ok!(listener.listen(16), "listen");
    assert_test!(listener.is_listening(), "listening");

    // Nothing to accept yet.
    let pending = assert_ok!(listener.accept(), "accept on idle listener");
    assert_test!(pending.is_none(), "no connection before a handshake");

    // A peer completes the three-way handshake.
    NET_STACK.receive_packet(&ipv4_frame(
        PEER_IP,
        OUR_IP,
        IpProtocol::Tcp,
        &tcp_segment(PEER_IP, OUR_IP, 40000, 80, 5000, 0, SYN, 4096, &[]),
    ));
    let frames = captured_frames();
    assert_eq_test!(frames.len(), 1, "SYN|ACK emitted");
    let syn_ack = l4_segment(&frames[0]);
    let our_next = u32::from_be_bytes([syn_ack[4], syn_ack[5], syn_ack[6], syn_ack[7]])
        .wrapping_add(1);
    NET_STACK.receive_packet(&ipv4_frame(
        PEER_IP,
        OUR_IP,
        IpProtocol::Tcp,
        &tcp_segment(PEER_IP, OUR_IP, 40000, 80, 5001, our_next, ACK, 4096, &[]),
    ));

    let accepted = assert_ok!(listener.accept(), "accept");
    let Some((child, peer)) = accepted else {
        return opal_lib::fail!("expected an accepted connection");
    };
    assert_eq_test!(peer, SockAddr::new(PEER_IP, Port(40000)), "peer address");
    assert_test!(child.is_connected(), "child is connected");
    assert_eq_test!(
        child.tcp_handle().and_then(tcp::state),
        Some(TcpState::Established),
        "child wraps the established connection"
    );

    // The listener re-armed on the same port: established child + fresh
    // listener.
    assert_test!(listener.is_listening(), "listener still listening");
    assert_eq_test!(tcp::connection_count(), 2, "child plus re-armed listener");
    assert_eq_test!(
        listener.tcp_handle().and_then(tcp::state),
        Some(TcpState::Listen),
        "fresh listener in place"
    );
    pass!()
}

pub fn test_double_bind_rejected() -> TestResult {
    reset_world();

    let mut socket = Socket::new(SocketType::Datagram);
    assert_ok!(socket.bind(SockAddr::new(OUR_IP, Port(9000))), "first bind");
    assert_eq_test!(
        socket.bind(SockAddr::new(OUR_IP, Port(9001))),
        Err(NetError::Error),
        "second bind on the same socket"
    );
    pass!()
}

pub fn test_options_not_supported() -> TestResult {
    reset_world();

    let mut socket = Socket::new(SocketType::Stream);
    let mut out = [0u8; 8];
    for option in [
        SocketOption::ReuseAddr,
        SocketOption::KeepAlive,
        SocketOption::NoDelay,
        SocketOption::Broadcast,
        SocketOption::SendTimeout,
        SocketOption::RecvTimeout,
        SocketOption::SendBufferSize,
        SocketOption::RecvBufferSize,
    ] {
        assert_eq_test!(
            socket.set_option(option, &[1]),
            Err(NetError::NotSupported),
            "set_option must report NotSupported"
        );
        assert_eq_test!(
            socket.get_option(option, &mut out),
            Err(NetError::NotSupported),
            "get_option must report NotSupported"
        );
    }
    pass!()
}

pub fn test_raw_sockets_not_supported() -> TestResult {
    reset_world();

    let mut socket = Socket::new(SocketType::Raw);
    assert_eq_test!(
        socket.bind(SockAddr::new(OUR_IP, Port(1))),
        Err(NetError::NotSupported),
        "raw bind"
    );
    assert_eq_test!(
        socket.connect(SockAddr::new(PEER_IP, Port(1))),
        Err(NetError::NotSupported),
        "raw connect"
    );
    pass!()
}

pub fn test_stream_datagram_mismatches() -> TestResult {
    reset_world();

    let mut stream = Socket::new(SocketType::Stream);
    assert_eq_test!(
        stream.send_to(SockAddr::new(PEER_IP, Port(1)), b"x"),
        Err(NetError::Error),
        "sendto on a stream socket"
    );

    let mut datagram = Socket::new(SocketType::Datagram);
    assert_eq_test!(
        datagram.listen(1),
        Err(NetError::Error),
        "listen on a datagram socket"
    );
    pass!()
}

pub fn test_sockaddr_user_layout_round_trip() -> TestResult {
    let addr = SockAddr::new(PEER_IP, Port(8080));
    let raw = addr.to_user();
    assert_eq_test!(raw.family, opal_abi::net::AF_INET, "address family");
    assert_eq_test!(raw.port, 8080u16.to_be(), "port stored big-endian");
    assert_eq_test!(raw.addr, PEER_IP.0, "octets in wire order");

    let back = assert_ok!(SockAddr::from_user(&raw), "parse back");
    assert_eq_test!(back, addr, "round trip");

    let mut bogus = raw;
    bogus.family = 99;
    assert_eq_test!(
        SockAddr::from_user(&bogus),
        Err(NetError::NotSupported),
        "foreign address family rejected"
    );
    pass!()
}

pub fn test_drop_releases_binding() -> TestResult {
    reset_world();

    {
        let mut socket = Socket::new(SocketType::Datagram);
        assert_ok!(socket.bind(SockAddr::new(OUR_IP, Port(9100))), "bind");
        assert_eq_test!(udp::binding_count(), 1, "binding live");
    }
    assert_eq_test!(udp::binding_count(), 0, "binding released on drop");
    pass!()
}

opal_lib::define_test_suite!(
    socket,
    [
        test_datagram_round_trip,
        test_stream_connect_and_send,
        test_accept_wraps_connection_and_rearms,
        test_double_bind_rejected,
        test_options_not_supported,
        test_raw_sockets_not_supported,
        test_stream_datagram_mismatches,
        test_sockaddr_user_layout_round_trip,
        test_drop_releases_binding,
    ]
);
