use std::net::Ipv4Addr;

use proptest::prelude::*;

use toy_router::network::checksum;
use toy_router::network::icmp::{ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST, ICMP_TYPE_TIME_EXCEEDED};
use toy_router::network::ipv4::{protocol, Ipv4Datagram, Ipv4Utils};
use toy_router::service::dhcp::{DhcpMessage, DhcpMessageType, LeaseState};
use toy_router::service::dns::DnsQuery;
use toy_router::transport::tcp::{flags, TcpUtils};
use toy_router::transport::{TcpSegment, UdpUtils};
use toy_router::{
    Action, Application, ConnectionKey, Direction, Disposition, Egress, FirewallRule,
    IcmpReport, MacAddr, NetError, NetworkStack, StackConfig, Table, TcpConnection, TcpState,
    UdpDatagram, UpstreamQuery,
};

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
const PEER: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

#[derive(Default)]
struct Recorder {
    sent: Vec<Vec<u8>>,
    forwarded: Vec<(Vec<u8>, Ipv4Addr)>,
    dns: Vec<UpstreamQuery>,
}

impl Egress for Recorder {
    fn send_packet(&mut self, packet: &[u8]) {
        self.sent.push(packet.to_vec());
    }

    fn send_packet_to_gateway(&mut self, packet: &[u8], gateway: Ipv4Addr) {
        self.forwarded.push((packet.to_vec(), gateway));
    }

    fn forward_dns_query(&mut self, query: &UpstreamQuery) {
        self.dns.push(query.clone());
    }
}

#[derive(Default)]
struct Inbox {
    data: Vec<Vec<u8>>,
    udp: Vec<(u16, Vec<u8>)>,
    icmp: Vec<IcmpReport>,
}

impl Application for Inbox {
    fn process_application_data(&mut self, _connection: &TcpConnection, payload: &[u8]) {
        self.data.push(payload.to_vec());
    }

    fn process_udp_datagram(&mut self, datagram: &UdpDatagram<'_>) {
        self.udp.push((datagram.dst_port, datagram.payload.to_vec()));
    }

    fn icmp_report(&mut self, report: &IcmpReport) {
        self.icmp.push(report.clone());
    }
}

type Stack = NetworkStack<Recorder, Inbox>;

fn stack_with(config: StackConfig) -> Stack {
    let mut stack = NetworkStack::new(config, Recorder::default(), Inbox::default());
    stack
        .add_network_interface(
            MacAddr([2, 0, 0, 0, 0, 1]),
            LOCAL,
            Ipv4Addr::new(255, 255, 255, 0),
            GATEWAY,
            "eth0",
        )
        .unwrap();
    stack
}

fn stack() -> Stack {
    stack_with(StackConfig::default())
}

fn ip(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
    Ipv4Utils::build_packet(protocol, src, dst, 7, ttl, payload)
}

fn tcp(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let segment = TcpUtils::build_segment(PEER, LOCAL, src_port, dst_port, seq, ack, flags, 8192, payload);
    ip(protocol::TCP, PEER, LOCAL, 64, &segment)
}

fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let datagram = UdpUtils::build_datagram(src, dst, src_port, dst_port, payload);
    ip(protocol::UDP, src, dst, 64, &datagram)
}

fn echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut message = vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0];
    message.extend_from_slice(&identifier.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(b"ping");
    let sum = checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    message
}

/// Decode a TCP segment the stack sent to the peer: (flags, seq, ack).
fn sent_tcp(packet: &[u8]) -> (u8, u32, u32) {
    let datagram = Ipv4Datagram::parse(packet).unwrap();
    assert_eq!(datagram.header.protocol, protocol::TCP);
    let segment =
        TcpSegment::parse(datagram.header.src_addr, datagram.header.dst_addr, datagram.payload)
            .unwrap();
    (
        segment.header.flags(),
        segment.header.seq_number,
        segment.header.ack_number,
    )
}

fn sent_udp(packet: &[u8]) -> (Ipv4Addr, u16, Ipv4Addr, u16, Vec<u8>) {
    let datagram = Ipv4Datagram::parse(packet).unwrap();
    assert_eq!(datagram.header.protocol, protocol::UDP);
    let udp =
        UdpDatagram::parse(datagram.header.src_addr, datagram.header.dst_addr, datagram.payload)
            .unwrap();
    (
        udp.src_addr,
        udp.src_port,
        udp.dst_addr,
        udp.dst_port,
        udp.payload.to_vec(),
    )
}

const PEER_KEY: ConnectionKey = ConnectionKey {
    peer_addr: PEER,
    peer_port: 5000,
};

#[test]
fn syn_creates_one_connection_and_one_syn_ack() {
    let mut stack = stack();
    let result = stack.process_ip_packet(&tcp(5000, 80, 100, 0, flags::SYN, &[]), 0);

    assert_eq!(result, Ok(Disposition::Delivered));
    assert_eq!(stack.connections().len(), 1);
    let conn = stack.connections().get(&PEER_KEY).unwrap();
    assert_eq!(conn.state, TcpState::SynReceived);

    assert_eq!(stack.egress().sent.len(), 1);
    let (f, seq, ack) = sent_tcp(&stack.egress().sent[0]);
    assert_eq!(f, flags::SYN | flags::ACK);
    assert_eq!(seq, conn.iss);
    assert_eq!(ack, 101);
}

#[test]
fn segment_without_connection_is_dropped() {
    let mut stack = stack();
    let result = stack.process_ip_packet(&tcp(5000, 80, 100, 1, flags::ACK, &[]), 0);
    assert_eq!(result, Err(NetError::NoConnection));
    assert!(stack.egress().sent.is_empty());
    assert!(stack.connections().is_empty());
}

#[test]
fn handshake_data_and_close() {
    let mut stack = stack();
    stack
        .process_ip_packet(&tcp(5000, 80, 100, 0, flags::SYN, &[]), 0)
        .unwrap();
    let iss = stack.connections().get(&PEER_KEY).unwrap().iss;

    stack
        .process_ip_packet(&tcp(5000, 80, 101, iss.wrapping_add(1), flags::ACK, &[]), 10)
        .unwrap();
    assert_eq!(
        stack.connections().get(&PEER_KEY).unwrap().state,
        TcpState::Established
    );
    assert_eq!(stack.egress().sent.len(), 1);

    stack
        .process_ip_packet(
            &tcp(5000, 80, 101, iss.wrapping_add(1), flags::PSH | flags::ACK, b"hello"),
            20,
        )
        .unwrap();
    assert_eq!(stack.app().data, vec![b"hello".to_vec()]);
    assert_eq!(stack.egress().sent.len(), 2);
    let (f, _, ack) = sent_tcp(&stack.egress().sent[1]);
    assert_eq!(f, flags::ACK);
    assert_eq!(ack, 106);
    assert_eq!(stack.connections().get(&PEER_KEY).unwrap().received(), b"hello");

    stack
        .process_ip_packet(&tcp(5000, 80, 106, iss.wrapping_add(1), flags::FIN | flags::ACK, &[]), 30)
        .unwrap();
    let sent = &stack.egress().sent;
    assert_eq!(sent.len(), 4);
    let (first, _, first_ack) = sent_tcp(&sent[2]);
    let (second, fin_seq, _) = sent_tcp(&sent[3]);
    assert_eq!(first, flags::ACK);
    assert_eq!(first_ack, 107);
    assert_eq!(second, flags::FIN | flags::ACK);
    assert_eq!(fin_seq, iss.wrapping_add(1));
    assert_eq!(
        stack.connections().get(&PEER_KEY).unwrap().state,
        TcpState::FinWait2
    );

    // The peer's final ACK does not move the record.
    stack
        .process_ip_packet(&tcp(5000, 80, 107, iss.wrapping_add(2), flags::ACK, &[]), 40)
        .unwrap();
    assert_eq!(
        stack.connections().get(&PEER_KEY).unwrap().state,
        TcpState::FinWait2
    );

    let report = stack.poll(40 + 29_999);
    assert!(report.connections.is_empty());
    let report = stack.poll(40 + 30_000);
    assert_eq!(report.connections, vec![PEER_KEY]);
    assert!(stack.connections().is_empty());
}

#[test]
fn firewall_first_match_governs_admission() {
    let mut stack = stack();
    stack
        .add_firewall_rule(FirewallRule::from_raw(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            0,
            80,
            protocol::TCP,
            Action::Allow,
            Direction::Inbound,
            "web",
        ))
        .unwrap();
    stack
        .add_firewall_rule(FirewallRule::from_raw(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            0,
            0,
            0,
            Action::Deny,
            Direction::Inbound,
            "deny all",
        ))
        .unwrap();

    assert!(stack
        .process_ip_packet(&tcp(5000, 80, 1, 0, flags::SYN, &[]), 0)
        .is_ok());
    assert_eq!(
        stack.process_ip_packet(&tcp(5001, 81, 1, 0, flags::SYN, &[]), 0),
        Err(NetError::FirewallDenied)
    );
    assert_eq!(stack.connections().len(), 1);
    assert_eq!(stack.egress().sent.len(), 1);
    assert_eq!(stack.stats().dropped.firewall, 1);
}

#[test]
fn full_connection_table_is_surfaced() {
    let mut config = StackConfig::default();
    config.limits.max_connections = 1;
    let mut stack = stack_with(config);

    stack
        .process_ip_packet(&tcp(5000, 80, 1, 0, flags::SYN, &[]), 0)
        .unwrap();
    let err = stack
        .process_ip_packet(&tcp(5001, 80, 1, 0, flags::SYN, &[]), 0)
        .unwrap_err();
    assert_eq!(err, NetError::TableFull(Table::Connections));
    assert!(!err.is_silent_drop());
    assert_eq!(stack.egress().sent.len(), 1);
}

#[test]
fn dns_miss_forwards_once_and_answers_after_upstream() {
    let mut stack = stack();
    let client = Ipv4Addr::new(10, 0, 0, 7);
    let query = DnsQuery::build(0x1234, "example.com");

    stack
        .process_ip_packet(&udp(client, 3333, LOCAL, 53, &query), 0)
        .unwrap();
    assert_eq!(stack.egress().dns.len(), 1);
    assert_eq!(stack.egress().dns[0].name, "example.com");
    assert!(stack.egress().sent.is_empty());

    // A second client asking for the same name waits on the same lookup.
    let other = DnsQuery::build(0x9999, "EXAMPLE.com.");
    stack
        .process_ip_packet(&udp(Ipv4Addr::new(10, 0, 0, 8), 4444, LOCAL, 53, &other), 5)
        .unwrap();
    assert_eq!(stack.egress().dns.len(), 1);
    assert!(stack.egress().sent.is_empty());

    let answer = Ipv4Addr::new(93, 184, 216, 34);
    let answered = stack.complete_dns_query("example.com", answer, 300, 10).unwrap();
    assert_eq!(answered, 2);
    assert_eq!(stack.pending_dns_queries(), 0);

    let (src, sport, dst, dport, payload) = sent_udp(&stack.egress().sent[0]);
    assert_eq!((src, sport, dst, dport), (LOCAL, 53, client, 3333));
    assert_eq!(&payload[..2], &0x1234u16.to_be_bytes());
    assert_eq!(&payload[payload.len() - 4..], &answer.octets());

    // Now cached: answered directly, nothing forwarded.
    stack
        .process_ip_packet(&udp(client, 3334, LOCAL, 53, &query), 20)
        .unwrap();
    assert_eq!(stack.egress().dns.len(), 1);
    assert_eq!(stack.egress().sent.len(), 3);
}

#[test]
fn full_cache_still_answers_waiting_clients() {
    let mut config = StackConfig::default();
    config.limits.max_dns_entries = 1;
    let mut stack = stack_with(config);
    stack
        .add_dns_entry("static.test", Ipv4Addr::new(10, 0, 0, 50), 3600, 0)
        .unwrap();

    let client = Ipv4Addr::new(10, 0, 0, 7);
    let query = DnsQuery::build(0x0101, "example.com");
    stack
        .process_ip_packet(&udp(client, 3333, LOCAL, 53, &query), 0)
        .unwrap();
    assert_eq!(stack.pending_dns_queries(), 1);

    let answer = Ipv4Addr::new(93, 184, 216, 34);
    assert_eq!(
        stack.complete_dns_query("example.com", answer, 300, 10),
        Err(NetError::TableFull(Table::DnsCache))
    );
    assert_eq!(stack.pending_dns_queries(), 0);
    assert_eq!(stack.egress().sent.len(), 1);
    let (_, _, dst, dport, payload) = sent_udp(&stack.egress().sent[0]);
    assert_eq!((dst, dport), (client, 3333));
    assert_eq!(&payload[payload.len() - 4..], &answer.octets());
    assert_eq!(stack.dns_cache().lookup("example.com", 20), None);
}

#[test]
fn unanswered_lookups_time_out() {
    let mut config = StackConfig::default();
    config.limits.max_dns_entries = 1;
    let mut stack = stack_with(config);
    let client = Ipv4Addr::new(10, 0, 0, 7);

    stack
        .process_ip_packet(&udp(client, 3333, LOCAL, 53, &DnsQuery::build(1, "a.test")), 0)
        .unwrap();
    assert_eq!(
        stack.process_ip_packet(&udp(client, 3334, LOCAL, 53, &DnsQuery::build(2, "b.test")), 100),
        Err(NetError::TableFull(Table::PendingDns))
    );

    assert_eq!(stack.poll(4_999).dns_queries, 0);
    assert_eq!(stack.poll(5_000).dns_queries, 1);
    assert_eq!(stack.pending_dns_queries(), 0);

    stack
        .process_ip_packet(&udp(client, 3334, LOCAL, 53, &DnsQuery::build(2, "b.test")), 5_001)
        .unwrap();
    assert_eq!(stack.pending_dns_queries(), 1);
    assert_eq!(stack.egress().dns.len(), 2);
    assert_eq!(stack.egress().dns[1].name, "b.test");
}

#[test]
fn dhcp_discover_request_release() {
    let mut stack = stack();
    let mac = MacAddr([2, 0, 0, 0, 0, 0x42]);

    let discover = DhcpMessage::build_request(
        DhcpMessageType::Discover,
        0xAABB,
        mac,
        Ipv4Addr::UNSPECIFIED,
        None,
        None,
    );
    stack
        .process_ip_packet(
            &udp(Ipv4Addr::UNSPECIFIED, 68, Ipv4Addr::BROADCAST, 67, &discover),
            0,
        )
        .unwrap();

    let (src, sport, dst, dport, payload) = sent_udp(&stack.egress().sent[0]);
    assert_eq!((src, sport, dst, dport), (LOCAL, 67, Ipv4Addr::BROADCAST, 68));
    let offer = DhcpMessage::parse(&payload).unwrap();
    assert_eq!(offer.message_type, Some(DhcpMessageType::Offer));
    assert_eq!(offer.xid, 0xAABB);
    let offered = Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]);
    assert_eq!(offered, Ipv4Addr::new(192, 168, 1, 100));
    assert_eq!(stack.leases().get(offered).unwrap().state, LeaseState::Offered);

    let request = DhcpMessage::build_request(
        DhcpMessageType::Request,
        0xAABB,
        mac,
        Ipv4Addr::UNSPECIFIED,
        Some(offered),
        Some("laptop"),
    );
    stack
        .process_ip_packet(
            &udp(Ipv4Addr::UNSPECIFIED, 68, Ipv4Addr::BROADCAST, 67, &request),
            1_000,
        )
        .unwrap();
    let (_, _, _, _, payload) = sent_udp(&stack.egress().sent[1]);
    let ack = DhcpMessage::parse(&payload).unwrap();
    assert_eq!(ack.message_type, Some(DhcpMessageType::Ack));
    let lease = stack.leases().get(offered).unwrap();
    assert_eq!(lease.state, LeaseState::Bound);
    assert_eq!(lease.hostname, "laptop");

    // Another client asking for the bound address is refused.
    let thief = DhcpMessage::build_request(
        DhcpMessageType::Request,
        0xCCDD,
        MacAddr([2, 0, 0, 0, 0, 0x43]),
        Ipv4Addr::UNSPECIFIED,
        Some(offered),
        None,
    );
    stack
        .process_ip_packet(
            &udp(Ipv4Addr::UNSPECIFIED, 68, Ipv4Addr::BROADCAST, 67, &thief),
            2_000,
        )
        .unwrap();
    let (_, _, _, _, payload) = sent_udp(&stack.egress().sent[2]);
    let nak = DhcpMessage::parse(&payload).unwrap();
    assert_eq!(nak.message_type, Some(DhcpMessageType::Nak));

    let release = DhcpMessage::build_request(DhcpMessageType::Release, 0xAABC, mac, offered, None, None);
    stack
        .process_ip_packet(&udp(offered, 68, LOCAL, 67, &release), 3_000)
        .unwrap();
    assert!(stack.leases().get(offered).is_none());
}

#[test]
fn other_udp_ports_go_to_the_application() {
    let mut stack = stack();
    stack
        .process_ip_packet(&udp(PEER, 1000, LOCAL, 9000, b"payload"), 0)
        .unwrap();
    assert_eq!(stack.app().udp, vec![(9000, b"payload".to_vec())]);
    assert!(stack.egress().sent.is_empty());
}

#[test]
fn echo_request_is_answered() {
    let mut stack = stack();
    let request = echo_request(0x55, 3);
    stack
        .process_ip_packet(&ip(protocol::ICMP, PEER, LOCAL, 64, &request), 0)
        .unwrap();

    let reply = Ipv4Datagram::parse(&stack.egress().sent[0]).unwrap();
    assert_eq!(reply.header.src_addr, LOCAL);
    assert_eq!(reply.header.dst_addr, PEER);
    assert_eq!(reply.payload[0], ICMP_TYPE_ECHO_REPLY);
    assert_eq!(checksum(reply.payload), 0);
    assert_eq!(&reply.payload[4..], &request[4..]);
}

#[test]
fn icmp_errors_are_reported_up() {
    let mut stack = stack();
    let mut message = vec![3, 1, 0, 0, 0, 0, 0, 0, 0xde, 0xad];
    let sum = checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());

    stack
        .process_ip_packet(&ip(protocol::ICMP, GATEWAY, LOCAL, 64, &message), 0)
        .unwrap();
    assert_eq!(
        stack.app().icmp,
        vec![IcmpReport::DestinationUnreachable {
            from: GATEWAY,
            code: 1,
            quoted: vec![0xde, 0xad],
        }]
    );
    assert!(stack.egress().sent.is_empty());
}

#[test]
fn forwarding_decrements_ttl() {
    let mut stack = stack();
    stack
        .add_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, GATEWAY, "eth0")
        .unwrap();

    let dst = Ipv4Addr::new(8, 8, 4, 4);
    let result = stack.process_ip_packet(&ip(protocol::UDP, Ipv4Addr::new(10, 0, 0, 9), dst, 64, &[0; 8]), 0);
    assert_eq!(
        result,
        Ok(Disposition::Forwarded {
            gateway: GATEWAY,
            interface: "eth0".to_string(),
        })
    );

    let (packet, gateway) = &stack.egress().forwarded[0];
    assert_eq!(*gateway, GATEWAY);
    let forwarded = Ipv4Datagram::parse(packet).unwrap();
    assert_eq!(forwarded.header.ttl, 63);
    assert_eq!(stack.stats().forwarded, 1);
    assert_eq!(stack.interfaces().by_name("eth0").unwrap().counters.tx_packets, 1);
}

#[test]
fn expiring_ttl_sends_time_exceeded() {
    let mut stack = stack();
    stack
        .add_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, GATEWAY, "eth0")
        .unwrap();

    let src = Ipv4Addr::new(10, 0, 0, 9);
    let packet = ip(protocol::UDP, src, Ipv4Addr::new(8, 8, 4, 4), 1, &[0; 8]);
    assert_eq!(stack.process_ip_packet(&packet, 0), Err(NetError::TtlExceeded));
    assert!(stack.egress().forwarded.is_empty());

    let notice = Ipv4Datagram::parse(&stack.egress().sent[0]).unwrap();
    assert_eq!(notice.header.dst_addr, src);
    assert_eq!(notice.header.src_addr, LOCAL);
    assert_eq!(notice.payload[0], ICMP_TYPE_TIME_EXCEEDED);
    assert_eq!(&notice.payload[8..28], &packet[..20]);
}

#[test]
fn icmp_errors_and_unaddressable_sources_get_no_time_exceeded() {
    let mut stack = stack();
    stack
        .add_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, GATEWAY, "eth0")
        .unwrap();
    let far = Ipv4Addr::new(8, 8, 4, 4);

    let icmp_error = [ICMP_TYPE_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
    let packet = ip(protocol::ICMP, Ipv4Addr::new(10, 0, 0, 9), far, 1, &icmp_error);
    assert_eq!(stack.process_ip_packet(&packet, 0), Err(NetError::TtlExceeded));

    let packet = ip(protocol::UDP, Ipv4Addr::UNSPECIFIED, far, 1, &[0; 8]);
    assert_eq!(stack.process_ip_packet(&packet, 0), Err(NetError::TtlExceeded));

    assert!(stack.egress().sent.is_empty());
    assert_eq!(stack.stats().dropped.ttl_exceeded, 2);
}

fn fragment(mut packet: Vec<u8>, flags_frag_offset: u16) -> Vec<u8> {
    packet[6..8].copy_from_slice(&flags_frag_offset.to_be_bytes());
    let sum = Ipv4Utils::header_checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&sum.to_be_bytes());
    packet
}

#[test]
fn local_fragments_are_dropped() {
    let mut stack = stack();
    let first = fragment(tcp(5000, 80, 100, 0, flags::SYN, &[]), 0x2000);
    assert_eq!(
        stack.process_ip_packet(&first, 0),
        Err(NetError::UnsupportedMessage("IPv4 fragment"))
    );

    let later = fragment(udp(PEER, 1000, LOCAL, 9999, &[0; 8]), 3);
    assert_eq!(
        stack.process_ip_packet(&later, 0),
        Err(NetError::UnsupportedMessage("IPv4 fragment"))
    );

    assert!(stack.connections().is_empty());
    assert!(stack.app().udp.is_empty());
    assert!(stack.egress().sent.is_empty());
    assert_eq!(stack.interfaces().by_name("eth0").unwrap().counters.rx_dropped, 2);
}

#[test]
fn no_route_drops_silently() {
    let mut config = StackConfig::default();
    config.limits.max_routes = 1;
    let mut stack = stack_with(config);

    let dst = Ipv4Addr::new(172, 16, 0, 1);
    let result = stack.process_ip_packet(&ip(protocol::UDP, PEER, dst, 64, &[0; 8]), 0);
    assert_eq!(result, Err(NetError::NoRoute(dst)));
    assert!(result.unwrap_err().is_silent_drop());
    assert!(stack.egress().sent.is_empty());
    assert!(stack.egress().forwarded.is_empty());
}

#[test]
fn unknown_protocol_is_dropped() {
    let mut stack = stack();
    let result = stack.process_ip_packet(&ip(99, PEER, LOCAL, 64, &[0; 4]), 0);
    assert_eq!(result, Err(NetError::UnknownProtocol(99)));
    assert!(stack.egress().sent.is_empty());
    assert_eq!(stack.interfaces().by_name("eth0").unwrap().counters.rx_dropped, 1);
}

#[test]
fn short_buffer_is_malformed() {
    let mut stack = stack();
    assert!(matches!(
        stack.process_ip_packet(&[0x45, 0, 0], 0),
        Err(NetError::MalformedPacket(_))
    ));
    assert_eq!(stack.stats().dropped.malformed, 1);
}

fn is_header_reject(result: &toy_router::Result<Disposition>) -> bool {
    matches!(
        result,
        Err(NetError::MalformedPacket(_)) | Err(NetError::ChecksumFailed { .. })
    )
}

proptest! {
    #[test]
    fn checksummed_headers_pass_and_single_bit_flips_fail(
        src in any::<[u8; 4]>(),
        dst in any::<[u8; 4]>(),
        ttl in 1u8..=255,
        proto in any::<u8>().prop_filter("transport payload would be parsed", |p| {
            ![protocol::ICMP, protocol::TCP, protocol::UDP].contains(p)
        }),
        bit in 0usize..160,
    ) {
        let mut stack = stack();
        let packet = Ipv4Utils::build_packet(proto, src.into(), dst.into(), 0x4242, ttl, &[0; 8]);

        let accepted = stack.process_ip_packet(&packet, 0);
        prop_assert!(!is_header_reject(&accepted), "rejected: {:?}", accepted);

        let mut corrupted = packet.clone();
        corrupted[bit / 8] ^= 1 << (bit % 8);
        let rejected = stack.process_ip_packet(&corrupted, 0);
        prop_assert!(is_header_reject(&rejected), "accepted: {:?}", rejected);
    }
}
