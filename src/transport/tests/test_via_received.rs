use crate::{
    sip::{HasHeaders, Header, HostPort, Request, SipMessage, SipUri, Via},
    transport::{SipAddr, SipConnection, TransportKind},
};
use std::net::SocketAddr;

fn create_test_request(via_proto: &str) -> Request {
    let mut req = Request::new(
        crate::sip::Method::Register,
        SipUri::new(None, "example.com:5060".parse().unwrap()),
    );
    req.headers.push(Header::new(
        "Via",
        format!("{} 127.0.0.1:5060;branch=z9hG4bK-test", via_proto),
    ));
    req
}

fn top_via(msg: &SipMessage) -> Via {
    match msg {
        SipMessage::Request(req) => req.via().expect("typed via"),
        _ => panic!("Expected request message"),
    }
}

#[test]
fn test_via_received_udp() {
    let addr: SocketAddr = "192.168.1.100:5060".parse().unwrap();
    let msg = SipConnection::update_msg_received(create_test_request("SIP/2.0/UDP").into(), addr)
        .expect("update_msg_received for UDP");

    let via = top_via(&msg);
    assert_eq!(via.received(), Some("192.168.1.100"));
    assert_eq!(via.rport(), Some(5060));
    assert_eq!(
        SipConnection::parse_target_from_via(&via),
        "192.168.1.100:5060".parse::<HostPort>().unwrap()
    );
}

#[test]
fn test_via_received_same_addr_untouched() {
    let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
    let msg = SipConnection::update_msg_received(create_test_request("SIP/2.0/TCP").into(), addr)
        .expect("update_msg_received for TCP");

    let via = top_via(&msg);
    assert_eq!(via.received(), None);
    assert_eq!(via.rport(), None);
}

#[test]
fn test_via_received_nat_port() {
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let msg = SipConnection::update_msg_received(create_test_request("SIP/2.0/UDP").into(), addr)
        .expect("update_msg_received");

    let via = top_via(&msg);
    assert_eq!(via.rport(), Some(40000));
    assert_eq!(
        SipConnection::parse_target_from_via(&via).to_socket_addr(),
        Some(addr)
    );
}

#[test]
fn test_response_destination_from_via() {
    let mut resp = crate::sip::Response::new(200, None);
    resp.headers.push(Header::new(
        "Via",
        "SIP/2.0/TCP client.example:5070;branch=z9hG4bK1;received=10.1.1.1;rport=6000",
    ));
    let msg: SipMessage = resp.into();
    let dest = SipConnection::get_destination(&msg).unwrap();
    assert_eq!(dest.r#type, Some(TransportKind::Tcp));
    assert_eq!(dest.addr, "10.1.1.1:6000".parse::<HostPort>().unwrap());

    // responses pass through unchanged
    let unchanged = SipConnection::update_msg_received(msg.clone(), "10.9.9.9:1".parse().unwrap())
        .unwrap();
    assert_eq!(unchanged, msg);
}

#[test]
fn test_sipaddr_from_uri() {
    let uri: SipUri = "sip:proxy1.example.org:25060;transport=tcp".parse().unwrap();
    let sipaddr = SipAddr::from(&uri);
    assert_eq!(sipaddr.r#type, Some(TransportKind::Tcp));
    assert_eq!(
        sipaddr.addr,
        "proxy1.example.org:25060".parse::<HostPort>().unwrap()
    );

    let uri: SipUri = "sips:[2001:db8::1]".parse().unwrap();
    let sipaddr = SipAddr::from(&uri);
    assert_eq!(sipaddr.r#type, Some(TransportKind::Tls));
    assert_eq!(sipaddr.addr.port_or_default(), 5060);
    assert!(sipaddr.get_socketaddr().is_ok());
}
