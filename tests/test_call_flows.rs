mod common;

use common::*;
use rsipb2bua::{
    dialog::UaState,
    sip::{make_response, HasHeaders, Header, Method, SipMessage},
};
use std::time::Duration;

#[tokio::test]
async fn test_basic_call() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let call_id = "basic-1";
    let invite = invite(call_id, "z9hG4bK-basic-1", 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());

    let trying = h.caller_response(Method::Invite, 100).await;
    assert_eq!(trying.call_id().unwrap(), call_id);
    assert_eq!(h.call_map.len(), 1);

    let outbound = h.next_hop_request(Method::Invite).await;
    assert_eq!(outbound.uri.user(), Some("1000"));
    assert_eq!(outbound.uri.host.host, "10.0.0.2");
    assert_eq!(outbound.from_header().unwrap().uri.user(), Some("alice"));
    assert_eq!(outbound.from_header().unwrap().display_name.as_deref(), Some("Alice"));
    assert_ne!(outbound.from_header().unwrap().tag(), Some("a1"));
    assert_eq!(outbound.body, CALLER_SDP.as_bytes());

    h.from_next_hop(answer(&outbound, 180, "nh1", "1000", None));
    let ringing = h.caller_response(Method::Invite, 180).await;
    let a_tag = ringing.to_header().unwrap().tag().map(str::to_string);
    assert!(a_tag.is_some());

    h.from_next_hop(answer(&outbound, 200, "nh1", "1000", Some(CALLEE_SDP)));
    let ack = h.next_hop_request(Method::Ack).await;
    assert_eq!(ack.to_header().unwrap().tag(), Some("nh1"));
    assert_eq!(ack.uri.user(), Some("1000"));

    let answered = h.caller_response(Method::Invite, 200).await;
    assert_eq!(answered.body, CALLEE_SDP.as_bytes());
    assert_eq!(answered.to_header().unwrap().tag().map(str::to_string), a_tag);
    assert!(answered.contact().is_some());
    h.from_caller(in_dialog(&invite, &answered, Method::Ack, "z9hG4bK-basic-ack", 1));

    let cc = h.call_map.get(h.call_map.ids()[0]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cc.leg_states(), (UaState::Connected, Some(UaState::Connected)));

    h.from_caller(in_dialog(&invite, &answered, Method::Bye, "z9hG4bK-basic-bye", 2));
    h.caller_response(Method::Bye, 200).await;
    let bye = h.next_hop_request(Method::Bye).await;
    assert_eq!(bye.to_header().unwrap().tag(), Some("nh1"));
    h.from_next_hop(make_response(&bye, 200, None, None));

    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_out_of_dialog_requests() {
    let mut h = Harness::new(test_config()).await.unwrap();

    let options = CallerRequest {
        method: Method::Options,
        uri: "sip:1000@127.0.0.1",
        branch: "z9hG4bK-ood-1",
        call_id: "ood-1",
        from: "<sip:alice@10.0.0.1>;tag=a1",
        to: "<sip:1000@127.0.0.1>;tag=stale",
        seq: 1,
    };
    h.from_caller(options.build(CALLER));
    h.caller_response(Method::Options, 481).await;

    let publish = CallerRequest {
        method: Method::Publish,
        to: "<sip:1000@127.0.0.1>",
        branch: "z9hG4bK-ood-2",
        call_id: "ood-2",
        ..options
    };
    h.from_caller(publish.build(CALLER));
    h.caller_response(Method::Publish, 501).await;

    let ping = CallerRequest {
        method: Method::Other("PING".to_string()),
        to: "<sip:1000@127.0.0.1>",
        branch: "z9hG4bK-ood-3",
        call_id: "ood-3",
        ..options
    };
    h.from_caller(ping.build(CALLER));
    h.caller_response(Method::Other("PING".to_string()), 200).await;

    let notify = CallerRequest {
        method: Method::Notify,
        to: "<sip:1000@127.0.0.1>",
        branch: "z9hG4bK-ood-4",
        call_id: "ood-4",
        ..options
    };
    h.from_caller(notify.build(CALLER));
    h.caller_response(Method::Notify, 200).await;

    assert!(h.call_map.is_empty());
}

#[tokio::test]
async fn test_register_is_proxied() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let register = CallerRequest {
        method: Method::Register,
        uri: "sip:127.0.0.1",
        branch: "z9hG4bK-reg-1",
        call_id: "reg-1",
        from: "<sip:alice@10.0.0.1>;tag=r1",
        to: "<sip:alice@10.0.0.1>",
        seq: 1,
    }
    .build(CALLER);
    h.from_caller(register);

    let forwarded = h.next_hop_request(Method::Register).await;
    assert_eq!(forwarded.max_forwards(), Some(69));
    assert_eq!(forwarded.headers.get_all("Via").count(), 2);
    assert_eq!(forwarded.call_id().unwrap(), "reg-1");

    let mut ok = make_response(&forwarded, 200, None, Some("reg"));
    ok.headers.push(Header::new("Expires", "3600"));
    h.from_next_hop(ok);

    let relayed = h.caller_response(Method::Register, 200).await;
    assert_eq!(relayed.headers.get_all("Via").count(), 1);
    assert_eq!(relayed.via().unwrap().branch(), Some("z9hG4bK-reg-1"));
    assert_eq!(relayed.header_value("Expires"), Some("3600"));
    assert!(h.call_map.is_empty());
}

#[tokio::test]
async fn test_register_loop_is_stopped() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let mut register = CallerRequest {
        method: Method::Register,
        uri: "sip:127.0.0.1",
        branch: "z9hG4bK-reg-2",
        call_id: "reg-2",
        from: "<sip:alice@10.0.0.1>;tag=r1",
        to: "<sip:alice@10.0.0.1>",
        seq: 1,
    }
    .build(CALLER);
    register.headers.set("Max-Forwards", "0");
    h.from_caller(register);
    h.caller_response(Method::Register, 483).await;
}

#[tokio::test]
async fn test_retransmitted_invite_makes_one_call() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let invite = invite("retx-1", "z9hG4bK-retx-1", 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());
    h.caller_response(Method::Invite, 100).await;
    h.next_hop_request(Method::Invite).await;

    h.from_caller(invite);
    h.caller_response(Method::Invite, 100).await;
    assert!(
        h.next_hop_quiet(Duration::from_millis(100), |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite)
        })
        .await
    );
    assert_eq!(h.call_map.len(), 1);
}

#[tokio::test]
async fn test_callee_rejects() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let invite = invite("busy-1", "z9hG4bK-busy-1", 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());
    let outbound = h.next_hop_request(Method::Invite).await;

    h.from_next_hop(answer(&outbound, 486, "nh1", "1000", None));
    // the failure is acknowledged toward the next hop by the transaction
    h.next_hop_request(Method::Ack).await;

    let busy = h.caller_response(Method::Invite, 486).await;
    h.from_caller(ack_failure(&invite, &busy));
    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_caller_cancels() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let invite = invite("cancel-1", "z9hG4bK-cancel-1", 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());
    let outbound = h.next_hop_request(Method::Invite).await;
    h.from_next_hop(answer(&outbound, 180, "nh1", "1000", None));
    h.caller_response(Method::Invite, 180).await;

    let mut cancel = rsipb2bua::sip::Request::new(Method::Cancel, invite.uri.clone());
    for name in ["Via", "Max-Forwards", "From", "To", "Call-ID"] {
        cancel.headers.push(invite.headers.get(name).unwrap().clone());
    }
    cancel.headers.push(Header::new("CSeq", "1 CANCEL"));
    h.from_caller(cancel);

    h.caller_response(Method::Cancel, 200).await;
    let terminated = h.caller_response(Method::Invite, 487).await;
    h.from_caller(ack_failure(&invite, &terminated));

    let cancel_out = h.next_hop_request(Method::Cancel).await;
    assert_eq!(cancel_out.via().unwrap().branch(), outbound.via().unwrap().branch());
    h.from_next_hop(make_response(&cancel_out, 200, None, Some("nh1")));
    h.from_next_hop(answer(&outbound, 487, "nh1", "1000", None));

    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_callee_hangs_up() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let (invite, _answered, outbound, ok) = connect_call(&mut h, "nh-bye-1").await;

    h.from_next_hop(from_callee(&outbound, &ok, Method::Bye, "z9hG4bK-nh-bye-1", 1));
    h.next_hop_response(Method::Bye, 200).await;

    let bye = h.caller_request(Method::Bye).await;
    assert_eq!(bye.uri.to_string(), format!("sip:alice@{}", CALLER));
    assert_eq!(bye.to_header().unwrap().tag(), Some("a1"));
    assert_eq!(bye.call_id().unwrap(), invite.call_id().unwrap());
    h.from_caller(make_response(&bye, 200, None, None));

    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_reinvite_is_relayed() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let (invite, answered, _outbound, _ok) = connect_call(&mut h, "reinvite-1").await;

    let mut reinvite = in_dialog(&invite, &answered, Method::Invite, "z9hG4bK-reinvite-2", 2);
    reinvite
        .headers
        .push(Header::new("Contact", format!("<sip:alice@{}>", CALLER)));
    reinvite
        .headers
        .push(Header::new("Content-Type", "application/sdp"));
    reinvite.body = CALLER_SDP.replace("10000", "10002").into_bytes();
    h.from_caller(reinvite.clone());
    h.caller_response(Method::Invite, 100).await;

    let relayed = h
        .next_hop_matching("re-INVITE", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite) && cseq_of(m) == 2
        })
        .await;
    let relayed = expect_request(relayed);
    assert_eq!(relayed.body, reinvite.body);
    assert_eq!(relayed.to_header().unwrap().tag(), Some("nh1"));

    let mut ok = make_response(&relayed, 200, None, None);
    ok.headers
        .push(Header::new("Contact", format!("<sip:1000@{}>", NEXT_HOP)));
    ok.headers.push(Header::new("Content-Type", "application/sdp"));
    ok.body = CALLEE_SDP.replace("20000", "20002").into_bytes();
    h.from_next_hop(ok.clone());
    h.next_hop_matching("ACK", |m| {
        matches!(m, SipMessage::Request(r) if r.method == Method::Ack) && cseq_of(m) == 2
    })
    .await;

    let answered_again = expect_response(
        h.caller_matching("200 to re-INVITE", |m| {
            is_response(m, &Method::Invite, 200) && cseq_of(m) == 2
        })
        .await,
    );
    assert_eq!(answered_again.body, ok.body);

    // a stale CSeq is refused
    let stale = in_dialog(&invite, &answered, Method::Info, "z9hG4bK-reinvite-3", 1);
    h.from_caller(stale);
    h.caller_response(Method::Info, 500).await;
}

#[tokio::test]
async fn test_transfer_with_also() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let call_id = "xfer-1";
    let (_invite, _answered, outbound, ok) = connect_call(&mut h, call_id).await;
    let cc = h.call_map.get(h.call_map.ids()[0]).unwrap();

    let mut bye = from_callee(&outbound, &ok, Method::Bye, "z9hG4bK-xfer-bye", 1);
    bye.headers
        .push(Header::new("Also", "<sip:2000@10.0.0.2>"));
    h.from_next_hop(bye);
    h.next_hop_response(Method::Bye, 200).await;

    let second = expect_request(
        h.next_hop_matching("INVITE to the transfer target", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite && r.uri.user() == Some("2000"))
        })
        .await,
    );
    assert!(cc.is_transferring());
    assert!(second.body.is_empty());
    assert_eq!(second.uri.host.host, "10.0.0.2");

    let sdp_c = CALLEE_SDP.replace("bob", "carol").replace("20000", "30000");
    let ok2 = answer(&second, 200, "nh2", "2000", Some(&sdp_c));
    h.from_next_hop(ok2.clone());

    let reinvite = expect_request(
        h.caller_matching("re-INVITE to the caller", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite)
        })
        .await,
    );
    assert_eq!(reinvite.body, sdp_c.as_bytes());
    assert_eq!(reinvite.to_header().unwrap().tag(), Some("a1"));

    let sdp_d = CALLER_SDP.replace("10000", "10004");
    let mut reinvite_ok = make_response(&reinvite, 200, None, None);
    reinvite_ok
        .headers
        .push(Header::new("Contact", format!("<sip:alice@{}>", CALLER)));
    reinvite_ok
        .headers
        .push(Header::new("Content-Type", "application/sdp"));
    reinvite_ok.body = sdp_d.clone().into_bytes();
    h.from_caller(reinvite_ok);

    let ack = expect_request(
        h.next_hop_matching("ACK with the caller's answer", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Ack && !r.body.is_empty())
        })
        .await,
    );
    assert_eq!(ack.body, sdp_d.as_bytes());
    assert_eq!(ack.to_header().unwrap().tag(), Some("nh2"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!cc.is_transferring());

    // the replaced leg lingers out without taking the call with it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.call_map.len(), 1);
    assert_eq!(cc.leg_states(), (UaState::Connected, Some(UaState::Connected)));

    h.from_next_hop(from_callee(&second, &ok2, Method::Bye, "z9hG4bK-xfer-bye2", 1));
    h.next_hop_response(Method::Bye, 200).await;
    let bye = h.caller_request(Method::Bye).await;
    h.from_caller(make_response(&bye, 200, None, None));
    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_shutdown_hangs_up_calls() {
    let mut h = Harness::new(test_config()).await.unwrap();
    connect_call(&mut h, "shut-1").await;
    connect_call(&mut h, "shut-2").await;
    assert_eq!(h.call_map.len(), 2);

    h.call_map.shutdown();
    for call_id in ["shut-1", "shut-2"] {
        let bye = expect_request(
            h.caller_matching("BYE", |m| is_request_in(m, call_id, &Method::Bye))
                .await,
        );
        h.from_caller(make_response(&bye, 200, None, None));
        let bye = expect_request(
            h.next_hop_matching("BYE", |m| is_request_in(m, call_id, &Method::Bye))
                .await,
        );
        h.from_next_hop(make_response(&bye, 200, None, None));
    }
    assert!(h.call_map.wait_drained(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_shutdown_grace_period() {
    let mut h = Harness::new(test_config()).await.unwrap();
    connect_call(&mut h, "grace-1").await;

    h.call_map.shutdown();
    h.caller_request(Method::Bye).await;
    // nobody answers the BYEs
    assert!(!h.call_map.wait_drained(Duration::from_millis(100)).await);
    h.call_map.clear();
    assert!(h.call_map.is_empty());
    assert!(h.call_map.wait_drained(Duration::from_millis(10)).await);
}

#[tokio::test]
async fn test_transfer_target_rejects() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let (_invite, _answered, outbound, ok) = connect_call(&mut h, "xfer-busy-1").await;
    let cc = h.call_map.get(h.call_map.ids()[0]).unwrap();

    let mut bye = from_callee(&outbound, &ok, Method::Bye, "z9hG4bK-xfer-busy-bye", 1);
    bye.headers
        .push(Header::new("Also", "<sip:2000@10.0.0.2>"));
    h.from_next_hop(bye);
    h.next_hop_response(Method::Bye, 200).await;

    let second = expect_request(
        h.next_hop_matching("INVITE to the transfer target", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite && r.uri.user() == Some("2000"))
        })
        .await,
    );
    assert!(cc.is_transferring());
    h.from_next_hop(answer(&second, 486, "nh2", "2000", None));

    // nobody is left to talk to
    let bye = h.caller_request(Method::Bye).await;
    assert_eq!(bye.to_header().unwrap().tag(), Some("a1"));
    assert!(!cc.is_transferring());
    h.from_caller(make_response(&bye, 200, None, None));
    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_transfer_with_refer() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let call_id = "refer-1";
    let (_invite, _answered, outbound, ok) = connect_call(&mut h, call_id).await;
    let cc = h.call_map.get(h.call_map.ids()[0]).unwrap();

    let mut refer = from_callee(&outbound, &ok, Method::Refer, "z9hG4bK-refer-1", 1);
    refer
        .headers
        .push(Header::new("Refer-To", "<sip:3000@10.0.0.2>"));
    h.from_next_hop(refer);
    h.next_hop_response(Method::Refer, 202).await;

    let bye = h.next_hop_request(Method::Bye).await;
    assert_eq!(bye.to_header().unwrap().tag(), Some("nh1"));
    assert_eq!(bye.call_id().unwrap(), call_id);
    h.from_next_hop(make_response(&bye, 200, None, None));

    let second = expect_request(
        h.next_hop_matching("INVITE to the Refer-To user", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite && r.uri.user() == Some("3000"))
        })
        .await,
    );
    assert!(cc.is_transferring());
    assert!(second.to_header().unwrap().tag().is_none());
    assert_eq!(second.from_header().unwrap().uri.user(), Some("alice"));
    assert_eq!(cc.leg_states().0, UaState::Connected);

    h.from_next_hop(answer(&second, 404, "nh3", "3000", None));
    let bye = h.caller_request(Method::Bye).await;
    h.from_caller(make_response(&bye, 200, None, None));
    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_credit_time_expires() {
    let mut config = test_config();
    config.timers.credit_time = Some(Duration::from_millis(150));
    let mut h = Harness::new(config).await.unwrap();
    let call_id = "credit-1";
    connect_call(&mut h, call_id).await;
    let connected = tokio::time::Instant::now();

    let bye = expect_request(
        h.caller_matching("BYE", |m| is_request_in(m, call_id, &Method::Bye))
            .await,
    );
    assert!(connected.elapsed() >= Duration::from_millis(100));
    assert_eq!(bye.to_header().unwrap().tag(), Some("a1"));
    h.from_caller(make_response(&bye, 200, None, None));

    let bye = expect_request(
        h.next_hop_matching("BYE", |m| is_request_in(m, call_id, &Method::Bye))
            .await,
    );
    assert_eq!(bye.to_header().unwrap().tag(), Some("nh1"));
    h.from_next_hop(make_response(&bye, 200, None, None));
    assert!(h.call_map.wait_drained(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_late_offer_reinvite() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let (invite, answered, _outbound, _ok) = connect_call(&mut h, "late-1").await;
    let cc = h.call_map.get(h.call_map.ids()[0]).unwrap();

    let mut reinvite = in_dialog(&invite, &answered, Method::Invite, "z9hG4bK-late-2", 2);
    reinvite
        .headers
        .push(Header::new("Contact", format!("<sip:alice@{}>", CALLER)));
    h.from_caller(reinvite);

    let relayed = expect_request(
        h.next_hop_matching("re-INVITE", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Invite) && cseq_of(m) == 2
        })
        .await,
    );
    assert!(relayed.body.is_empty());

    let offer = CALLEE_SDP.replace("20000", "20006");
    let mut ok = make_response(&relayed, 200, None, None);
    ok.headers
        .push(Header::new("Contact", format!("<sip:1000@{}>", NEXT_HOP)));
    ok.headers.push(Header::new("Content-Type", "application/sdp"));
    ok.body = offer.clone().into_bytes();
    h.from_next_hop(ok);

    // the offer is answered by the caller, not turned into a re-INVITE
    let answered_again = expect_response(
        h.caller_matching("200 to re-INVITE", |m| {
            is_response(m, &Method::Invite, 200) && cseq_of(m) == 2
        })
        .await,
    );
    assert_eq!(answered_again.body, offer.as_bytes());
    assert!(!cc.is_transferring());
    assert!(
        h.next_hop_quiet(Duration::from_millis(50), |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Ack) && cseq_of(m) == 2
        })
        .await
    );

    let answer_sdp = CALLER_SDP.replace("10000", "10006");
    let mut ack = in_dialog(&invite, &answered, Method::Ack, "z9hG4bK-late-ack", 2);
    ack.headers.push(Header::new("Content-Type", "application/sdp"));
    ack.body = answer_sdp.clone().into_bytes();
    h.from_caller(ack);

    let ack = expect_request(
        h.next_hop_matching("ACK with the answer", |m| {
            matches!(m, SipMessage::Request(r) if r.method == Method::Ack) && cseq_of(m) == 2
        })
        .await,
    );
    assert_eq!(ack.body, answer_sdp.as_bytes());
    assert_eq!(cc.leg_states(), (UaState::Connected, Some(UaState::Connected)));
}

#[tokio::test]
async fn test_cancel_without_final_response() {
    let mut h = Harness::new(test_config()).await.unwrap();
    let invite = invite("cancel-2", "z9hG4bK-cancel-2", 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());
    let outbound = h.next_hop_request(Method::Invite).await;
    h.from_next_hop(answer(&outbound, 180, "nh1", "1000", None));
    h.caller_response(Method::Invite, 180).await;

    let mut cancel = rsipb2bua::sip::Request::new(Method::Cancel, invite.uri.clone());
    for name in ["Via", "Max-Forwards", "From", "To", "Call-ID"] {
        cancel.headers.push(invite.headers.get(name).unwrap().clone());
    }
    cancel.headers.push(Header::new("CSeq", "1 CANCEL"));
    h.from_caller(cancel);
    let terminated = h.caller_response(Method::Invite, 487).await;
    h.from_caller(ack_failure(&invite, &terminated));

    // the CANCEL is accepted but the INVITE is never finished
    let cancel_out = h.next_hop_request(Method::Cancel).await;
    h.from_next_hop(make_response(&cancel_out, 200, None, Some("nh1")));

    // 64*T1 is 1.28 s here
    assert!(h.call_map.wait_drained(Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.endpoint.inner.transaction_count(), 0);
}
