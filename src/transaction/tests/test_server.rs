use super::{
    create_test_endpoint, fast_timers, install_handler, invite_request, options_request,
    RecordingReceiver,
};
use crate::{
    sip::{HasHeaders, Method},
    transaction::EndpointOption,
    transport::TransportKind,
    Result,
};
use std::time::Duration;

#[tokio::test]
async fn test_duplicate_request_delivered_once() -> Result<()> {
    let mut test = create_test_endpoint(TransportKind::Udp, EndpointOption::default()).await?;
    let receiver = RecordingReceiver::answering(200);
    let _handler = install_handler(&test, receiver.clone());

    let raw = options_request("z9hG4bKdup1");
    for _ in 0..3 {
        test.inject(&raw)?;
    }
    for _ in 0..3 {
        let resp = test.expect_response().await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.to_header()?.tag(), Some("uas-tag"));
    }
    assert_eq!(receiver.request_count(), 1);
    assert_eq!(test.endpoint.inner.transaction_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_invite_failure_absorbs_ack() -> Result<()> {
    let mut test = create_test_endpoint(TransportKind::Udp, EndpointOption::default()).await?;
    let receiver = RecordingReceiver::answering(486);
    let _handler = install_handler(&test, receiver.clone());

    test.inject(&invite_request("z9hG4bKinv1", "INVITE"))?;
    assert_eq!(test.expect_response().await.status, 486);

    // retransmitted INVITE gets the recorded final response
    test.inject(&invite_request("z9hG4bKinv1", "INVITE"))?;
    assert_eq!(test.expect_response().await.status, 486);

    let ack = invite_request("z9hG4bKinv1", "ACK");
    test.inject(&ack)?;
    assert!(test.next_message(Duration::from_millis(100)).await.is_none());
    assert_eq!(receiver.request_count(), 1);
    assert!(receiver.acks.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_pending_invite() -> Result<()> {
    let mut test = create_test_endpoint(TransportKind::Channel, EndpointOption::default()).await?;
    let receiver = RecordingReceiver::silent();
    let _handler = install_handler(&test, receiver.clone());

    test.inject(&invite_request("z9hG4bKcan1", "INVITE"))?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(receiver.request_count(), 1);

    test.inject(&invite_request("z9hG4bKcan1", "CANCEL"))?;
    let cancel_ok = test.expect_response().await;
    assert_eq!(cancel_ok.status, 200);
    assert_eq!(cancel_ok.cseq()?.method, Method::Cancel);

    let terminated = test.expect_response().await;
    assert_eq!(terminated.status, 487);
    assert_eq!(terminated.cseq()?.method, Method::Invite);
    Ok(())
}

#[tokio::test]
async fn test_cancel_without_invite() -> Result<()> {
    let mut test = create_test_endpoint(TransportKind::Channel, EndpointOption::default()).await?;
    test.inject(&invite_request("z9hG4bKcan2", "CANCEL"))?;
    assert_eq!(test.expect_response().await.status, 481);
    Ok(())
}

#[tokio::test]
async fn test_final_response_retransmitted_until_ack() -> Result<()> {
    let mut test = create_test_endpoint(TransportKind::Udp, fast_timers(20)).await?;
    let receiver = RecordingReceiver::answering(404);
    let _handler = install_handler(&test, receiver.clone());

    test.inject(&invite_request("z9hG4bKg1", "INVITE"))?;
    assert_eq!(test.expect_response().await.status, 404);
    // Timer G
    assert_eq!(test.expect_response().await.status, 404);

    test.inject(&invite_request("z9hG4bKg1", "ACK"))?;
    // drain a retransmission that raced the ACK
    while let Some(msg) = test.next_message(Duration::from_millis(100)).await {
        assert!(!msg.is_request());
    }
    assert!(test.next_message(Duration::from_millis(200)).await.is_none());
    Ok(())
}
