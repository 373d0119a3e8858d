use std::time::Duration;

use backwards_invoke::frame::OutboundEvent;
use backwards_invoke::mock_daemon::MockDaemon;
use backwards_invoke::{BackwardsInvocation, ErrorKind, InvokeError, InvokeType, SessionConfig};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
struct Piece {
    n: u32,
}

fn quick_timeout(ms: u64) -> SessionConfig {
    SessionConfig {
        request_timeout: Duration::from_millis(ms),
        heartbeat_interval: None,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn interleaved_replies_stay_ordered_per_request() {
    let (mock, _inbound) = MockDaemon::start();
    let inv = BackwardsInvocation::new(mock.session(), Some("sess".into()));

    let mut a = inv.invoke::<Piece>(InvokeType::Tool, json!({"which": "a"})).unwrap();
    let mut b = inv.invoke::<Piece>(InvokeType::Tool, json!({"which": "b"})).unwrap();
    let ra = mock.next_request().await.unwrap();
    let rb = mock.next_request().await.unwrap();
    assert_ne!(ra.backwards_request_id, rb.backwards_request_id);
    assert_eq!(ra.backwards_request_id.len(), 32);
    assert!(ra.backwards_request_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    for n in 0..5 {
        mock.reply(&rb.backwards_request_id, json!({"n": n + 100})).await;
        mock.reply(&ra.backwards_request_id, json!({"n": n})).await;
    }
    mock.end(&ra.backwards_request_id).await;
    mock.end(&rb.backwards_request_id).await;

    let mut got_a = Vec::new();
    while let Some(p) = a.next().await {
        got_a.push(p.unwrap().n);
    }
    let mut got_b = Vec::new();
    while let Some(p) = b.next().await {
        got_b.push(p.unwrap().n);
    }
    assert_eq!(got_a, vec![0, 1, 2, 3, 4]);
    assert_eq!(got_b, vec![100, 101, 102, 103, 104]);
    assert_eq!(mock.session().outstanding(), 0);
}

#[tokio::test]
async fn abandoned_streams_release_their_entries() {
    let (mock, _inbound) = MockDaemon::start();
    let inv = BackwardsInvocation::new(mock.session(), None);

    let streams: Vec<_> = (0..10)
        .map(|_| inv.invoke::<Piece>(InvokeType::Llm, json!({})).unwrap())
        .collect();
    assert_eq!(mock.session().outstanding(), 10);

    let first = mock.next_request().await.unwrap();
    drop(streams);
    assert_eq!(mock.session().outstanding(), 0);

    // late replies for a released request are dropped quietly
    mock.reply(&first.backwards_request_id, json!({"n": 1})).await;
    mock.end(&first.backwards_request_id).await;

    let mut fresh = inv.invoke::<Piece>(InvokeType::Llm, json!({})).unwrap();
    let mut req = mock.next_request().await.unwrap();
    while req.backwards_request_id != fresh.request_id() {
        req = mock.next_request().await.unwrap();
    }
    mock.reply(&req.backwards_request_id, json!({"n": 42})).await;
    mock.end(&req.backwards_request_id).await;
    assert_eq!(fresh.next().await.unwrap().unwrap(), Piece { n: 42 });
    assert!(fresh.next().await.is_none());
}

#[tokio::test]
async fn missing_terminal_frame_times_out() {
    let (mock, _inbound) = MockDaemon::start_with(quick_timeout(100));
    let inv = BackwardsInvocation::new(mock.session(), None);

    let mut stream = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    mock.reply(&req.backwards_request_id, json!({"n": 1})).await;

    assert_eq!(stream.next().await.unwrap().unwrap(), Piece { n: 1 });
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(stream.next().await.is_none());
    assert_eq!(mock.session().outstanding(), 0);
}

#[tokio::test]
async fn unpolled_expired_requests_are_swept() {
    let (mock, _inbound) = MockDaemon::start_with(quick_timeout(50));
    let inv = BackwardsInvocation::new(mock.session(), None);

    let _idle = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    assert_eq!(mock.session().outstanding(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.session().outstanding(), 0);
}

#[tokio::test]
async fn eof_fails_everything_and_later_sends() {
    let (mock, _inbound) = MockDaemon::start();
    let session = mock.session();
    let inv = BackwardsInvocation::new(session.clone(), None);

    let mut streams: Vec<_> = (0..3)
        .map(|_| inv.invoke::<Piece>(InvokeType::Storage, json!({})).unwrap())
        .collect();
    mock.hang_up().await;

    for s in streams.iter_mut() {
        match s.next().await {
            Some(Err(InvokeError::ConnectionClosed(_))) => {}
            other => panic!("expected connection closed, got {other:?}"),
        }
    }
    session.closed().await;
    assert!(session.is_closed());
    assert_eq!(session.outstanding(), 0);
    let err = inv.invoke::<Piece>(InvokeType::Storage, json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn decode_failure_ends_the_stream() {
    let (mock, _inbound) = MockDaemon::start();
    let inv = BackwardsInvocation::new(mock.session(), None);

    let stream = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    mock.reply(&req.backwards_request_id, json!({"n": 1})).await;
    mock.reply(&req.backwards_request_id, json!({"n": "two"})).await;
    mock.reply(&req.backwards_request_id, json!({"n": 3})).await;
    mock.end(&req.backwards_request_id).await;

    let items: Vec<_> = stream.into_stream().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), &Piece { n: 1 });
    assert!(matches!(items[1], Err(InvokeError::Decode { .. })));
}

#[tokio::test]
async fn daemon_error_event_is_an_application_failure() {
    let (mock, _inbound) = MockDaemon::start();
    let inv = BackwardsInvocation::new(mock.session(), None);

    let mut stream = inv.invoke::<Piece>(InvokeType::Moderation, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    assert_eq!(req.kind, InvokeType::Moderation);
    mock.error(&req.backwards_request_id, "quota exceeded").await;

    match stream.next().await {
        Some(Err(InvokeError::Application(msg))) => assert_eq!(msg, "quota exceeded"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn slow_consumer_sees_lag() {
    let config = SessionConfig {
        queue_capacity: 2,
        heartbeat_interval: None,
        ..SessionConfig::default()
    };
    let (mock, _inbound) = MockDaemon::start_with(config);
    let session = mock.session();
    let mut sub = session.send(None, InvokeType::Llm, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    for n in 0..6 {
        mock.reply(&req.backwards_request_id, json!({"n": n})).await;
    }
    mock.end(&req.backwards_request_id).await;

    // wait for the dispatcher to route everything
    for _ in 0..100 {
        if !session.is_outstanding(&req.backwards_request_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    match sub.recv().await {
        Err(InvokeError::Lagged { skipped, .. }) => assert_eq!(skipped, 4),
        other => panic!("expected lag, got {other:?}"),
    }
    assert_eq!(sub.recv().await.unwrap(), None);
}

#[tokio::test]
async fn garbage_from_the_daemon_does_not_kill_the_session() {
    let (mock, _inbound) = MockDaemon::start();
    let inv = BackwardsInvocation::new(mock.session(), None);

    let mut stream = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    mock.send_raw("{this is not json\n").await;
    mock.send_raw("\n").await;
    mock.send_raw("{\"event\":\"brand_new_event\",\"data\":{}}\n").await;
    mock.reply(&req.backwards_request_id, json!({"n": 9})).await;
    mock.end(&req.backwards_request_id).await;

    assert_eq!(stream.next().await.unwrap().unwrap(), Piece { n: 9 });
    assert!(stream.next().await.is_none());
    assert!(!mock.session().is_closed());
}

#[tokio::test]
async fn invalid_utf8_from_the_daemon_does_not_kill_the_session() {
    let (mock, _inbound) = MockDaemon::start();
    let session = mock.session();
    let mut sub = session.send(None, InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();

    mock.send_bytes(&[0xff, 0xfe, b'\n']).await;
    mock.reply(&req.backwards_request_id, json!({"n": 5})).await;

    assert_eq!(sub.recv().await.unwrap(), Some(json!({"n": 5})));
    assert!(!session.is_closed());

    // later requests still flow
    let mut next = session.send(None, InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    mock.end(&req.backwards_request_id).await;
    assert_eq!(next.recv().await.unwrap(), None);
}

#[tokio::test]
async fn write_failure_fails_outstanding_requests() {
    let (mock, _inbound) = MockDaemon::start();
    let session = mock.session();
    let inv = BackwardsInvocation::new(session.clone(), None);

    let mut first = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    mock.next_request().await.unwrap();
    mock.stop_reading().await;

    // queued fine, then the writer hits the broken pipe
    let mut second = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    for s in [&mut first, &mut second] {
        match s.next().await {
            Some(Err(InvokeError::ConnectionClosed(reason))) => {
                assert!(reason.contains("transport"), "reason {reason}")
            }
            other => panic!("expected connection closed, got {other:?}"),
        }
    }
    let reason = session.closed().await;
    assert!(reason.starts_with("transport write failed") || reason.starts_with("transport flush failed"));
    assert_eq!(session.outstanding(), 0);
    let err = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn huge_request_timeout_is_accepted() {
    let config = SessionConfig {
        request_timeout: Duration::from_secs(u64::MAX / 2),
        heartbeat_interval: Some(Duration::MAX),
        ..SessionConfig::default()
    };
    let (mock, _inbound) = MockDaemon::start_with(config);
    let inv = BackwardsInvocation::new(mock.session(), None);

    let mut stream = inv.invoke::<Piece>(InvokeType::Tool, json!({})).unwrap();
    let req = mock.next_request().await.unwrap();
    mock.reply(&req.backwards_request_id, json!({"n": 1})).await;
    mock.end(&req.backwards_request_id).await;
    assert_eq!(stream.next().await.unwrap().unwrap(), Piece { n: 1 });
    assert!(stream.next().await.is_none());
    assert!(!mock.session().is_closed());
}

#[tokio::test]
async fn heartbeats_follow_the_interval() {
    let config = SessionConfig {
        heartbeat_interval: Some(Duration::from_millis(50)),
        ..SessionConfig::default()
    };
    let (mock, _inbound) = MockDaemon::start_with(config);

    let started = tokio::time::Instant::now();
    let mut beats = 0;
    while beats < 3 {
        let frame = mock
            .next_frame_within(Duration::from_secs(2))
            .await
            .expect("heartbeat frame");
        assert_eq!(frame.event, OutboundEvent::Heartbeat);
        assert!(frame.session_id.is_none());
        beats += 1;
    }
    let took = started.elapsed();
    assert!(took >= Duration::from_millis(140), "heartbeats too fast: {took:?}");
    mock.session().close();
}
