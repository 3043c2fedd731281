use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use super::*;
use crate::message::Priority;
use crate::transport::{ConnectionEvent, MockTransport};
use crate::utils::error::{ExecutorError, SendError};

const WAIT: Duration = Duration::from_secs(2);

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.relay.sender_id = "1234".into();
    settings.relay.server_key = "server-key".into();
    settings.executor.workers = 4;
    settings.correlation.response_timeout_ms = 2_000;
    settings.correlation.reconnect_wait_ms = 300;
    settings
}

async fn open_bridge(handlers: Handlers) -> (CcsBridge<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let bridge = CcsBridge::with_handlers(transport.clone(), test_settings(), handlers);
    bridge.open().await.unwrap();
    (bridge, transport)
}

async fn sent_message(transport: &MockTransport, index: usize) -> Value {
    let sent = transport.wait_for_sent(index + 1, WAIT).await;
    serde_json::from_str(&sent[index]).unwrap()
}

fn respond(transport: &MockTransport, sent: &Value, error: Option<&str>) {
    let message_type = if error.is_some() { "nack" } else { "ack" };
    let mut response = json!({
        "from": sent["to"],
        "message_id": sent["message_id"],
        "message_type": message_type,
    });
    if let Some(code) = error {
        response["error"] = json!(code);
    }
    transport.deliver_json(&response.to_string());
}

fn data_message(to: &str) -> OutboundMessage {
    OutboundMessage::data_builder()
        .to(to)
        .priority(Priority::High)
        .data_entry("k", "v")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_submit_fails_fast_before_open() {
    let transport = MockTransport::new();
    let bridge = CcsBridge::new(transport.clone(), test_settings());

    let result = bridge.submit(data_message("tokenA"));

    assert!(matches!(
        result,
        Err(SendError::NotConnected(ConnectionState::Disconnected))
    ));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn test_open_without_credentials_fails() {
    let mut settings = test_settings();
    settings.relay.server_key.clear();
    let bridge = CcsBridge::new(MockTransport::new(), settings);

    assert!(matches!(
        bridge.open().await,
        Err(ConnectError::MissingCredentials)
    ));
}

#[tokio::test]
async fn test_submit_returns_handle_for_message_id() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    let message = data_message("tokenA");
    let id = message.message_id().unwrap().to_string();

    let handle = bridge.submit(message).unwrap();
    assert_eq!(handle.message_id(), id);
    assert_eq!(bridge.pending_count(), 1);

    let sent = sent_message(&transport, 0).await;
    assert_eq!(sent["message_id"], id.as_str());
    respond(&transport, &sent, None);

    let response = handle.wait().await.unwrap();
    assert_eq!(response.message_id, id);
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn test_rate_limited_nack_is_not_retried() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    let backoff = RetryBackoff {
        initial: Duration::from_millis(5),
        ..RetryBackoff::default()
    };

    let (result, ()) = tokio::join!(
        bridge.send_with_retry(data_message("tokenA"), backoff),
        async {
            let sent = sent_message(&transport, 0).await;
            respond(&transport, &sent, Some("DEVICE_MESSAGE_RATE_EXCEEDED"));
        }
    );

    match result {
        Err(SendError::Rejected { class, .. }) => assert_eq!(class, ResponseClass::RateLimited),
        other => panic!("expected rate limit rejection, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_transient_nack_is_retried_with_new_id() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    let backoff = RetryBackoff {
        initial: Duration::from_millis(5),
        ..RetryBackoff::default()
    };

    let (result, (first_id, second_id)) = tokio::join!(
        bridge.send_with_retry(data_message("tokenA"), backoff),
        async {
            let first = sent_message(&transport, 0).await;
            respond(&transport, &first, Some("SERVICE_UNAVAILABLE"));
            let second = sent_message(&transport, 1).await;
            respond(&transport, &second, None);
            (first["message_id"].clone(), second["message_id"].clone())
        }
    );

    let response = result.unwrap();
    assert!(response.is_ack());
    assert_ne!(first_id, second_id);
    assert_eq!(response.message_id, second_id.as_str().unwrap());
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    let backoff = RetryBackoff {
        initial: Duration::from_millis(1),
        max_attempts: 2,
        ..RetryBackoff::default()
    };

    let (result, ()) = tokio::join!(
        bridge.send_with_retry(data_message("tokenA"), backoff),
        async {
            for index in 0..2 {
                let sent = sent_message(&transport, index).await;
                respond(&transport, &sent, Some("INTERNAL_SERVER_ERROR"));
            }
        }
    );

    assert!(matches!(
        result,
        Err(SendError::Rejected {
            class: ResponseClass::Transient,
            ..
        })
    ));
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn test_draining_nack_completes_request_and_drains() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    transport.fail_replacement(Some("relay busy"));

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        let sent = sent_message(&transport, 0).await;
        respond(&transport, &sent, Some("CONNECTION_DRAINING"));
    });

    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        SendError::Rejected {
            class: ResponseClass::Draining,
            ..
        }
    ));
    assert_eq!(bridge.state(), ConnectionState::Draining);
}

#[tokio::test]
async fn test_nack_without_code_times_out() {
    let mut settings = test_settings();
    settings.correlation.response_timeout_ms = 100;
    let transport = MockTransport::new();
    let bridge = CcsBridge::new(transport.clone(), settings);
    bridge.open().await.unwrap();

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        let sent = sent_message(&transport, 0).await;
        transport.deliver_json(
            &json!({
                "from": "tokenA",
                "message_id": sent["message_id"],
                "message_type": "nack",
            })
            .to_string(),
        );
    });

    assert!(matches!(result, Err(SendError::TimedOut(_))));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn test_write_failure_leaves_request_to_expire() {
    let mut settings = test_settings();
    settings.correlation.response_timeout_ms = 100;
    let transport = MockTransport::new();
    let bridge = CcsBridge::new(transport.clone(), settings);
    bridge.open().await.unwrap();
    transport.fail_sends(Some("broken pipe"));

    let result = bridge.send_message(data_message("tokenA")).await;

    assert!(matches!(result, Err(SendError::TimedOut(_))));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_broadcast_gives_each_recipient_its_own_id() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    let recipients: Vec<String> = vec!["tokenA".into(), "tokenB".into(), "tokenC".into()];
    let message = data_message("ignored");

    let (results, ()) = tokio::join!(bridge.send_broadcast(&message, &recipients), async {
        let sent = transport.wait_for_sent(3, WAIT).await;
        for json in sent {
            let sent: Value = serde_json::from_str(&json).unwrap();
            let error = (sent["to"] == "tokenB").then_some("DEVICE_UNREGISTERED");
            respond(&transport, &sent, error);
        }
    });

    assert_eq!(results.len(), 3);
    let ids: std::collections::HashSet<_> = transport
        .sent_json()
        .iter()
        .map(|json| {
            let sent: Value = serde_json::from_str(json).unwrap();
            sent["message_id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(message.message_id().unwrap()));

    for (recipient, result) in results {
        if recipient == "tokenB" {
            assert!(matches!(
                result,
                Err(SendError::Rejected {
                    class: ResponseClass::Unrecoverable,
                    ..
                })
            ));
        } else {
            assert_eq!(result.unwrap().from, recipient);
        }
    }
}

#[tokio::test]
async fn test_user_handlers_observe_traffic() {
    let receipts = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(AtomicUsize::new(0));
    let handlers = Handlers::default()
        .on_receipt_or_control({
            let receipts = receipts.clone();
            move |msg: &DeliveryReceiptOrControlMessage, _: &MessageSource| {
                receipts.lock().unwrap().push(msg.message_id.clone());
            }
        })
        .on_response({
            let responses = responses.clone();
            move |_: &DownstreamMessageResponse, _: &MessageSource| {
                responses.fetch_add(1, Ordering::SeqCst);
            }
        });
    let (bridge, transport) = open_bridge(handlers).await;

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        let sent = sent_message(&transport, 0).await;
        respond(&transport, &sent, None);
        transport.deliver_json(
            &json!({
                "message_type": "receipt",
                "message_id": "dr2:abc",
                "from": "gcm.googleapis.com",
                "category": "com.example",
                "data": {"message_status": "MESSAGE_SENT_TO_DEVICE"},
            })
            .to_string(),
        );
    });

    assert!(result.is_ok());
    assert_eq!(responses.load(Ordering::SeqCst), 1);
    assert_eq!(
        *receipts.lock().unwrap(),
        vec![Some("dr2:abc".to_string())]
    );
    assert_eq!(bridge.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn test_unknown_control_type_is_ignored() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;

    transport.deliver_json(r#"{"message_type":"control","control_type":"SOMETHING_NEW"}"#);

    assert_eq!(bridge.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn test_send_after_drain_waits_for_new_session() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    transport.fail_replacement(Some("relay busy"));
    transport.deliver_json(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#);
    assert_eq!(bridge.state(), ConnectionState::Draining);

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.sent().is_empty());

        transport.emit(ConnectionEvent::ClosedOnError("drained".into()));
        transport.emit(ConnectionEvent::Connected);
        transport.emit(ConnectionEvent::Authenticated { resumed: false });

        let sent = sent_message(&transport, 0).await;
        respond(&transport, &sent, None);
    });

    assert!(result.is_ok());
    assert_eq!(bridge.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn test_draining_control_moves_sends_to_replacement_session() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    transport.deliver_json(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#);

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        let sent = sent_message(&transport, 0).await;
        respond(&transport, &sent, None);
    });

    assert!(result.is_ok());
    assert_eq!(transport.replacement_count(), 1);
    assert_eq!(bridge.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn test_upstream_ack_is_sent_while_draining() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;
    transport.fail_replacement(Some("relay busy"));
    transport.deliver_json(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#);
    assert_eq!(bridge.state(), ConnectionState::Draining);

    transport.deliver_json(r#"{"from":"deviceX","category":"c","message_id":"m1"}"#);

    let sent = transport.wait_for_sent(1, WAIT).await;
    assert_eq!(
        sent,
        vec![r#"{"to":"deviceX","message_id":"m1","message_type":"ack"}"#.to_string()]
    );
    assert_eq!(bridge.state(), ConnectionState::Draining);
}

#[tokio::test]
async fn test_panicking_user_handlers_do_not_stop_the_bridge() {
    let handlers = Handlers::default()
        .on_response(|_: &DownstreamMessageResponse, _: &MessageSource| {
            panic!("response handler bug")
        })
        .on_upstream(|_: &UpstreamMessage, _: &MessageSource| panic!("upstream handler bug"));
    let (bridge, transport) = open_bridge(handlers).await;

    let (result, ()) = tokio::join!(bridge.send_message(data_message("tokenA")), async {
        let sent = sent_message(&transport, 0).await;
        respond(&transport, &sent, None);
    });
    assert!(result.is_ok());
    assert_eq!(bridge.pending_count(), 0);

    transport.deliver_json(r#"{"from":"deviceX","category":"c","message_id":"m9"}"#);
    let sent = transport.wait_for_sent(2, WAIT).await;
    assert_eq!(
        sent[1],
        r#"{"to":"deviceX","message_id":"m9","message_type":"ack"}"#
    );
    assert_eq!(bridge.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn test_close_rejects_further_sends() {
    let (bridge, transport) = open_bridge(Handlers::default()).await;

    bridge.close().await;

    assert_eq!(bridge.state(), ConnectionState::Closed);
    assert!(!transport.is_connected());
    assert!(matches!(
        bridge.submit(data_message("tokenA")),
        Err(SendError::NotConnected(ConnectionState::Closed))
    ));
}

#[tokio::test]
async fn test_saturated_executor_is_reported() {
    let mut settings = test_settings();
    settings.executor.workers = 1;
    settings.executor.queue_capacity = 1;
    settings.correlation.reconnect_wait_ms = 2_000;
    let transport = MockTransport::new();
    let bridge = CcsBridge::new(transport.clone(), settings);
    bridge.open().await.unwrap();

    // Park the only worker on a send that waits for a new session.
    transport.fail_replacement(Some("relay busy"));
    bridge.connection().enter_draining();
    let _first = bridge.submit(data_message("tokenA")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _second = bridge.submit(data_message("tokenB")).unwrap();

    let third = bridge.submit(data_message("tokenC"));
    assert!(matches!(
        third,
        Err(SendError::Executor(ExecutorError::Saturated))
    ));
    assert_eq!(bridge.pending_count(), 2);
}
