use std::time::Duration;

use super::*;
use crate::message::DownstreamMessageResponse;

fn nack(code: Option<&str>) -> DownstreamMessageResponse {
    DownstreamMessageResponse::nack("tokenA", "m1", code.map(String::from))
}

#[test]
fn test_ack_is_its_own_class() {
    let ack = DownstreamMessageResponse::ack("tokenA", "m1");
    assert_eq!(classify(&ack), ResponseClass::Ack);
    assert_eq!(classify(&ack).reaction(), Reaction::Complete);
}

#[test]
fn test_unrecoverable_codes() {
    for code in [
        "INVALID_JSON",
        "BAD_REGISTRATION",
        "DEVICE_UNREGISTERED",
        "BAD_ACK",
    ] {
        let class = classify(&nack(Some(code)));
        assert_eq!(class, ResponseClass::Unrecoverable, "{code}");
        assert!(!class.is_retryable());
        assert_eq!(class.reaction(), Reaction::Complete);
    }
}

#[test]
fn test_rate_limits_are_not_retryable() {
    for code in ["DEVICE_MESSAGE_RATE_EXCEEDED", "TOPICS_MESSAGE_RATE_EXCEEDED"] {
        let class = classify(&nack(Some(code)));
        assert_eq!(class, ResponseClass::RateLimited);
        assert!(!class.is_retryable());
    }
}

#[test]
fn test_transient_codes_are_retryable() {
    for code in ["SERVICE_UNAVAILABLE", "INTERNAL_SERVER_ERROR"] {
        let class = classify(&nack(Some(code)));
        assert_eq!(class, ResponseClass::Transient);
        assert!(class.is_retryable());
        assert_eq!(class.reaction(), Reaction::Complete);
    }
}

#[test]
fn test_draining_nack() {
    let class = classify(&nack(Some("CONNECTION_DRAINING")));
    assert_eq!(class, ResponseClass::Draining);
    assert!(class.is_retryable());
    assert_eq!(class.reaction(), Reaction::DrainAndComplete);
}

#[test]
fn test_missing_code_leaves_request_pending() {
    assert_eq!(classify(&nack(None)), ResponseClass::Missing);
    assert_eq!(classify(&nack(Some(""))), ResponseClass::Missing);
    assert_eq!(ResponseClass::Missing.reaction(), Reaction::LeavePending);
}

#[test]
fn test_unknown_code_is_unrecoverable() {
    let class = classify(&nack(Some("QUOTA_OF_SOMETHING")));
    assert_eq!(class, ResponseClass::Unrecoverable);
    assert_eq!(
        ErrorCode::from_wire("QUOTA_OF_SOMETHING"),
        ErrorCode::Other("QUOTA_OF_SOMETHING".into())
    );
}

#[test]
fn test_error_code_wire_names() {
    for code in [
        ErrorCode::InvalidJson,
        ErrorCode::BadRegistration,
        ErrorCode::DeviceUnregistered,
        ErrorCode::BadAck,
        ErrorCode::ServiceUnavailable,
        ErrorCode::InternalServerError,
        ErrorCode::DeviceMessageRateExceeded,
        ErrorCode::TopicsMessageRateExceeded,
        ErrorCode::ConnectionDraining,
    ] {
        assert_eq!(ErrorCode::from_wire(code.as_str()), code);
    }
}

#[test]
fn test_backoff_doubles_from_one_second() {
    let backoff = RetryBackoff::default();
    assert_eq!(backoff.delay_after(1), Duration::from_secs(1));
    assert_eq!(backoff.delay_after(2), Duration::from_secs(2));
    assert_eq!(backoff.delay_after(3), Duration::from_secs(4));
    assert_eq!(backoff.delay_after(10), Duration::from_secs(60));
    assert_eq!(backoff.delay_after(200), Duration::from_secs(60));
}
