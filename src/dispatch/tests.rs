use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::*;
use crate::message::Category;
use crate::transport::Stanza;
use crate::utils::error::{DispatchError, SourceError};

#[derive(Default)]
struct Calls {
    upstream: AtomicUsize,
    response: AtomicUsize,
    receipt_or_control: AtomicUsize,
}

impl Calls {
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.upstream.load(Ordering::SeqCst),
            self.response.load(Ordering::SeqCst),
            self.receipt_or_control.load(Ordering::SeqCst),
        )
    }
}

fn counting_dispatcher() -> (Arc<StanzaDispatcher>, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    let (a, b, c) = (calls.clone(), calls.clone(), calls.clone());
    let handlers = Handlers::default()
        .on_upstream(move |_, _| {
            a.upstream.fetch_add(1, Ordering::SeqCst);
        })
        .on_response(move |_, _| {
            b.response.fetch_add(1, Ordering::SeqCst);
        })
        .on_receipt_or_control(move |_, _| {
            c.receipt_or_control.fetch_add(1, Ordering::SeqCst);
        });
    (StanzaDispatcher::new(handlers), calls)
}

#[test]
fn test_each_category_reaches_exactly_one_handler() {
    let (dispatcher, calls) = counting_dispatcher();

    let upstream = Stanza::wrap_json(r#"{"from":"d","category":"c","message_id":"m1"}"#);
    assert_eq!(dispatcher.on_stanza(upstream).unwrap(), Category::Upstream);
    assert_eq!(calls.counts(), (1, 0, 0));

    let nack = Stanza::wrap_json(
        r#"{"from":"t","message_id":"m2","message_type":"nack","error":"BAD_ACK"}"#,
    );
    assert_eq!(
        dispatcher.on_stanza(nack).unwrap(),
        Category::DownstreamResponse
    );
    assert_eq!(calls.counts(), (1, 1, 0));

    let receipt = Stanza::wrap_json(r#"{"message_type":"receipt","message_id":"dr2:m3"}"#);
    assert_eq!(
        dispatcher.on_stanza(receipt).unwrap(),
        Category::ReceiptOrControl
    );
    assert_eq!(calls.counts(), (1, 1, 1));
}

#[test]
fn test_unknown_message_type_reaches_no_handler() {
    let (dispatcher, calls) = counting_dispatcher();

    let result = dispatcher.on_stanza(Stanza::wrap_json(r#"{"message_type":"bogus"}"#));

    assert!(matches!(result, Err(DispatchError::UnknownMessageType(_))));
    assert!(result.unwrap_err().is_classification_failure());
    assert_eq!(calls.counts(), (0, 0, 0));
}

#[test]
fn test_malformed_payload_skips_handler() {
    let (dispatcher, calls) = counting_dispatcher();

    // Upstream messages need `from`, `category` and `message_id`.
    let result = dispatcher.on_stanza(Stanza::wrap_json(r#"{"from":"deviceX"}"#));
    assert!(matches!(
        result,
        Err(DispatchError::Malformed {
            category: Category::Upstream,
            ..
        })
    ));

    let result = dispatcher.on_stanza(Stanza::wrap_json("not json"));
    assert!(matches!(
        result,
        Err(DispatchError::Source(SourceError::Json(_)))
    ));

    let result = dispatcher.on_stanza(Stanza::from_xml("<message><body>hi</body></message>"));
    assert!(matches!(
        result,
        Err(DispatchError::Source(SourceError::MissingPayload))
    ));
    assert_eq!(calls.counts(), (0, 0, 0));
}

#[test]
fn test_missing_handler_drops_silently() {
    let dispatcher = StanzaDispatcher::new(Handlers::default());

    let category = dispatcher
        .on_stanza(Stanza::wrap_json(
            r#"{"from":"t","message_id":"m1","message_type":"ack"}"#,
        ))
        .unwrap();
    assert_eq!(category, Category::DownstreamResponse);
}

#[test]
fn test_handler_sees_cached_source() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let dispatcher = StanzaDispatcher::new(Handlers::default().on_response(move |msg, source| {
        *sink.lock().unwrap() = Some((
            msg.message_id.clone(),
            source.field("from").map(String::from),
            source.as_json_str().unwrap().to_string(),
        ));
    }));

    let json = r#"{"from":"tokenA","message_id":"m9","message_type":"ack"}"#;
    dispatcher.on_stanza(Stanza::wrap_json(json)).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        Some(("m9".to_string(), Some("tokenA".to_string()), json.to_string()))
    );
}

#[test]
fn test_set_handlers_replaces_routing() {
    let (dispatcher, calls) = counting_dispatcher();
    dispatcher.set_handlers(Handlers::default());

    dispatcher
        .on_stanza(Stanza::wrap_json(r#"{"from":"d","category":"c","message_id":"m1"}"#))
        .unwrap();
    assert_eq!(calls.counts(), (0, 0, 0));
}

#[test]
fn test_listener_swallows_failures() {
    let (dispatcher, calls) = counting_dispatcher();
    let listener = dispatcher.listener();

    listener(Stanza::wrap_json(r#"{"message_type":"bogus"}"#));
    listener(Stanza::wrap_json("{"));
    listener(Stanza::wrap_json(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#));

    assert_eq!(calls.counts(), (0, 0, 1));
}

#[test]
fn test_logging_handlers_cover_every_category() {
    let handlers = Handlers::logging();
    assert!(handlers.upstream.is_some());
    assert!(handlers.response.is_some());
    assert!(handlers.receipt_or_control.is_some());

    let dispatcher = StanzaDispatcher::new(handlers);
    dispatcher
        .on_stanza(Stanza::wrap_json(
            r#"{"from":"t","message_id":"m1","message_type":"nack","error":"BAD_ACK"}"#,
        ))
        .unwrap();
}

#[test]
fn test_panicking_handler_is_contained() {
    let responses = Arc::new(AtomicUsize::new(0));
    let counter = responses.clone();
    let dispatcher = StanzaDispatcher::new(
        Handlers::default()
            .on_upstream(|_: &UpstreamMessage, _: &MessageSource| panic!("handler bug"))
            .on_response(move |_: &DownstreamMessageResponse, _: &MessageSource| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    );

    let err = dispatcher
        .on_stanza(Stanza::wrap_json(r#"{"from":"d","category":"c","message_id":"m1"}"#))
        .unwrap_err();
    assert!(matches!(err, DispatchError::HandlerPanicked(Category::Upstream)));
    assert!(err.is_classification_failure());

    // The listener keeps working for the stanzas that follow.
    let listener = dispatcher.listener();
    listener(Stanza::wrap_json(r#"{"from":"d","category":"c","message_id":"m2"}"#));
    listener(Stanza::wrap_json(r#"{"from":"t","message_id":"m3","message_type":"ack"}"#));
    assert_eq!(responses.load(Ordering::SeqCst), 1);
}
