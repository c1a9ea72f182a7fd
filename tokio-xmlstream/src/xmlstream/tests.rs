// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end tests over an in-memory duplex transport: the test plays the
//! peer on one half and injects the other half via `connect_with`.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use stanza::Stanza;

use crate::dispatch::{FilterDirection, Handler, Matcher};
use crate::error::{Error, ProtocolError};
use crate::event::{self, EventData};
use crate::stream_error::DefinedCondition;
use crate::{ConnectionState, StreamConfig, XmlStream};

const PEER_HEADER: &[u8] = b"<stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' \
    from='test.example' id='abc' version='1.0'>";

fn test_config() -> StreamConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = StreamConfig::new("test.example");
    config.auto_reconnect = false;
    config.keepalive_interval = Duration::ZERO;
    config
}

async fn read_until_contains(server: &mut DuplexStream, needle: &str) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut collected = String::new();
        loop {
            let mut buf = [0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before {:?} arrived", needle);
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
            if collected.contains(needle) {
                return collected;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle))
}

/// Brings a stream up against a scripted peer and opens the session.
async fn connected_pair(config: StreamConfig) -> (XmlStream, DuplexStream) {
    let (client, mut server) = duplex(65536);
    let stream = XmlStream::new(config);
    stream.connect_with(Box::new(client));
    read_until_contains(&mut server, "version=\"1.0\">").await;
    server.write_all(PEER_HEADER).await.unwrap();
    stream.wait_for_session().await;
    (stream, server)
}

fn iq(id: &str) -> Stanza {
    let mut iq = Stanza::new("jabber:client", "iq");
    iq.set_attr("id", id);
    iq.set_attr("type", "get");
    iq
}

#[tokio::test]
async fn header_then_immediate_footer_is_an_orderly_end() {
    let (client, mut server) = duplex(65536);
    let stream = XmlStream::new(test_config());
    let saw_error = Arc::new(AtomicBool::new(false));
    let flag = saw_error.clone();
    stream.add_event_handler(
        event::SOCKET_ERROR,
        move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
        false,
        false,
    );
    stream.connect_with(Box::new(client));
    read_until_contains(&mut server, "version=\"1.0\">").await;

    // A peer that opens and immediately closes again. The parser never saw
    // a complete document, yet this must end as an orderly disconnect.
    server.write_all(PEER_HEADER).await.unwrap();
    server.write_all(b"</stream:stream>").await.unwrap();

    stream.wait_until_stopped().await;
    assert_eq!(stream.state(), ConnectionState::Disconnected);
    assert!(!saw_error.load(Ordering::SeqCst), "footer is not an error");
}

#[tokio::test]
async fn path_handler_receives_matching_stanza() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.register_handler(Handler::new(
        "query",
        Matcher::Path("iq/query".to_owned()),
        move |_, stanza| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send((stanza.get("id"), stanza.get("type")));
            }
            Ok(())
        },
    ));
    server
        .write_all(b"<iq id='1' type='result'><query xmlns='urn:test:q'/></iq>")
        .await
        .unwrap();
    let (id, iq_type) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "1");
    assert_eq!(iq_type, "result");
}

#[tokio::test]
async fn outgoing_filter_can_drop_a_stanza() {
    let (stream, mut server) = connected_pair(test_config()).await;
    stream.add_filter(
        FilterDirection::Out,
        Arc::new(|_, stanza| {
            if stanza.name() == "message" {
                None
            } else {
                Some(stanza)
            }
        }),
        None,
    );
    let mut message = Stanza::new("jabber:client", "message");
    message.set_attr("id", "m1");
    stream.send(message);
    stream.send(iq("after"));

    // The iq was queued after the message; its arrival proves the writer
    // made it past the dropped stanza without writing it.
    let out = read_until_contains(&mut server, "<iq").await;
    assert!(!out.contains("<message"), "dropped stanza was written: {}", out);
}

#[tokio::test]
async fn restart_resends_header_and_keeps_dispatching() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.register_handler(Handler::new(
        "reply",
        Matcher::Id("2".to_owned()),
        move |_, stanza| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(stanza.name().to_owned());
            }
            Ok(())
        },
    ));

    stream.restart_stream();
    read_until_contains(&mut server, "version=\"1.0\">").await;

    // A brand-new document on the same socket: the parser was reset, so a
    // second header must parse and stanzas keep flowing.
    server.write_all(PEER_HEADER).await.unwrap();
    server.write_all(b"<iq id='2' type='result'/>").await.unwrap();
    let name = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "iq");
}

#[tokio::test]
async fn every_matching_handler_gets_its_own_copy() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let (tx_a, rx_a) = oneshot::channel();
    let slot = Mutex::new(Some(tx_a));
    stream.register_handler(Handler::new(
        "first",
        Matcher::Path("message".to_owned()),
        move |_, mut stanza| {
            // Mutations here must never be visible to the other handler.
            stanza.set_attr("seen-by", "first");
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(stanza.get("id"));
            }
            Ok(())
        },
    ));
    let (tx_b, rx_b) = oneshot::channel();
    let slot = Mutex::new(Some(tx_b));
    stream.register_handler(Handler::new(
        "second",
        Matcher::Path("message".to_owned()),
        move |_, stanza| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send((stanza.get("id"), stanza.attr("seen-by").is_none()));
            }
            Ok(())
        },
    ));
    server
        .write_all(b"<message id='m7'/>")
        .await
        .unwrap();
    let id_a = tokio::time::timeout(Duration::from_secs(5), rx_a)
        .await
        .unwrap()
        .unwrap();
    let (id_b, untouched) = tokio::time::timeout(Duration::from_secs(5), rx_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id_a, "m7");
    assert_eq!(id_b, "m7");
    assert!(untouched);
}

#[tokio::test]
async fn disposable_handler_fires_exactly_once() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    stream.register_handler(
        Handler::new(
            "one-shot",
            Matcher::Path("message".to_owned()),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .once(),
    );
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.register_handler(Handler::new(
        "sync-point",
        Matcher::Id("done".to_owned()),
        move |_, _| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Ok(())
        },
    ));
    server.write_all(b"<message/>").await.unwrap();
    server.write_all(b"<message/>").await.unwrap();
    server.write_all(b"<iq id='done' type='result'/>").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn send_wait_returns_the_matching_reply() {
    let (stream, mut server) = connected_pair(test_config()).await;
    tokio::spawn(async move {
        read_until_contains(&mut server, "id=\"ping1\"").await;
        server
            .write_all(b"<iq id='ping1' type='result'/>")
            .await
            .unwrap();
        // Keep the peer half alive until the reply is consumed.
        let mut buf = [0u8; 64];
        let _ = server.read(&mut buf).await;
    });
    let reply = stream
        .send_wait(iq("ping1"), Matcher::Id("ping1".to_owned()))
        .await
        .unwrap();
    assert_eq!(reply.get("type"), "result");
}

#[tokio::test]
async fn unmatched_stanzas_raise_an_event() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.add_event_handler(
        event::UNHANDLED_STANZA,
        move |_, data| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(data.stanza().map(|st| st.name().to_owned()));
            }
            Ok(())
        },
        false,
        false,
    );
    server.write_all(b"<presence/>").await.unwrap();
    let name = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some("presence"));
}

#[tokio::test]
async fn stream_error_is_reported_and_fatal() {
    let (stream, mut server) = connected_pair(test_config()).await;
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.add_event_handler(
        event::STREAM_ERROR,
        move |_, data| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(data.stanza().map(|st| st.name().to_owned()));
            }
            Ok(())
        },
        false,
        false,
    );
    // The decoded condition also comes out through the error channel, so
    // callers that only watch socket errors still learn why the stream died.
    let (err_tx, err_rx) = oneshot::channel();
    let slot = Mutex::new(Some(err_tx));
    stream.add_event_handler(
        event::SOCKET_ERROR,
        move |_, data| {
            if let Some(tx) = slot.lock().unwrap().take() {
                if let EventData::Error(error) = data {
                    let _ = tx.send(error);
                }
            }
            Ok(())
        },
        false,
        false,
    );
    server
        .write_all(
            b"<stream:error>\
              <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
              </stream:error>",
        )
        .await
        .unwrap();
    let name = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some("error"));
    let error = tokio::time::timeout(Duration::from_secs(5), err_rx)
        .await
        .unwrap()
        .unwrap();
    match &*error {
        Error::Protocol(ProtocolError::Stream(stream_error)) => {
            assert_eq!(stream_error.condition, DefinedCondition::Conflict);
        }
        other => panic!("unexpected error payload: {}", other),
    }
    stream.wait_until_stopped().await;
    assert_eq!(stream.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn giving_up_reports_connection_failed() {
    // Nothing listens on port 1, so the single allowed attempt is refused.
    let mut config = test_config().with_address("127.0.0.1", 1);
    config.max_attempts = Some(1);
    let stream = XmlStream::new(config);
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.add_event_handler(
        event::CONNECTION_FAILED,
        move |_, data| {
            if let Some(tx) = slot.lock().unwrap().take() {
                if let EventData::Error(error) = data {
                    let _ = tx.send(error);
                }
            }
            Ok(())
        },
        false,
        false,
    );
    stream.connect();
    let error = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(&*error, Error::ConnectionFailed));
}

#[tokio::test]
async fn connect_request_interrupts_backoff_wait() {
    let config = test_config().with_address("127.0.0.1", 1);
    let stream = XmlStream::new(config);
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    stream.add_event_handler(
        event::SOCKET_ERROR,
        move |_, _| {
            let _ = err_tx.send(());
            Ok(())
        },
        false,
        false,
    );
    stream.connect();
    tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // The worker is now sleeping off its first retry delay. A fresh connect
    // request must cut the wait short instead of being swallowed by it.
    let asked = Instant::now();
    stream.connect();
    tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        asked.elapsed() < Duration::from_millis(800),
        "request sat out the backoff: {:?}",
        asked.elapsed()
    );
}

#[tokio::test]
async fn custom_events_carry_text_payloads() {
    let stream = XmlStream::new(test_config());
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    stream.add_event_handler(
        "custom_note",
        move |_, data| {
            if let Some(tx) = slot.lock().unwrap().take() {
                if let EventData::Text(text) = data {
                    let _ = tx.send(text);
                }
            }
            Ok(())
        },
        true,
        false,
    );
    stream.event("custom_note", EventData::Text("hello".to_owned()));
    let text = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn stanzas_wait_for_the_session_gate() {
    let mut config = test_config();
    config.auto_session = false;
    let (client, mut server) = duplex(65536);
    let stream = XmlStream::new(config);
    stream.connect_with(Box::new(client));
    read_until_contains(&mut server, "version=\"1.0\">").await;
    server.write_all(PEER_HEADER).await.unwrap();
    stream.wait_for_state(ConnectionState::Connected).await;

    stream.send(iq("early"));
    // Raw data skips the queue, so the marker arriving first proves the
    // stanza is still held back.
    stream.send_raw("<marker/>");
    let out = read_until_contains(&mut server, "<marker/>").await;
    assert!(!out.contains("<iq"), "stanza leaked past the gate: {}", out);

    stream.mark_session_started();
    read_until_contains(&mut server, "id=\"early\"").await;
}
