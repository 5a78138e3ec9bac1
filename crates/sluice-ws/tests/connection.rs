//! End-to-end connection behaviour over loopback TCP.

mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use sluice_ws::{
    CloseCode, ConnectionState, HandshakeError, LifecycleError, Message, WebSocket, WsConfig,
    WsError,
};

#[test]
fn echoes_text_and_binary() {
    let mut h = connect(WsConfig::default(), true);

    send_frame(&mut h.client, FIN_TEXT, b"Hello WebSocket");
    let (first, payload) = read_frame(&mut h.client);
    assert_eq!(first, FIN_TEXT);
    assert_eq!(payload, b"Hello WebSocket");

    send_frame(&mut h.client, FIN_BINARY, &[0, 1, 2, 255]);
    let (first, payload) = read_frame(&mut h.client);
    assert_eq!(first, FIN_BINARY);
    assert_eq!(payload, vec![0, 1, 2, 255]);

    assert_eq!(
        h.messages.recv_timeout(TIMEOUT).unwrap(),
        Message::Text("Hello WebSocket".to_string())
    );
    assert_eq!(h.ws.state(), ConnectionState::Open);
}

#[test]
fn large_payloads_use_extended_lengths() {
    let mut h = connect(WsConfig::default(), true);

    let medium = vec![7u8; 300];
    send_frame(&mut h.client, FIN_BINARY, &medium);
    assert_eq!(read_frame(&mut h.client).1, medium);

    let large = vec![9u8; 70_000];
    send_frame(&mut h.client, FIN_BINARY, &large);
    assert_eq!(read_frame(&mut h.client).1, large);
}

#[test]
fn fragments_reassemble_around_interleaved_ping() {
    let mut h = connect(WsConfig::default(), true);

    send_frame(&mut h.client, TEXT, b"Hel");
    send_frame(&mut h.client, PING, b"hb");
    send_frame(&mut h.client, CONTINUATION, b"lo");
    send_frame(&mut h.client, FIN_CONTINUATION, b"!");

    let (first, payload) = read_frame(&mut h.client);
    assert_eq!(first, PONG);
    assert_eq!(payload, b"hb");

    let (first, payload) = read_frame(&mut h.client);
    assert_eq!(first, FIN_TEXT);
    assert_eq!(payload, b"Hello!");
}

#[test]
fn orphan_continuation_closes_with_protocol_error() {
    let mut h = connect(WsConfig::default(), false);

    send_frame(&mut h.client, FIN_CONTINUATION, b"stray");
    let (code, _) = expect_close(&mut h.client);
    assert_eq!(code, 1002);
    expect_eof(&mut h.client);

    let close = h.closes.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(close.code, CloseCode::ProtocolError);
    assert!(h.messages.try_recv().is_err());
}

#[test]
fn new_message_inside_fragment_sequence_is_rejected() {
    let mut h = connect(WsConfig::default(), false);

    send_frame(&mut h.client, TEXT, b"part");
    send_frame(&mut h.client, FIN_BINARY, b"other");
    assert_eq!(expect_close(&mut h.client).0, 1002);
    assert_eq!(
        h.closes.recv_timeout(TIMEOUT).unwrap().code,
        CloseCode::ProtocolError
    );
}

#[test]
fn running_total_over_limit_is_message_too_big() {
    let mut h = connect(WsConfig::default().with_max_message_size(16), false);

    send_frame(&mut h.client, BINARY, &[1; 8]);
    send_frame(&mut h.client, CONTINUATION, &[2; 8]);
    send_frame(&mut h.client, FIN_CONTINUATION, &[3; 1]);

    let (code, reason) = expect_close(&mut h.client);
    assert_eq!(code, 1009);
    assert!(reason.contains("17"), "reason was {reason:?}");

    let close = h.closes.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(close.code, CloseCode::MessageTooBig);
    assert!(h.messages.try_recv().is_err());
}

#[test]
fn message_at_limit_is_delivered() {
    let mut h = connect(WsConfig::default().with_max_message_size(16), false);

    send_frame(&mut h.client, BINARY, &[1; 8]);
    send_frame(&mut h.client, FIN_CONTINUATION, &[2; 8]);

    let mut expected = vec![1; 8];
    expected.extend_from_slice(&[2; 8]);
    assert_eq!(
        h.messages.recv_timeout(TIMEOUT).unwrap(),
        Message::Binary(expected)
    );
}

#[test]
fn invalid_utf8_text_closes_with_invalid_payload() {
    let mut h = connect(WsConfig::default(), false);

    send_frame(&mut h.client, FIN_TEXT, &[0xC3, 0x28]);
    assert_eq!(expect_close(&mut h.client).0, 1007);
    assert_eq!(
        h.closes.recv_timeout(TIMEOUT).unwrap().code,
        CloseCode::InvalidPayload
    );
}

#[test]
fn unmasked_client_frame_is_protocol_error() {
    use std::io::Write;

    let mut h = connect(WsConfig::default(), false);
    h.client.write_all(&[FIN_TEXT, 0x02, b'h', b'i']).unwrap();
    assert_eq!(expect_close(&mut h.client).0, 1002);
}

#[test]
fn peer_close_is_echoed_and_reported() {
    let mut h = connect(WsConfig::default(), false);

    send_close(&mut h.client, 1001, "bye");
    let (code, reason) = expect_close(&mut h.client);
    assert_eq!(code, 1000);
    assert!(reason.is_empty());
    expect_eof(&mut h.client);

    let close = h.closes.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(close.code, CloseCode::GoingAway);
    assert_eq!(close.message, "bye");
}

#[test]
fn empty_close_payload_reports_no_status() {
    let mut h = connect(WsConfig::default(), false);

    send_frame(&mut h.client, CLOSE, &[]);
    assert_eq!(expect_close(&mut h.client).0, 1000);
    assert_eq!(
        h.closes.recv_timeout(TIMEOUT).unwrap().code,
        CloseCode::NoStatus
    );
}

#[test]
fn abrupt_disconnect_reports_connection_lost() {
    let h = connect(WsConfig::default(), false);
    drop(h.client);

    let close = h.closes.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(close.code, CloseCode::ConnectionLost);
}

#[test]
fn local_close_interrupts_blocked_read() {
    let mut h = connect(WsConfig::default(), false);
    // Let the read loop block in its first read.
    thread::sleep(Duration::from_millis(50));

    h.ws.close_with(CloseCode::GoingAway, "restarting");
    let (code, reason) = expect_close(&mut h.client);
    assert_eq!(code, 1001);
    assert_eq!(reason, "restarting");
    expect_eof(&mut h.client);

    let close = h.closes.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(close.code, CloseCode::GoingAway);
    assert_eq!(close.message, "restarting");
    assert!(matches!(h.ws.send_text("late"), Err(WsError::ConnectionClosed)));
}

#[test]
fn concurrent_close_sends_one_frame_and_one_callback() {
    let mut h = connect(WsConfig::default(), false);

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let ws = h.ws.clone();
            thread::spawn(move || ws.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    assert_eq!(expect_close(&mut h.client).0, 1000);
    expect_eof(&mut h.client);

    assert_eq!(h.closes.recv_timeout(TIMEOUT).unwrap().code, CloseCode::Normal);
    assert!(h
        .closes
        .recv_timeout(Duration::from_millis(200))
        .is_err());

    let mut waited = Duration::ZERO;
    while h.ws.state() != ConnectionState::Closed && waited < TIMEOUT {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(h.ws.state(), ConnectionState::Closed);
}

#[test]
fn sends_from_many_threads_never_interleave() {
    let mut h = connect(WsConfig::default(), false);

    let senders: Vec<_> = (0..4)
        .map(|t| {
            let ws = h.ws.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    ws.send_text(&format!("t{t}-{i}-{}", "x".repeat(200))).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let mut per_thread = [0usize; 4];
    for _ in 0..200 {
        let (first, payload) = read_frame(&mut h.client);
        assert_eq!(first, FIN_TEXT);
        let text = String::from_utf8(payload).unwrap();
        let t: usize = text[1..2].parse().unwrap();
        per_thread[t] += 1;
    }
    assert_eq!(per_thread, [50; 4]);
}

#[test]
fn panicking_callback_does_not_stop_the_loop() {
    init_test_logging();
    let (mut client, ws) = accept_pair(WsConfig::default());
    let replier = ws.clone();
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    ws.start_reading(
        move |message| {
            if message.as_text() == Some("boom") {
                panic!("handler failure");
            }
            replier.send_binary(message.as_bytes()).unwrap();
        },
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    send_frame(&mut client, FIN_TEXT, b"boom");
    send_frame(&mut client, FIN_TEXT, b"still here");
    let (first, payload) = read_frame(&mut client);
    assert_eq!(first, FIN_BINARY);
    assert_eq!(payload, b"still here");

    send_close(&mut client, 1000, "");
    expect_close(&mut client);
    expect_eof(&mut client);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn start_reading_twice_is_rejected() {
    let h = connect(WsConfig::default(), false);
    assert!(matches!(
        h.ws.start_reading(|_| {}, |_| {}),
        Err(LifecycleError::AlreadyStarted)
    ));
}

#[test]
fn wrong_path_gets_400_and_handshake_cannot_repeat() {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let ws = WebSocket::new(stream).unwrap();
        let first = ws.complete_handshake("/ws");
        let second = ws.complete_handshake("/ws");
        (first, second, ws)
    });

    let mut client = client_handshake(addr, "/chat");
    let response = read_http_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

    let (first, second, _ws) = server.join().unwrap();
    assert!(matches!(first, Err(HandshakeError::PathMismatch { .. })));
    assert!(matches!(second, Err(HandshakeError::AlreadyPerformed)));
}

#[test]
fn parsed_request_entry_point_upgrades() {
    use sluice_ws::UpgradeRequest;

    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // The client's request bytes stand in for an HTTP layer's parse.
        let mut reader = stream.try_clone().unwrap();
        read_http_response(&mut reader);
        let request = UpgradeRequest::new("GET", "/ws")
            .header("Upgrade", "websocket")
            .header("Connection", "keep-alive, Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13");
        WebSocket::from_upgrade(stream, &request, WsConfig::default()).unwrap()
    });

    let mut client = client_handshake(addr, "/ws");
    let response = read_http_response(&mut client);
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    let ws = server.join().unwrap();
    assert!(matches!(
        ws.complete_handshake("/ws"),
        Err(HandshakeError::AlreadyPerformed)
    ));
    let replier = ws.clone();
    ws.start_reading(
        move |m| {
            let _ = replier.send_text(m.as_text().unwrap_or_default());
        },
        |_| {},
    )
    .unwrap();
    send_frame(&mut client, FIN_TEXT, b"hi");
    assert_eq!(read_frame(&mut client).1, b"hi");
}
