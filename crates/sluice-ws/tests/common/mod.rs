//! Loopback harness shared by the connection tests.
//!
//! The server side is a real [`WebSocket`] over `TcpStream`; the client side
//! is written by hand so tests control every byte on the wire.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use sluice_ws::frame::apply_mask;
use sluice_ws::{CloseFrame, Message, WebSocket, WsConfig};

static INIT_LOGGING: Once = Once::new();

pub const FIN_TEXT: u8 = 0x81;
pub const FIN_BINARY: u8 = 0x82;
pub const TEXT: u8 = 0x01;
pub const BINARY: u8 = 0x02;
pub const CONTINUATION: u8 = 0x00;
pub const FIN_CONTINUATION: u8 = 0x80;
pub const CLOSE: u8 = 0x88;
pub const PING: u8 = 0x89;
pub const PONG: u8 = 0x8A;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

pub struct Harness {
    pub client: TcpStream,
    pub ws: WebSocket,
    pub messages: Receiver<Message>,
    pub closes: Receiver<CloseFrame>,
}

/// Connect a client, complete the handshake on the raw stream, and start
/// the read loop. With `echo`, every message is sent straight back.
pub fn connect(config: WsConfig, echo: bool) -> Harness {
    init_test_logging();
    let (client, ws) = accept_pair(config);

    let (msg_tx, messages) = unbounded();
    let (close_tx, closes) = unbounded();
    let replier = ws.clone();
    ws.start_reading(
        move |message| {
            if echo {
                let _ = match &message {
                    Message::Text(text) => replier.send_text(text),
                    Message::Binary(data) => replier.send_binary(data),
                };
            }
            let _ = msg_tx.send(message);
        },
        move |close| {
            let _ = close_tx.send(close);
        },
    )
    .unwrap();

    Harness {
        client,
        ws,
        messages,
        closes,
    }
}

/// Handshaken client and server, read loop not started.
pub fn accept_pair(config: WsConfig) -> (TcpStream, WebSocket) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let ws = WebSocket::with_config(stream, config).unwrap();
        ws.complete_handshake("/ws").unwrap();
        ws
    });
    let client = client_handshake(addr, "/ws");
    assert!(read_http_response(&mut &client).contains("101"));
    (client, server.join().unwrap())
}

/// Send an upgrade request for `path`.
pub fn client_handshake(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    write!(
        stream,
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
    .unwrap();
    stream.flush().unwrap();
    stream
}

/// Read an HTTP response head byte-by-byte so no frame bytes are consumed.
pub fn read_http_response<R: Read>(stream: &mut R) -> String {
    let mut resp = Vec::new();
    let mut byte = [0u8; 1];
    while !resp.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        resp.push(byte[0]);
    }
    String::from_utf8_lossy(&resp).into_owned()
}

/// Write one masked client frame with a random key.
pub fn send_frame(stream: &mut TcpStream, first: u8, payload: &[u8]) {
    let mask_key: [u8; 4] = rand::random();
    let mut body = payload.to_vec();
    apply_mask(&mut body, &mask_key);

    let mut frame = vec![first];
    let len = payload.len();
    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(&mask_key);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).unwrap();
    stream.flush().unwrap();
}

pub fn send_close(stream: &mut TcpStream, code: u16, reason: &str) {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    send_frame(stream, CLOSE, &payload);
}

/// Read one unmasked server frame: (first byte, payload).
pub fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (head[0], payload)
}

/// Read the next frame and require a close frame: (code, reason).
pub fn expect_close(stream: &mut TcpStream) -> (u16, String) {
    let (first, payload) = read_frame(stream);
    assert_eq!(first, CLOSE, "expected a close frame, got {first:#04x}");
    assert!(payload.len() >= 2);
    (
        u16::from_be_bytes([payload[0], payload[1]]),
        String::from_utf8(payload[2..].to_vec()).unwrap(),
    )
}

/// The server has shut the connection: no more bytes will arrive.
pub fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, read {n} more bytes"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected EOF, got {e}"),
    }
}
