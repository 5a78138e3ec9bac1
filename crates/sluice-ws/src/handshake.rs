//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! Two entry points:
//!
//! - [`accept_upgrade`]: the caller's HTTP layer already parsed the request
//!   into an [`UpgradeRequest`]; validate it and write the response
//! - [`perform_upgrade`]: read and parse the request straight off a raw
//!   stream, check the path, and write the response
//!
//! Both compute `Sec-WebSocket-Accept` with [`compute_accept_key`] and answer
//! `101 Switching Protocols` on success.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::HandshakeError;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// Longest request or header line accepted on the raw-stream path.
const MAX_LINE_LEN: usize = 8 * 1024;

/// Most header lines accepted on the raw-stream path.
const MAX_HEADERS: usize = 100;

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// HTTP headers with case-insensitive names.
///
/// Repeated headers are folded into one comma-joined value, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, joining with any existing value of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The parts of an HTTP request the handshake looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    /// Absolute path of the request target, without query string.
    pub path: String,
    pub headers: Headers,
}

impl UpgradeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
        }
    }

    /// Builder-style [`Headers::append`].
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// True if `value`, a comma-separated token list, contains `token`.
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Validate everything except the protocol version.
///
/// Returns the client key on success, or the first failed precondition.
fn check_upgrade_headers(request: &UpgradeRequest) -> Result<String, HandshakeError> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::WrongMethod(request.method.clone()));
    }

    let headers = &request.headers;
    match headers.get("Upgrade") {
        None => return Err(HandshakeError::MissingHeader("Upgrade")),
        Some(v) if !has_token(v, "websocket") => {
            return Err(HandshakeError::InvalidHeader {
                name: "Upgrade",
                value: v.to_string(),
            })
        }
        Some(_) => {}
    }

    match headers.get("Connection") {
        None => return Err(HandshakeError::MissingHeader("Connection")),
        Some(v) if !has_token(v, "upgrade") => {
            return Err(HandshakeError::InvalidHeader {
                name: "Connection",
                value: v.to_string(),
            })
        }
        Some(_) => {}
    }

    match headers.get("Sec-WebSocket-Key").map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(HandshakeError::MissingHeader("Sec-WebSocket-Key")),
    }
}

fn check_version(request: &UpgradeRequest) -> Result<(), HandshakeError> {
    match request.headers.get("Sec-WebSocket-Version").map(str::trim) {
        Some(SUPPORTED_VERSION) => Ok(()),
        other => Err(HandshakeError::UnsupportedVersion(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Whether the request asks for a WebSocket upgrade.
///
/// Does not look at the version: an eligible request with the wrong version
/// still gets a `400` from [`accept_upgrade`] naming the supported one.
pub fn is_upgrade_request(request: &UpgradeRequest) -> bool {
    check_upgrade_headers(request).is_ok()
}

/// Validate an upgrade request per RFC 6455 Section 4.2.1.
///
/// Returns the client key if every required header is present and valid.
pub fn validate_upgrade_request(request: &UpgradeRequest) -> Result<String, HandshakeError> {
    let key = check_upgrade_headers(request)?;
    check_version(request)?;
    Ok(key)
}

/// Write the `101 Switching Protocols` response to the stream.
pub fn write_upgrade_response<W: Write>(stream: &mut W, accept_key: &str) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )?;
    stream.flush()
}

/// Write a `400 Bad Request` response with the given reason.
pub fn write_bad_request<W: Write>(
    stream: &mut W,
    reason: &str,
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let body = format!("Bad Request: {reason}");
    write!(stream, "HTTP/1.1 400 Bad Request\r\n")?;
    for (name, value) in extra_headers {
        write!(stream, "{name}: {value}\r\n")?;
    }
    write!(
        stream,
        "Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )?;
    stream.flush()
}

/// Complete the handshake for a request an HTTP layer already parsed.
///
/// A request that is not an upgrade is refused with the failed precondition
/// and nothing is written. An unsupported `Sec-WebSocket-Version` is
/// answered with `400 Bad Request` advertising version 13 before the error
/// is returned.
pub fn accept_upgrade<W: Write>(
    stream: &mut W,
    request: &UpgradeRequest,
) -> Result<(), HandshakeError> {
    let key = check_upgrade_headers(request).inspect_err(|e| {
        debug!(error = %e, "rejecting non-upgrade request");
    })?;
    respond(stream, request, &key)
}

/// Answer a validated request: `400` for an unsupported version, else `101`.
pub(crate) fn respond<W: Write>(
    stream: &mut W,
    request: &UpgradeRequest,
    key: &str,
) -> Result<(), HandshakeError> {
    if let Err(e) = check_version(request) {
        debug!(error = %e, "rejecting WebSocket upgrade");
        write_bad_request(
            stream,
            &e.to_string(),
            &[("Sec-WebSocket-Version", SUPPORTED_VERSION)],
        )?;
        return Err(e);
    }
    write_upgrade_response(stream, &compute_accept_key(key))?;
    Ok(())
}

/// Perform the server side of the handshake on a raw stream.
///
/// Reads the request line and headers, requires the request path to equal
/// `expected_path`, validates the upgrade headers, and writes the response.
/// Validation failures are answered with `400 Bad Request` before the error
/// is returned; the caller decides whether to close the transport.
///
/// The request is read one byte at a time so nothing past the blank line is
/// consumed. RFC 6455 clients do not send frames before the 101 arrives, but
/// this keeps the stream exact either way.
pub fn perform_upgrade<S: Read + Write>(
    stream: &mut S,
    expected_path: &str,
) -> Result<UpgradeRequest, HandshakeError> {
    let (request, key) = read_upgrade_request(stream, expected_path)?;
    respond(stream, &request, &key)?;
    Ok(request)
}

/// Read and validate the request, answering failures with `400`.
///
/// Returns the request and its `Sec-WebSocket-Key`; the version check and
/// the `101` are left to [`respond`].
pub(crate) fn read_upgrade_request<S: Read + Write>(
    stream: &mut S,
    expected_path: &str,
) -> Result<(UpgradeRequest, String), HandshakeError> {
    let request = match read_request(stream, expected_path) {
        Ok(request) => request,
        Err(HandshakeError::Io(e)) => return Err(HandshakeError::Io(e)),
        Err(e) => return Err(reject(stream, e)),
    };
    match check_upgrade_headers(&request) {
        Ok(key) => Ok((request, key)),
        Err(e) => Err(reject(stream, e)),
    }
}

/// Answer a refused raw-stream request with `400` and hand back the error.
fn reject<W: Write>(stream: &mut W, e: HandshakeError) -> HandshakeError {
    debug!(error = %e, "rejecting WebSocket upgrade");
    if let Err(write_err) = write_bad_request(stream, &e.to_string(), &[]) {
        debug!(error = %write_err, "could not send 400 response");
    }
    e
}

fn read_request<R: Read>(
    reader: &mut R,
    expected_path: &str,
) -> Result<UpgradeRequest, HandshakeError> {
    // 1. Request line: "GET /path HTTP/1.1"
    let line = read_line(reader)?;
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != 3 {
        return Err(HandshakeError::MalformedRequest(format!(
            "invalid request line: {line}"
        )));
    }
    let method = tokens[0].to_ascii_uppercase();
    if method != "GET" {
        return Err(HandshakeError::WrongMethod(tokens[0].to_string()));
    }

    let path = request_path(tokens[1]);
    if path != expected_path {
        return Err(HandshakeError::PathMismatch {
            requested: path,
            expected: expected_path.to_string(),
        });
    }

    // 2. Headers until blank line
    let mut request = UpgradeRequest::new(method, path);
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }
        if request.headers.len() >= MAX_HEADERS {
            return Err(HandshakeError::MalformedRequest(
                "too many header lines".to_string(),
            ));
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            HandshakeError::MalformedRequest(format!("invalid header line: {line}"))
        })?;
        request.headers.append(name.trim(), value.trim_start_matches(' '));
    }
    Ok(request)
}

/// Reduce a request target to its absolute path.
///
/// Absolute-form targets (`http://host/path`) lose the scheme and authority;
/// query and fragment are dropped; a leading `/` is ensured.
fn request_path(target: &str) -> String {
    let path = match target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
        None => target,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Read one CRLF- (or LF-) terminated line without buffering past it.
fn read_line<R: Read>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Err(HandshakeError::MalformedRequest(
                "connection closed mid-request".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(HandshakeError::MalformedRequest(
                "request line too long".to_string(),
            ));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| HandshakeError::MalformedRequest("non UTF-8 request line".to_string()))
}
