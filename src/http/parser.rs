//! The parser adapter: turns buffered bytes into a structured [`Request`]
//! and reports how many bytes the head consumed, or asks for more data.
//!
//! Classification happens here too. Three request shapes are recognized:
//! an HTTP/1.x request line, a message-protocol frame (`@path {json}`
//! terminated by NUL or newline), and the raw socket-policy request.

use crate::http::request::{Headers, Method, Request};

pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>";

#[derive(Debug)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    Incomplete,
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the bytes consumed. For HTTP that is the head
/// only — the body is left to the exchange strategies, which stream it with
/// their own accounting. For message and policy frames the whole frame is
/// consumed.
pub fn parse_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    if buf.is_empty() {
        return Err(ParseError::Incomplete);
    }

    if buf[0] == b'<' {
        return parse_policy(buf);
    }

    if buf[0] == b'@' {
        return parse_message(buf);
    }

    parse_http(buf)
}

fn parse_policy(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    if buf.len() < POLICY_REQUEST.len() {
        return if POLICY_REQUEST.starts_with(buf) {
            Err(ParseError::Incomplete)
        } else {
            Err(ParseError::InvalidRequest)
        };
    }

    if !buf.starts_with(POLICY_REQUEST) {
        return Err(ParseError::InvalidRequest);
    }

    // Flash-style senders NUL-terminate the request
    let mut consumed = POLICY_REQUEST.len();
    if buf.get(consumed) == Some(&0) {
        consumed += 1;
    }

    let mut req = Request::new(Method::POLICY, "/", "");
    req.head_len = consumed;
    Ok((req, consumed))
}

/// `@path {json}` frames, NUL- or newline-terminated. The marker-prefixed
/// path is what handler routes register. A frame with no body after the
/// path parses with a zero content length; the connection layer drops
/// those silently.
fn parse_message(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let term = buf
        .iter()
        .position(|&b| b == 0 || b == b'\n')
        .ok_or(ParseError::Incomplete)?;

    let frame = std::str::from_utf8(&buf[..term]).map_err(|_| ParseError::InvalidRequest)?;

    let (path, body_start) = match frame.split_once(' ') {
        Some((marker, _)) => (marker, marker.len() + 1),
        None => (frame, frame.len()),
    };

    if path.len() < 2 {
        return Err(ParseError::InvalidRequest);
    }

    let mut req = Request::new(Method::JSON, path, "");
    req.head_len = body_start;
    req.body_len = term - body_start;
    Ok((req, term + 1))
}

fn parse_http(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    // Look for the head/body separator
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let head_bytes = &buf[..headers_end];

    let head_str = std::str::from_utf8(head_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = head_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    if !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidRequest);
    }

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        headers.insert(key.trim(), value.trim());
    }

    let content_length = headers
        .get("Content-Length")
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)
        })
        .transpose()?
        .unwrap_or(0);

    let consumed = headers_end + 4;

    let mut req = Request::new(method, path, version);
    req.headers = headers;
    req.head_len = consumed;
    req.body_len = content_length;

    Ok((req, consumed))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
