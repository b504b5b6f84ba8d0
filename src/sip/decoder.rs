//! SIP stream framing and message parsing.
//!
//! # Responsibilities
//! - Cut complete messages out of a TCP byte stream using Content-Length
//! - Parse the start line into message/method type
//! - Classify headers and remember their byte positions
//! - Derive the transaction id from the top Via branch
//!
//! # Design Decisions
//! - Header block is bounded; an oversized block is a stream error
//! - Bodies are opaque bytes and never parsed
//! - Unknown headers are not stored; they survive untouched in the raw bytes

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::sip::{HeaderType, MessageMetadata, MethodType, MsgType, SipHeader};

/// Largest header block accepted before the stream is considered broken.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Largest Content-Length accepted. A bigger body would have to be
/// buffered whole before the message can be framed.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("invalid Content-Length '{0}'")]
    InvalidContentLength(String),

    #[error("body of {0} bytes exceeds {max} bytes", max = MAX_BODY_SIZE)]
    BodyTooLarge(usize),

    #[error("malformed start line '{0}'")]
    MalformedStartLine(String),

    #[error("header block is not valid UTF-8")]
    InvalidUtf8,

    #[error("message has no Via branch")]
    MissingTransactionId,
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Split one complete message off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Leading CRLF keep-alives
/// are discarded.
pub fn frame(buf: &mut BytesMut) -> DecodeResult<Option<Bytes>> {
    while buf.starts_with(b"\r\n") {
        let _ = buf.split_to(2);
    }

    let Some(blank_line) = find(buf, b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(DecodeError::HeaderTooLarge(MAX_HEADER_SIZE));
        }
        return Ok(None);
    };
    if blank_line > MAX_HEADER_SIZE {
        return Err(DecodeError::HeaderTooLarge(MAX_HEADER_SIZE));
    }

    let head = std::str::from_utf8(&buf[..blank_line]).map_err(|_| DecodeError::InvalidUtf8)?;
    let body_len = content_length(head)?;
    if body_len > MAX_BODY_SIZE {
        return Err(DecodeError::BodyTooLarge(body_len));
    }
    let total = blank_line + 4 + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(buf.split_to(total).freeze()))
}

/// Parse one framed message.
pub fn decode(raw: Bytes) -> DecodeResult<MessageMetadata> {
    // Offset of the blank line: just past the CRLF of the last header.
    let headers_end = find(&raw, b"\r\n\r\n")
        .map(|pos| pos + 2)
        .unwrap_or(raw.len());
    let head = std::str::from_utf8(&raw[..headers_end])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();

    let mut lines = Lines::new(&head);
    let (start_offset, start_line, start_len) = lines
        .next()
        .ok_or_else(|| DecodeError::MalformedStartLine(String::new()))?;

    let (msg_type, method_type, status_code) = parse_start_line(start_line)?;
    let mut metadata = MessageMetadata::new(raw.clone(), msg_type, method_type);
    metadata.set_headers_end(headers_end);
    if let Some(code) = status_code {
        metadata.set_status_code(code);
    }
    metadata.add_header(SipHeader::with_position(
        HeaderType::TopLine,
        start_line,
        start_offset,
        start_len,
    ));

    for (offset, line, len) in lines {
        if line.starts_with([' ', '\t']) {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let header_type = HeaderType::from_name(name);
        if header_type == HeaderType::Other {
            continue;
        }
        metadata.add_header(SipHeader::with_position(header_type, value.trim(), offset, len));
    }

    let branch = metadata
        .header(HeaderType::Via)
        .and_then(|via| via.param("branch"))
        .filter(|branch| !branch.is_empty())
        .map(str::to_string)
        .ok_or(DecodeError::MissingTransactionId)?;
    metadata.set_transaction_id(branch);

    if msg_type == MsgType::Response {
        let cseq_method = metadata
            .header(HeaderType::Cseq)
            .and_then(|cseq| cseq.text().split_whitespace().nth(1))
            .map(MethodType::from_token);
        if let Some(method) = cseq_method {
            metadata.set_resp_method_type(method);
        }
    }

    let cookie_ip_map = metadata
        .header(HeaderType::PCookieIpMap)
        .and_then(|header| cookie_ip_map(header.text()))
        .map(|(cookie, ip)| (cookie.to_string(), ip.to_string()));
    if let Some((cookie, ip)) = cookie_ip_map {
        metadata.set_p_cookie_ip_map(cookie, ip);
    }

    if method_type == MethodType::Register {
        let opaque = metadata
            .header(HeaderType::Auth)
            .and_then(|auth| opaque_value(auth.text()))
            .map(str::to_string);
        if let Some(opaque) = opaque {
            metadata.set_opaque(opaque);
        }
    }

    Ok(metadata)
}

fn parse_start_line(line: &str) -> DecodeResult<(MsgType, MethodType, Option<u16>)> {
    let malformed = || DecodeError::MalformedStartLine(line.to_string());
    let mut tokens = line.split_whitespace();

    let first = tokens.next().ok_or_else(malformed)?;
    if first.starts_with("SIP/") {
        let code: u16 = tokens
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(malformed)?;
        let method = if code == 200 {
            MethodType::Ok200
        } else {
            MethodType::NullMethod
        };
        return Ok((MsgType::Response, method, Some(code)));
    }

    let _uri = tokens.next().ok_or_else(malformed)?;
    match tokens.next() {
        Some(version) if version.starts_with("SIP/") => {
            Ok((MsgType::Request, MethodType::from_token(first), None))
        }
        _ => Err(malformed()),
    }
}

fn content_length(head: &str) -> DecodeResult<usize> {
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| DecodeError::InvalidContentLength(value.to_string()));
        }
    }
    Ok(0)
}

/// `<cookie>=<ip>`; both sides must be present.
fn cookie_ip_map(value: &str) -> Option<(&str, &str)> {
    let (cookie, ip) = value.split_once('=')?;
    let (cookie, ip) = (cookie.trim(), ip.trim());
    if cookie.is_empty() || ip.is_empty() {
        return None;
    }
    Some((cookie, ip))
}

/// `opaque="..."` out of a digest Authorization value.
fn opaque_value(auth: &str) -> Option<&str> {
    let start = auth.find("opaque=")? + "opaque=".len();
    let rest = &auth[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    let value = rest[..end].trim().trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Header lines with their byte offset and length (CRLF included).
struct Lines<'a> {
    head: &'a str,
    offset: usize,
}

impl<'a> Lines<'a> {
    fn new(head: &'a str) -> Self {
        Self { head, offset: 0 }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, &'a str, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.head.len() {
            return None;
        }
        let rest = &self.head[self.offset..];
        let (line, len) = match rest.find("\r\n") {
            Some(end) => (&rest[..end], end + 2),
            None => (rest, rest.len()),
        };
        let item = (self.offset, line, len);
        self.offset += len;
        if line.is_empty() {
            return None;
        }
        Some(item)
    }
}
