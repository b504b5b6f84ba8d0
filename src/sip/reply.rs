//! Locally generated SIP error responses.

use std::fmt::Write;

use bytes::Bytes;
use rand::Rng;

use crate::error::ErrorCode;
use crate::sip::{HeaderType, MessageMetadata};

/// Build an error response for `request`, echoing its dialog headers.
///
/// A To tag is generated when the request has none, as required for any
/// final response.
pub fn encode_local_reply(request: &MessageMetadata, code: ErrorCode, reason: &str) -> Bytes {
    let mut out = String::with_capacity(256);
    let _ = write!(out, "SIP/2.0 {} {}\r\n", code.status(), code.reason_phrase());

    for via in request.list_header(HeaderType::Via) {
        let _ = write!(out, "Via: {}\r\n", via.text());
    }
    if let Some(from) = request.header(HeaderType::From) {
        let _ = write!(out, "From: {}\r\n", from.text());
    }
    if let Some(to) = request.header(HeaderType::To) {
        if to.has_param("tag") {
            let _ = write!(out, "To: {}\r\n", to.text());
        } else {
            let tag: u32 = rand::thread_rng().gen();
            let _ = write!(out, "To: {};tag={:08x}\r\n", to.text(), tag);
        }
    }
    if let Some(call_id) = request.header(HeaderType::CallId) {
        let _ = write!(out, "Call-ID: {}\r\n", call_id.text());
    }
    if let Some(cseq) = request.header(HeaderType::Cseq) {
        let _ = write!(out, "CSeq: {}\r\n", cseq.text());
    }
    let _ = write!(out, "Reason: {}\r\n", reason);
    out.push_str("Content-Length: 0\r\n\r\n");

    Bytes::from(out)
}
