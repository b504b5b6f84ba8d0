//! Parsed representation of one SIP message.
//!
//! # Responsibilities
//! - Own the raw bytes and the headers classified from them
//! - Carry routing state: transaction id, destination, affinity cursor
//! - Record header edits as operations instead of rewriting bytes
//!
//! # Design Decisions
//! - The affinity list is a restartable cursor, not a one-shot iterator:
//!   a paused message resumes exactly where it stopped
//! - Shared between the connection manager and one router through
//!   `Rc<RefCell<_>>`; borrows are kept short on both sides

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;

use crate::sip::{HeaderType, MethodType, MsgType, Operation, SipHeader};

pub type MessageMetadataRef = Rc<RefCell<MessageMetadata>>;

/// A routing candidate derived from a header.
///
/// `affinity_type` is `"ep"` for endpoint affinity resolved from the
/// message itself. Any other type is looked up through the traffic
/// routing assistant with `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityEntry {
    pub header: String,
    pub affinity_type: String,
    pub key: String,
    pub query: bool,
    pub subscribe: bool,
}

impl AffinityEntry {
    pub fn new(
        header: impl Into<String>,
        affinity_type: impl Into<String>,
        key: impl Into<String>,
        query: bool,
        subscribe: bool,
    ) -> Self {
        Self {
            header: header.into(),
            affinity_type: affinity_type.into(),
            key: key.into(),
            query,
            subscribe,
        }
    }

    pub fn is_ep(&self) -> bool {
        self.affinity_type == "ep"
    }
}

#[derive(Debug, Clone)]
pub struct MessageMetadata {
    raw_msg: Bytes,
    msg_type: MsgType,
    method_type: MethodType,
    resp_method_type: Option<MethodType>,
    status_code: Option<u16>,
    transaction_id: Option<String>,
    destination: Option<String>,
    opaque: Option<String>,
    p_cookie_ip_map: Option<(String, String)>,
    headers: HashMap<HeaderType, Vec<SipHeader>>,
    headers_end: usize,
    operations: Vec<Operation>,
    affinity: Vec<AffinityEntry>,
    affinity_cursor: usize,
    stop_load_balance: bool,
}

impl MessageMetadata {
    pub fn new(raw_msg: Bytes, msg_type: MsgType, method_type: MethodType) -> Self {
        let headers_end = raw_msg.len();
        Self {
            raw_msg,
            msg_type,
            method_type,
            resp_method_type: None,
            status_code: None,
            transaction_id: None,
            destination: None,
            opaque: None,
            p_cookie_ip_map: None,
            headers: HashMap::new(),
            headers_end,
            operations: Vec::new(),
            affinity: Vec::new(),
            affinity_cursor: 0,
            stop_load_balance: false,
        }
    }

    pub fn into_ref(self) -> MessageMetadataRef {
        Rc::new(RefCell::new(self))
    }

    pub fn raw_msg(&self) -> &Bytes {
        &self.raw_msg
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn set_method_type(&mut self, method_type: MethodType) {
        self.method_type = method_type;
    }

    /// Method named in the CSeq of a response.
    pub fn resp_method_type(&self) -> Option<MethodType> {
        self.resp_method_type
    }

    pub fn set_resp_method_type(&mut self, method_type: MethodType) {
        self.resp_method_type = Some(method_type);
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = Some(code);
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn set_transaction_id(&mut self, transaction_id: impl Into<String>) {
        self.transaction_id = Some(transaction_id.into());
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn reset_destination(&mut self) {
        self.destination = None;
    }

    /// Opaque value of a REGISTER's Authorization header.
    pub fn opaque(&self) -> Option<&str> {
        self.opaque.as_deref()
    }

    pub fn set_opaque(&mut self, opaque: impl Into<String>) {
        self.opaque = Some(opaque.into());
    }

    /// `(cookie, ip)` from `P-Nokia-Cookie-IP-Mapping: <cookie>=<ip>`.
    pub fn p_cookie_ip_map(&self) -> Option<(&str, &str)> {
        self.p_cookie_ip_map
            .as_ref()
            .map(|(cookie, ip)| (cookie.as_str(), ip.as_str()))
    }

    pub fn set_p_cookie_ip_map(&mut self, cookie: impl Into<String>, ip: impl Into<String>) {
        self.p_cookie_ip_map = Some((cookie.into(), ip.into()));
    }

    // --- Headers ---

    pub fn add_header(&mut self, header: SipHeader) {
        self.headers
            .entry(header.header_type())
            .or_default()
            .push(header);
    }

    /// First occurrence of a header type.
    pub fn header(&self, header_type: HeaderType) -> Option<&SipHeader> {
        self.list_header(header_type).first()
    }

    pub fn list_header(&self, header_type: HeaderType) -> &[SipHeader] {
        self.headers
            .get(&header_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop every occurrence of a header type, returning what was removed.
    pub fn remove_headers(&mut self, header_type: HeaderType) -> Vec<SipHeader> {
        self.headers.remove(&header_type).unwrap_or_default()
    }

    /// Offset of the blank line that terminates the header block.
    pub fn headers_end(&self) -> usize {
        self.headers_end
    }

    pub fn set_headers_end(&mut self, offset: usize) {
        self.headers_end = offset;
    }

    // --- Operations ---

    pub fn operation_list(&self) -> &[Operation] {
        &self.operations
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    // --- Affinity ---

    pub fn affinity(&self) -> &[AffinityEntry] {
        &self.affinity
    }

    pub fn add_affinity(&mut self, entry: AffinityEntry) {
        self.affinity.push(entry);
    }

    pub fn clear_affinity(&mut self) {
        self.affinity.clear();
        self.affinity_cursor = 0;
    }

    pub fn reset_affinity_iteration(&mut self) {
        self.affinity_cursor = 0;
    }

    /// Candidate under the cursor, `None` once exhausted.
    pub fn affinity_iteration(&self) -> Option<&AffinityEntry> {
        self.affinity.get(self.affinity_cursor)
    }

    /// Advance the cursor and return the new candidate.
    pub fn next_affinity_iteration(&mut self) -> Option<&AffinityEntry> {
        if self.affinity_cursor < self.affinity.len() {
            self.affinity_cursor += 1;
        }
        self.affinity_iteration()
    }

    pub fn affinity_exhausted(&self) -> bool {
        self.affinity_cursor >= self.affinity.len()
    }

    pub fn stop_load_balance(&self) -> bool {
        self.stop_load_balance
    }

    pub fn set_stop_load_balance(&mut self, stop_load_balance: bool) {
        self.stop_load_balance = stop_load_balance;
    }
}
