//! SIP message model and codec.
//!
//! # Data Flow
//! ```text
//! Downstream/upstream bytes
//!     → decoder.rs (frame on Content-Length, parse start line + headers)
//!     → metadata.rs (MessageMetadata: headers, transaction id, affinity)
//!     → router records Operation edits (operation.rs)
//!     → encoder.rs (apply edits in one pass, emit bytes)
//!
//! Rejections generated by the proxy itself:
//!     → reply.rs (status line + dialog headers + Reason)
//! ```
//!
//! # Design Decisions
//! - Raw bytes are never edited in place; edits are recorded as offsets
//! - Message and method kinds are closed enums
//! - Only the headers routing needs are classified; the rest pass through

pub mod decoder;
pub mod encoder;
pub mod header;
pub mod metadata;
pub mod operation;
pub mod reply;

pub use header::{HeaderType, SipHeader};
pub use metadata::{AffinityEntry, MessageMetadata, MessageMetadataRef};
pub use operation::{Operation, OperationType};

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Request,
    Response,
}

/// SIP method, or `Ok200` for a 200 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Invite,
    Cancel,
    Register,
    Refer,
    Update,
    Subscribe,
    Notify,
    Ack,
    Bye,
    Options,
    Prack,
    Info,
    Message,
    Publish,
    Ok200,
    NullMethod,
}

impl MethodType {
    /// Parse a request method token. Unknown tokens map to `NullMethod`.
    pub fn from_token(token: &str) -> Self {
        match token {
            "INVITE" => MethodType::Invite,
            "CANCEL" => MethodType::Cancel,
            "REGISTER" => MethodType::Register,
            "REFER" => MethodType::Refer,
            "UPDATE" => MethodType::Update,
            "SUBSCRIBE" => MethodType::Subscribe,
            "NOTIFY" => MethodType::Notify,
            "ACK" => MethodType::Ack,
            "BYE" => MethodType::Bye,
            "OPTIONS" => MethodType::Options,
            "PRACK" => MethodType::Prack,
            "INFO" => MethodType::Info,
            "MESSAGE" => MethodType::Message,
            "PUBLISH" => MethodType::Publish,
            _ => MethodType::NullMethod,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::Invite => "INVITE",
            MethodType::Cancel => "CANCEL",
            MethodType::Register => "REGISTER",
            MethodType::Refer => "REFER",
            MethodType::Update => "UPDATE",
            MethodType::Subscribe => "SUBSCRIBE",
            MethodType::Notify => "NOTIFY",
            MethodType::Ack => "ACK",
            MethodType::Bye => "BYE",
            MethodType::Options => "OPTIONS",
            MethodType::Prack => "PRACK",
            MethodType::Info => "INFO",
            MethodType::Message => "MESSAGE",
            MethodType::Publish => "PUBLISH",
            MethodType::Ok200 => "OK200",
            MethodType::NullMethod => "NULL",
        }
    }
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
