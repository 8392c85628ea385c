//! Message Codec Bridge: a thin adapter over `coap_lite`'s packet codec.
//!
//! Builds and parses CoAP messages with typed URI paths, query options,
//! and binary payloads, so the rest of the engine never touches
//! `coap_lite` types directly.

pub mod codes;

use bytes::Bytes;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet as RawPacket, RequestType};

use crate::error::{Error, Result};

/// A `class.detail` CoAP code, e.g. `2.05` or `4.04`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode(pub u8, pub u8);

impl CoapCode {
    pub const EMPTY: Self = Self(0, 0);
    pub const GET: Self = Self(0, 1);
    pub const POST: Self = Self(0, 2);
    pub const PUT: Self = Self(0, 3);
    pub const DELETE: Self = Self(0, 4);

    pub const CREATED: Self = Self(2, 1);
    pub const CHANGED: Self = Self(2, 4);
    pub const CONTENT: Self = Self(2, 5);

    pub const BAD_REQUEST: Self = Self(4, 0);
    pub const FORBIDDEN: Self = Self(4, 3);
    pub const NOT_FOUND: Self = Self(4, 4);
    pub const INTERNAL_SERVER_ERROR: Self = Self(5, 0);
    pub const SERVICE_UNAVAILABLE: Self = Self(5, 3);

    pub fn as_byte(&self) -> u8 {
        (self.0 << 5) | self.1
    }

    pub fn is_request(&self) -> bool {
        self.0 == 0 && self.1 != 0
    }

    pub fn is_success(&self) -> bool {
        self.0 == 2
    }

    pub fn is_error(&self) -> bool {
        self.0 == 4 || self.0 == 5
    }

    /// `code < 4.00`, the match predicate spec.md §4.3 uses for a
    /// msgId-filtered waiter.
    pub fn is_success_class(&self) -> bool {
        self.0 < 4
    }

    fn to_message_class(self) -> MessageClass {
        if self == Self::EMPTY {
            return MessageClass::Empty;
        }
        if self.0 == 0 {
            let rt = match self.1 {
                1 => RequestType::Get,
                2 => RequestType::Post,
                3 => RequestType::Put,
                4 => RequestType::Delete,
                other => RequestType::UnKnown(other),
            };
            return MessageClass::Request(rt);
        }
        use coap_lite::ResponseType::*;
        let rt = match (self.0, self.1) {
            (2, 1) => Created,
            (2, 2) => Deleted,
            (2, 3) => Valid,
            (2, 4) => Changed,
            (2, 5) => Content,
            (4, 0) => BadRequest,
            (4, 1) => Unauthorized,
            (4, 2) => BadOption,
            (4, 3) => Forbidden,
            (4, 4) => NotFound,
            (4, 5) => MethodNotAllowed,
            (4, 6) => NotAcceptable,
            (4, 9) => Conflict,
            (4, 12) => PreconditionFailed,
            (4, 13) => RequestEntityTooLarge,
            (4, 15) => UnsupportedContentFormat,
            (5, 0) => InternalServerError,
            (5, 1) => NotImplemented,
            (5, 2) => BadGateway,
            (5, 3) => ServiceUnavailable,
            (5, 4) => GatewayTimeout,
            (class, detail) => UnKnown((class << 5) | detail),
        };
        MessageClass::Response(rt)
    }

    fn from_message_class(class: MessageClass) -> Self {
        use coap_lite::ResponseType::*;
        match class {
            MessageClass::Empty => Self::EMPTY,
            MessageClass::Request(RequestType::Get) => Self::GET,
            MessageClass::Request(RequestType::Post) => Self::POST,
            MessageClass::Request(RequestType::Put) => Self::PUT,
            MessageClass::Request(RequestType::Delete) => Self::DELETE,
            MessageClass::Request(RequestType::UnKnown(n)) => Self(0, n),
            MessageClass::Request(_) => Self(0, 0),
            MessageClass::Response(rt) => match rt {
                Created => Self(2, 1),
                Deleted => Self(2, 2),
                Valid => Self(2, 3),
                Changed => Self(2, 4),
                Content => Self(2, 5),
                BadRequest => Self(4, 0),
                Unauthorized => Self(4, 1),
                BadOption => Self(4, 2),
                Forbidden => Self(4, 3),
                NotFound => Self(4, 4),
                MethodNotAllowed => Self(4, 5),
                NotAcceptable => Self(4, 6),
                Conflict => Self(4, 9),
                PreconditionFailed => Self(4, 12),
                RequestEntityTooLarge => Self(4, 13),
                UnsupportedContentFormat => Self(4, 15),
                InternalServerError => Self(5, 0),
                NotImplemented => Self(5, 1),
                BadGateway => Self(5, 2),
                ServiceUnavailable => Self(5, 3),
                GatewayTimeout => Self(5, 4),
                UnKnown(byte) => Self(byte >> 5, byte & 0x1f),
                _ => Self(5, 0),
            },
            MessageClass::Reserved(n) => Self(n >> 5, n & 0x1f),
        }
    }
}

impl std::fmt::Display for CoapCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0, self.1)
    }
}

/// Confirmability of an outbound/inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmability {
    Confirmable,
    NonConfirmable,
    Ack,
    Reset,
}

impl Confirmability {
    fn to_message_type(self) -> MessageType {
        match self {
            Confirmability::Confirmable => MessageType::Confirmable,
            Confirmability::NonConfirmable => MessageType::NonConfirmable,
            Confirmability::Ack => MessageType::Acknowledgement,
            Confirmability::Reset => MessageType::Reset,
        }
    }

    fn from_message_type(ty: MessageType) -> Self {
        match ty {
            MessageType::Confirmable => Confirmability::Confirmable,
            MessageType::NonConfirmable => Confirmability::NonConfirmable,
            MessageType::Acknowledgement => Confirmability::Ack,
            MessageType::Reset => Confirmability::Reset,
        }
    }
}

/// A decoded/to-be-encoded CoAP frame, carrying exactly the fields the
/// session engine needs: no block-wise transfer, no observe option, no
/// address — those are either unused by this protocol or handled a layer
/// up (the OTA engine does its own chunking).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: Confirmability,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub uri_path: Vec<String>,
    pub uri_query: Vec<String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: Confirmability, code: CoapCode, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            uri_path: Vec::new(),
            uri_query: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_path(mut self, path: &[&str]) -> Self {
        self.uri_path = path.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_query(mut self, query: Vec<String>) -> Self {
        self.uri_query = query;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn is_confirmable(&self) -> bool {
        self.kind == Confirmability::Confirmable
    }

    pub fn kind_is_ack(&self) -> bool {
        self.kind == Confirmability::Ack
    }

    /// First Uri-Path segment, used by the RPC dispatcher to route.
    pub fn first_path_segment(&self) -> Option<&str> {
        self.uri_path.first().map(|s| s.as_str())
    }

    /// The remainder of the Uri-Path after the first segment, joined with
    /// `/` (used for function/variable names that may contain slashes).
    pub fn path_remainder(&self) -> String {
        self.uri_path.get(1..).unwrap_or(&[]).join("/")
    }

    /// Build an empty acknowledgement echoing this frame's message id,
    /// per the CoAP ping reply in spec.md §4.3.
    pub fn empty_ack(&self) -> Frame {
        Frame::new(Confirmability::Ack, CoapCode::EMPTY, self.message_id)
    }

    /// Build a response to this frame reusing its message id (an ACK
    /// piggybacking a response, spec.md §4.3/§4.4) and echoing its token.
    pub fn respond(&self, code: CoapCode, payload: impl Into<Bytes>) -> Frame {
        Frame::new(Confirmability::Ack, code, self.message_id)
            .with_token(self.token.clone())
            .with_payload(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = RawPacket::new();
        raw.header.set_type(self.kind.to_message_type());
        raw.header.code = self.code.to_message_class();
        raw.header.message_id = self.message_id;
        raw.set_token(self.token.clone());
        for seg in &self.uri_path {
            raw.add_option(CoapOption::UriPath, seg.clone().into_bytes());
        }
        for q in &self.uri_query {
            raw.add_option(CoapOption::UriQuery, q.clone().into_bytes());
        }
        raw.payload = self.payload.to_vec();
        raw.to_bytes()
            .map_err(|e| Error::Codec(format!("failed to encode CoAP frame: {e:?}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let raw = RawPacket::from_bytes(bytes)
            .map_err(|e| Error::Codec(format!("failed to decode CoAP frame: {e:?}")))?;
        let kind = Confirmability::from_message_type(raw.header.get_type());
        let code = CoapCode::from_message_class(raw.header.code);
        let uri_path = raw
            .get_option(CoapOption::UriPath)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).to_string())
                    .collect()
            })
            .unwrap_or_default();
        let uri_query = raw
            .get_option(CoapOption::UriQuery)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Frame {
            kind,
            code,
            message_id: raw.header.message_id,
            token: raw.get_token().clone(),
            uri_path,
            uri_query,
            payload: Bytes::from(raw.payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        // S2: inbound {confirmable, code=0.00, msgId=7, empty}.
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::EMPTY, 7);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, Confirmability::Confirmable);
        assert_eq!(decoded.code, CoapCode::EMPTY);
        assert_eq!(decoded.message_id, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn function_call_round_trips_path_and_query() {
        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, 1)
            .with_token(vec![0xAB])
            .with_path(&[codes::FUNCTION, "add"])
            .with_query(vec!["1,2".to_string(), "caller".to_string()]);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.uri_path, vec!["f", "add"]);
        assert_eq!(decoded.uri_query, vec!["1,2", "caller"]);
        assert_eq!(decoded.token, vec![0xAB]);
        assert_eq!(decoded.first_path_segment(), Some("f"));
        assert_eq!(decoded.path_remainder(), "add");
    }

    #[test]
    fn empty_ack_echoes_message_id() {
        let inbound = Frame::new(Confirmability::Confirmable, CoapCode::EMPTY, 42);
        let ack = inbound.empty_ack();
        assert_eq!(ack.kind, Confirmability::Ack);
        assert_eq!(ack.message_id, 42);
        assert_eq!(ack.code, CoapCode::EMPTY);
    }

    #[test]
    fn response_reuses_message_id_and_token() {
        let inbound = Frame::new(Confirmability::Confirmable, CoapCode::POST, 100)
            .with_token(vec![1, 2, 3]);
        let reply = inbound.respond(CoapCode::CHANGED, Bytes::from_static(&[0, 0, 0, 42]));
        assert_eq!(reply.message_id, 100);
        assert_eq!(reply.token, vec![1, 2, 3]);
        assert_eq!(reply.code, CoapCode::CHANGED);
    }

    #[test]
    fn reserved_prefix_detection() {
        assert!(codes::has_reserved_prefix("iotready/device/reset"));
        assert!(codes::has_reserved_prefix("trackle/something"));
        assert!(!codes::has_reserved_prefix("a/b/c"));
    }
}
