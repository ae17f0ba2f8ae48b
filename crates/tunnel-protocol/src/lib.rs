//! Wire protocol for the reverse tunnel control channel.
//!
//! Binary messages on the control channel carry exactly one [`RequestFrame`]
//! (server -> client) or [`ResponseFrame`] (client -> server), encoded as a
//! MessagePack map (field names preserved) via `rmp-serde`. Text messages on
//! the same channel are never frames -- they are the literal strings
//! `"ping"` / `"pong"` handled by the liveness layer, see [`LIVENESS_PING`]
//! and [`LIVENESS_PONG`].
//!
//! The decoder is deliberately permissive: a message that fails to decode,
//! or whose `type`/`requestId` fields are missing, is not an error to the
//! caller -- it is dropped. This is protocol-skew tolerance (see spec
//! design notes): unknown or malformed frames never tear down the
//! connection.

use serde::{Deserialize, Serialize};

/// Header list as transmitted on the wire: an ordered list of (name, value)
/// pairs, matching HTTP's repeated-header semantics (unlike a map).
pub type HeaderList = Vec<(String, String)>;

/// The two liveness text messages. Never encoded as frames.
pub const LIVENESS_PING: &str = "ping";
pub const LIVENESS_PONG: &str = "pong";

// ---------------------------------------------------------------------------
// Server -> Client frames ("request" direction)
// ---------------------------------------------------------------------------

/// A frame sent by the server to a client, carrying one public request.
///
/// `type` disambiguates the shape on the wire; see spec §6.1. The round
/// trip `decode(encode(f)) == f` must hold for every variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestFrame {
    /// Streaming request header. `eof = true` means the request has no body.
    Header {
        #[serde(rename = "requestId")]
        request_id: String,
        method: String,
        path: String,
        headers: HeaderList,
        eof: bool,
    },
    /// One chunk of a streaming request body. `eof = true` is the terminal
    /// frame for this request id and carries no further `data`.
    Body {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(with = "serde_bytes", default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
        eof: bool,
    },
    /// A fully-buffered request, sent instead of `Header`/`Body` when
    /// `BUFFER_REQUEST` is enabled.
    #[serde(rename = "request")]
    Buffered {
        #[serde(rename = "requestId")]
        request_id: String,
        method: String,
        path: String,
        headers: HeaderList,
        #[serde(with = "serde_bytes", default, skip_serializing_if = "Option::is_none")]
        body: Option<Vec<u8>>,
    },
    /// Tells the client to cancel the in-flight local request, if any.
    Abort {
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

impl RequestFrame {
    /// The `requestId` every variant carries.
    pub fn request_id(&self) -> &str {
        match self {
            RequestFrame::Header { request_id, .. }
            | RequestFrame::Body { request_id, .. }
            | RequestFrame::Buffered { request_id, .. }
            | RequestFrame::Abort { request_id } => request_id,
        }
    }

    /// Encode as a MessagePack map, field names preserved.
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).expect("RequestFrame always serializes")
    }

    /// Decode a binary control-channel message. Returns `None` (never an
    /// error) for anything that isn't a well-formed, known frame shape --
    /// per spec §4.1, malformed frames are silently dropped.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        rmp_serde::from_slice(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Client -> Server frames ("response" direction)
// ---------------------------------------------------------------------------

/// A frame sent by a client back to the server, carrying one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseFrame {
    /// Response headers. `eof = true` means the response has no body.
    Header {
        #[serde(rename = "requestId")]
        request_id: String,
        status: u16,
        #[serde(rename = "statusText")]
        status_text: String,
        headers: HeaderList,
        eof: bool,
    },
    /// One chunk of a streaming response body; terminal frame has
    /// `eof = true` and no `data`.
    Body {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(with = "serde_bytes", default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
        eof: bool,
    },
}

impl ResponseFrame {
    pub fn request_id(&self) -> &str {
        match self {
            ResponseFrame::Header { request_id, .. } | ResponseFrame::Body { request_id, .. } => {
                request_id
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).expect("ResponseFrame always serializes")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        rmp_serde::from_slice(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// WebSocket tunnel handshake (the dedicated /__ws__ inbound leg, spec §4.8)
// ---------------------------------------------------------------------------

/// Query parameters the client attaches when opening the second,
/// server-bound WebSocket for a tunnelled WS session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsTunnelHandshake {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_request(f: RequestFrame) {
        let bytes = f.encode();
        let decoded = RequestFrame::decode(&bytes).expect("decodes");
        assert_eq!(decoded, f);
    }

    fn round_trip_response(f: ResponseFrame) {
        let bytes = f.encode();
        let decoded = ResponseFrame::decode(&bytes).expect("decodes");
        assert_eq!(decoded, f);
    }

    #[test]
    fn request_header_round_trips() {
        round_trip_request(RequestFrame::Header {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/x?y=1".into(),
            headers: vec![("host".into(), "example.com".into())],
            eof: true,
        });
    }

    #[test]
    fn request_body_round_trips_with_and_without_data() {
        round_trip_request(RequestFrame::Body {
            request_id: "r1".into(),
            data: Some(b"AB".to_vec()),
            eof: false,
        });
        round_trip_request(RequestFrame::Body {
            request_id: "r1".into(),
            data: None,
            eof: true,
        });
    }

    #[test]
    fn buffered_request_round_trips() {
        round_trip_request(RequestFrame::Buffered {
            request_id: "r2".into(),
            method: "POST".into(),
            path: "/u".into(),
            headers: vec![],
            body: Some(b"ABCD".to_vec()),
        });
    }

    #[test]
    fn abort_round_trips() {
        round_trip_request(RequestFrame::Abort {
            request_id: "r3".into(),
        });
    }

    #[test]
    fn response_header_round_trips() {
        round_trip_response(ResponseFrame::Header {
            request_id: "r1".into(),
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            eof: false,
        });
    }

    #[test]
    fn response_body_round_trips() {
        round_trip_response(ResponseFrame::Body {
            request_id: "r1".into(),
            data: Some(b"hi".to_vec()),
            eof: false,
        });
        round_trip_response(ResponseFrame::Body {
            request_id: "r1".into(),
            data: None,
            eof: true,
        });
    }

    #[test]
    fn decode_rejects_missing_type() {
        let mut buf = Vec::new();
        let mut ser = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        serde::Serialize::serialize(
            &std::collections::BTreeMap::from([("requestId", "r1")]),
            &mut ser,
        )
        .unwrap();
        assert!(RequestFrame::decode(&buf).is_none());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = Vec::new();
        let mut ser = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        serde::Serialize::serialize(
            &std::collections::BTreeMap::from([
                ("type", "nonsense"),
                ("requestId", "r1"),
            ]),
            &mut ser,
        )
        .unwrap();
        assert!(RequestFrame::decode(&buf).is_none());
    }

    #[test]
    fn request_id_accessor_matches_every_variant() {
        let h = RequestFrame::Header {
            request_id: "x".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: vec![],
            eof: true,
        };
        assert_eq!(h.request_id(), "x");
        let a = RequestFrame::Abort {
            request_id: "y".into(),
        };
        assert_eq!(a.request_id(), "y");
    }
}
