//! Protocol buffer message definitions
//!
//! These are manually defined prost messages so that no protoc is needed at
//! build time. Field tags are part of the wire contract and must not be reused.

use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Envelope wrapping every peer-to-peer message
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Correlation ID shared by a request and its reply
    #[prost(uint64, tag = "2")]
    pub id: u64,
    /// Set on replies
    #[prost(bool, tag = "3")]
    pub reply: bool,
    /// Address and identifier of the sending node
    #[prost(message, optional, tag = "4")]
    pub sender: Option<NodeAddr>,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    Ping(Ping),
    #[prost(message, tag = "11")]
    LookupRequest(LookupRequest),
    #[prost(message, tag = "12")]
    LookupReply(LookupReply),
    #[prost(message, tag = "13")]
    AllocationRequest(AllocationRequest),
    #[prost(message, tag = "14")]
    AllocationReply(AllocationReply),
    #[prost(message, tag = "15")]
    FetchRequest(FetchRequest),
    #[prost(message, tag = "16")]
    FetchReply(FetchReply),
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeAddr {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(bytes, tag = "2")]
    pub node_id: Vec<u8>,
}

// DHT messages

/// Liveness check, answered with another `Ping` carrying the reply flag
#[derive(Clone, PartialEq, Message)]
pub struct Ping {}

#[derive(Clone, PartialEq, Message)]
pub struct LookupRequest {
    #[prost(bytes, tag = "1")]
    pub target: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LookupReply {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeAddr>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AllocationRequest {
    #[prost(message, optional, tag = "1")]
    pub account: Option<AccountNetwork>,
    #[prost(uint32, tag = "2")]
    pub replication: u32,
    /// Replica slot this request fills, in `0..replication`
    #[prost(uint32, tag = "3")]
    pub index: u32,
}

/// Empty `error` means the allocation was accepted
#[derive(Clone, PartialEq, Message)]
pub struct AllocationReply {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FetchRequest {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FetchReply {
    #[prost(message, optional, tag = "1")]
    pub account: Option<AccountNetwork>,
}

// Account records

/// Wire form of an account: logins travel as a list ordered by login ID
#[derive(Clone, PartialEq, Message)]
pub struct AccountNetwork {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub version: u64,
    /// Encrypted key material and metadata, opaque to nodes
    #[prost(bytes, tag = "4")]
    pub keys: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    pub logins: Vec<LoginNetwork>,
    #[prost(bytes, tag = "6")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LoginNetwork {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub service: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub credentials: Vec<u8>,
}

// Client messages

#[derive(Clone, PartialEq, Message)]
pub struct ClientMessage {
    #[prost(oneof = "ClientRequest", tags = "1, 2")]
    pub request: Option<ClientRequest>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ClientRequest {
    /// Store or update an account
    #[prost(message, tag = "1")]
    Push(AccountNetwork),
    /// Retrieve the account stored under this hash
    #[prost(bytes, tag = "2")]
    Pull(Vec<u8>),
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerResponse {
    /// One of [`status::OK`], [`status::WARNING`], [`status::ERROR`]
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(message, optional, tag = "2")]
    pub data: Option<AccountNetwork>,
    #[prost(string, optional, tag = "3")]
    pub debug: Option<String>,
}

/// Status strings of [`ServerResponse`]
pub mod status {
    pub const OK: &str = "ok";
    pub const WARNING: &str = "warning";
    pub const ERROR: &str = "error";
}

// Helper implementations

impl Envelope {
    /// Create a request envelope; the correlation ID is assigned on send
    pub fn request(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: 0,
            reply: false,
            sender: None,
            payload: Some(payload),
        }
    }

    /// Create the reply to the request with the given correlation ID
    pub fn reply(id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            reply: true,
            sender: None,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Length of the encoded envelope
    pub fn encoded_size(&self) -> usize {
        self.encoded_len()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }

    /// Name of the payload kind, for logging
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Some(Payload::Ping(_)) => "ping",
            Some(Payload::LookupRequest(_)) => "lookup-request",
            Some(Payload::LookupReply(_)) => "lookup-reply",
            Some(Payload::AllocationRequest(_)) => "allocation-request",
            Some(Payload::AllocationReply(_)) => "allocation-reply",
            Some(Payload::FetchRequest(_)) => "fetch-request",
            Some(Payload::FetchReply(_)) => "fetch-reply",
            None => "empty",
        }
    }
}

impl ClientMessage {
    pub fn push(account: AccountNetwork) -> Self {
        Self {
            request: Some(ClientRequest::Push(account)),
        }
    }

    pub fn pull(id: &crate::Hash) -> Self {
        Self {
            request: Some(ClientRequest::Pull(id.to_vec())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }
}

impl ServerResponse {
    pub fn ok(data: Option<AccountNetwork>) -> Self {
        Self {
            status: status::OK.to_string(),
            data,
            debug: None,
        }
    }

    pub fn warning(debug: impl Into<String>) -> Self {
        Self {
            status: status::WARNING.to_string(),
            data: None,
            debug: Some(debug.into()),
        }
    }

    pub fn error(debug: impl Into<String>) -> Self {
        Self {
            status: status::ERROR.to_string(),
            data: None,
            debug: Some(debug.into()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let mut original = Envelope::request(Payload::LookupRequest(LookupRequest {
            target: vec![7u8; 32],
        }));
        original.id = 42;
        original.sender = Some(NodeAddr {
            address: "127.0.0.1:5000".to_string(),
            node_id: vec![1u8; 32],
        });

        let decoded = Envelope::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.kind(), "lookup-request");
        assert!(!decoded.reply);
    }

    #[test]
    fn test_optional_fields_survive_encoding() {
        let empty = Envelope::reply(9, Payload::FetchReply(FetchReply { account: None }));
        let decoded = Envelope::from_bytes(&empty.to_bytes()).unwrap();
        assert!(decoded.reply);
        assert!(decoded.sender.is_none());
        assert_eq!(decoded.payload, Some(Payload::FetchReply(FetchReply { account: None })));

        let ping = Envelope::request(Payload::Ping(Ping {}));
        let decoded = Envelope::from_bytes(&ping.to_bytes()).unwrap();
        assert_eq!(decoded.kind(), "ping");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = Envelope::request(Payload::Ping(Ping {}));
        envelope.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Envelope::from_bytes(&envelope.to_bytes()),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(Envelope::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_server_response_debug_is_optional() {
        let ok = ServerResponse::ok(None);
        let decoded = ServerResponse::from_bytes(&ok.to_bytes()).unwrap();
        assert_eq!(decoded.status, status::OK);
        assert!(decoded.debug.is_none());

        let warn = ServerResponse::warning("only 1/3 replicas");
        let decoded = ServerResponse::from_bytes(&warn.to_bytes()).unwrap();
        assert_eq!(decoded.debug.as_deref(), Some("only 1/3 replicas"));
    }
}
