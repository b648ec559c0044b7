//! Weft wire schema
//!
//! Every request, reply and publication exchanged between nodes is one
//! of these prost messages, encoded with `Message::encode_to_vec` and
//! length-delimited by the transport. The structs are written by hand
//! against the prost derive macros; the wire format is ordinary
//! protobuf, so any schema-driven decoder can interoperate.

pub mod convert;

use std::collections::HashMap;

/// Key marker for adjacency announcements: `adj:<node>`.
pub const ADJACENCY_MARKER: &str = "adj:";
/// Key marker for prefix announcements: `prefix:<node>`.
pub const PREFIX_MARKER: &str = "prefix:";

/// One versioned record on the wire. Mirror of `weft_model::Value`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(string, tag = "2")]
    pub originator_id: String,
    /// Absent for TTL-only refreshes and hash summaries.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub value: Option<Vec<u8>>,
    #[prost(int64, tag = "4")]
    pub ttl_ms: i64,
    #[prost(uint64, tag = "5")]
    pub ttl_version: u64,
    #[prost(uint64, tag = "6")]
    pub hash: u64,
}

/// A set of changed records, flooded peer-to-peer and delivered to
/// subscribers.
///
/// `node_ids` accumulates the nodes a publication has visited;
/// `originator` is the node that first flooded it. Both exist only for
/// loop suppression — the records themselves keep their original
/// `version`/`originator_id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publication {
    #[prost(map = "string, message", tag = "1")]
    pub key_vals: HashMap<String, Value>,
    /// Keys removed by TTL expiry or explicit deletion.
    #[prost(string, repeated, tag = "2")]
    pub expired_keys: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub node_ids: Vec<String>,
    #[prost(string, optional, tag = "4")]
    pub originator: Option<String>,
}

/// Publish and command endpoints of one peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerSpec {
    #[prost(string, tag = "1")]
    pub pub_url: String,
    #[prost(string, tag = "2")]
    pub cmd_url: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeySetRequest {
    #[prost(map = "string, message", tag = "1")]
    pub key_vals: HashMap<String, Value>,
    /// Nodes the update has already visited (seed of the flood list).
    #[prost(string, repeated, tag = "2")]
    pub node_ids: Vec<String>,
    /// Install records verbatim, bypassing merge comparison.
    #[prost(bool, tag = "3")]
    pub force: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyGetRequest {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
}

/// Empty prefix dumps the whole store.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyDumpRequest {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashDumpRequest {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

/// Carries the caller's hash summaries; the responder returns records
/// the caller is missing or holds stale.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DumpDiffRequest {
    #[prost(map = "string, message", tag = "1")]
    pub summaries: HashMap<String, Value>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerAddRequest {
    #[prost(map = "string, message", tag = "1")]
    pub peers: HashMap<String, PeerSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerDelRequest {
    #[prost(string, repeated, tag = "1")]
    pub peer_names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerDumpRequest {}

/// Envelope for every store command.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Command", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub command: Option<request::Command>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        #[prost(message, tag = "1")]
        KeySet(super::KeySetRequest),
        #[prost(message, tag = "2")]
        KeyGet(super::KeyGetRequest),
        #[prost(message, tag = "3")]
        KeyDump(super::KeyDumpRequest),
        #[prost(message, tag = "4")]
        HashDump(super::HashDumpRequest),
        #[prost(message, tag = "5")]
        DumpDiff(super::DumpDiffRequest),
        #[prost(message, tag = "6")]
        PeerAdd(super::PeerAddRequest),
        #[prost(message, tag = "7")]
        PeerDel(super::PeerDelRequest),
        #[prost(message, tag = "8")]
        PeerDump(super::PeerDumpRequest),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    BadRequest = 1,
    NotFound = 2,
    Internal = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerCmdReply {
    #[prost(map = "string, message", tag = "1")]
    pub peers: HashMap<String, PeerSpec>,
}

/// Envelope for every store reply. Exactly one payload field is set
/// when `code` is `Ok`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(message, optional, tag = "2")]
    pub publication: Option<Publication>,
    #[prost(message, optional, tag = "3")]
    pub peers: Option<PeerCmdReply>,
    #[prost(string, tag = "4")]
    pub message: String,
}

/// Per-node adjacency announcement published into the store under the
/// adjacency marker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdjacencyDatabase {
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    #[prost(string, repeated, tag = "2")]
    pub neighbors: Vec<String>,
}

/// Per-node prefix announcement, prefixes in CIDR text form.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrefixDatabase {
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    #[prost(string, repeated, tag = "2")]
    pub prefixes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthCheckerMessageType {
    Unknown = 0,
    Ping = 1,
    Ack = 2,
}

/// One health-check datagram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckerMessage {
    #[prost(string, tag = "1")]
    pub from_node_name: String,
    #[prost(enumeration = "HealthCheckerMessageType", tag = "2")]
    pub msg_type: i32,
    #[prost(int64, tag = "3")]
    pub seq_num: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthCheckerCmd {
    Unknown = 0,
    Peek = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckerRequest {
    #[prost(enumeration = "HealthCheckerCmd", tag = "1")]
    pub cmd: i32,
}

/// Ping bookkeeping for one remote node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeHealthInfo {
    #[prost(string, repeated, tag = "1")]
    pub neighbors: Vec<String>,
    /// Chosen IPv6 ping target in text form; empty when none is known.
    #[prost(string, tag = "2")]
    pub ip_address: String,
    #[prost(int64, tag = "3")]
    pub last_val_sent: i64,
    #[prost(int64, tag = "4")]
    pub last_ack_from_node: i64,
    #[prost(int64, tag = "5")]
    pub last_ack_to_node: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckerPeekReply {
    #[prost(map = "string, message", tag = "1")]
    pub node_info: HashMap<String, NodeHealthInfo>,
}

impl Request {
    pub fn key_set(req: KeySetRequest) -> Self {
        Self {
            command: Some(request::Command::KeySet(req)),
        }
    }

    pub fn key_get(keys: Vec<String>) -> Self {
        Self {
            command: Some(request::Command::KeyGet(KeyGetRequest { keys })),
        }
    }

    pub fn key_dump(prefix: impl Into<String>) -> Self {
        Self {
            command: Some(request::Command::KeyDump(KeyDumpRequest {
                prefix: prefix.into(),
            })),
        }
    }

    pub fn hash_dump(prefix: impl Into<String>) -> Self {
        Self {
            command: Some(request::Command::HashDump(HashDumpRequest {
                prefix: prefix.into(),
            })),
        }
    }

    pub fn dump_diff(summaries: HashMap<String, Value>) -> Self {
        Self {
            command: Some(request::Command::DumpDiff(DumpDiffRequest { summaries })),
        }
    }
}

impl Reply {
    pub fn publication(publication: Publication) -> Self {
        Self {
            code: ErrorCode::Ok as i32,
            publication: Some(publication),
            peers: None,
            message: String::new(),
        }
    }

    pub fn peers(peers: HashMap<String, PeerSpec>) -> Self {
        Self {
            code: ErrorCode::Ok as i32,
            publication: None,
            peers: Some(PeerCmdReply { peers }),
            message: String::new(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            publication: None,
            peers: None,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok as i32
    }
}
