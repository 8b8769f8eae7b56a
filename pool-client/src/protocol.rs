//! Wire messages exchanged with validator nodes
//!
//! Every message is one JSON object tagged by `type`. Framing lives in
//! [`crate::network::transport`].

use crate::crypto::{hex_bytes, Hash};
use crate::types::{MultiSignature, PoolTransaction, Reply, Request};
use crate::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Multi-signed statement about the pool ledger at `seq_no_end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyProof {
    /// Last sequence number covered
    pub seq_no_end: u64,
    /// Pool ledger root after `seq_no_end`
    #[serde(with = "hex_bytes")]
    pub pool_root: Hash,
    /// Validator signatures over the pool ledger digest
    pub multi_signature: MultiSignature,
}

/// Protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client request
    Request(Request),

    /// Successful node reply
    Reply(Reply),

    /// Request refused before processing (bad signature, unknown operation)
    Nack {
        /// Refused request
        request_id: Uuid,
        /// Refusal reason
        reason: String,
    },

    /// Request processed and rejected (business rule)
    Reject {
        /// Rejected request
        request_id: Uuid,
        /// Rejection reason
        reason: String,
    },

    /// Ask for pool transactions `start..=end`
    CatchupRequest {
        /// First sequence number wanted
        start: u64,
        /// Last sequence number wanted
        end: u64,
    },

    /// Transactions for a catchup request plus the proof they must satisfy
    CatchupReply {
        /// Requested transactions, in order
        transactions: Vec<PoolTransaction>,
        /// Proof covering the log extended by `transactions`
        proof: ConsistencyProof,
    },

    /// Ask a node for its pool ledger status
    LedgerStatusRequest,

    /// Node's view of the pool ledger
    LedgerStatus {
        /// Reporting node
        node_name: String,
        /// Signed size and root
        proof: ConsistencyProof,
    },
}

impl Message {
    /// Encode to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Reply(_) => "reply",
            Message::Nack { .. } => "nack",
            Message::Reject { .. } => "reject",
            Message::CatchupRequest { .. } => "catchup_request",
            Message::CatchupReply { .. } => "catchup_reply",
            Message::LedgerStatusRequest => "ledger_status_request",
            Message::LedgerStatus { .. } => "ledger_status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged() {
        let msg = Message::CatchupRequest { start: 41, end: 50 };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "catchup_request");
        assert_eq!(value["start"], 41);

        let status = Message::LedgerStatusRequest.encode().unwrap();
        assert_eq!(status, br#"{"type":"ledger_status_request"}"#);
    }

    #[test]
    fn test_request_survives_the_wire() {
        let request = Request::new("GET_NYM", json!({"dest": "V4SG"}));
        let encoded = Message::Request(request.clone()).encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, Message::Request(request));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"type":"unknown"}"#).is_err());
    }
}
