//! Core types for the pool client
//!
//! All wire-visible types serialize to JSON with hashes, keys and signatures
//! as hex strings. Payloads are `serde_json::Value`; their canonical encoding
//! (object keys sorted) is what gets hashed and compared.

use crate::crypto::{hash_bytes, hex_bytes, Hash, KeyPair, Signature, VerKey};
use crate::merkle::PathStep;
use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Service tag marking a node as an active validator
pub const VALIDATOR_SERVICE: &str = "VALIDATOR";

/// Canonical byte encoding of a JSON payload
pub fn canonical_payload(payload: &Value) -> Vec<u8> {
    // serde_json maps are ordered, so this is stable across nodes
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Pool membership transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTransaction {
    /// Position in the pool ledger (1-based, contiguous)
    pub sequence_no: u64,

    /// Stable node identity (the key transactions are folded by)
    pub node_identity: String,

    /// Verification key for the node's signatures
    pub node_verkey: VerKey,

    /// Client-facing address (`host:port`); absent on updates that keep it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_address: Option<String>,

    /// Alias, services and free-form attributes
    #[serde(default)]
    pub metadata: TxnMetadata,
}

impl PoolTransaction {
    /// Canonical bytes used for hashing
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// SHA-256 of the canonical encoding (Merkle leaf)
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.canonical_bytes())
    }
}

/// Pool transaction metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnMetadata {
    /// Node alias (required on the first transaction for an identity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Services offered; an empty list demotes the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,

    /// Additional attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Derived view of one validator node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name (its alias)
    pub name: String,
    /// Stable identity from the pool ledger
    pub identity: String,
    /// Client-facing address
    pub address: String,
    /// Verification key
    pub verkey: VerKey,
    /// Whether the node currently offers the validator service
    pub is_active: bool,
}

/// Request submitted to the pool
///
/// Fields are private: a request is immutable once built, and signing
/// produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    operation_kind: String,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<Signature>,
}

impl Request {
    /// Create an unsigned request with a fresh UUIDv7 request id
    pub fn new(operation_kind: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_kind: operation_kind.into(),
            payload,
            identifier: None,
            request_id: Uuid::now_v7(),
            signature: None,
        }
    }

    /// Attach the requester identifier
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self.signature = None;
        self
    }

    /// Sign the request on behalf of `identifier`
    pub fn signed(self, identifier: impl Into<String>, keypair: &KeyPair) -> Self {
        let mut request = self.with_identifier(identifier);
        let signature = keypair.sign(&request.signature_input());
        request.signature = Some(signature);
        request
    }

    /// Bytes covered by the requester signature
    pub fn signature_input(&self) -> Vec<u8> {
        let unsigned = serde_json::json!({
            "operation_kind": self.operation_kind,
            "payload": self.payload,
            "identifier": self.identifier,
            "request_id": self.request_id,
        });
        canonical_payload(&unsigned)
    }

    /// Check the requester signature against `verkey`
    pub fn verify_signature(&self, verkey: &VerKey) -> bool {
        match &self.signature {
            Some(signature) => verkey.verify(&self.signature_input(), signature),
            None => false,
        }
    }

    /// Operation kind
    pub fn operation_kind(&self) -> &str {
        &self.operation_kind
    }

    /// Operation payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Requester identifier
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Correlation id
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Requester signature
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }
}

/// Validator signature contributing to a multi-signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSignature {
    /// Signing node name
    pub signer: String,
    /// Signature over the signed digest
    pub signature: Signature,
}

/// Set of validator signatures over one digest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSignature {
    /// Individual signatures
    pub signatures: Vec<SignerSignature>,
}

impl MultiSignature {
    /// Sign `digest` with every given key
    pub fn sign<'a>(
        digest: &Hash,
        signers: impl IntoIterator<Item = (&'a str, &'a KeyPair)>,
    ) -> Self {
        Self {
            signatures: signers
                .into_iter()
                .map(|(name, keypair)| SignerSignature {
                    signer: name.to_string(),
                    signature: keypair.sign(digest),
                })
                .collect(),
        }
    }

    /// Signature claimed by `signer`
    pub fn signature_of(&self, signer: &str) -> Option<&Signature> {
        self.signatures
            .iter()
            .find(|s| s.signer == signer)
            .map(|s| &s.signature)
    }

    /// Whether no signatures are present
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Cryptographic attestation tying a result to a ledger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProof {
    /// Ledger state root
    #[serde(with = "hex_bytes")]
    pub root_hash: Hash,

    /// Pool ledger size the signing validators were operating at
    pub pool_seq_no: u64,

    /// Time the root was signed (seconds since Unix epoch)
    pub timestamp: u64,

    /// Path from the payload hash to `root_hash`
    pub inclusion_path: Vec<PathStep>,

    /// Validator signatures over the proof digest
    pub multi_signature: MultiSignature,
}

/// Reply from one validator node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Responding node
    pub node_name: String,
    /// Request this reply answers
    pub request_id: Uuid,
    /// Result body
    pub result_payload: Value,
    /// Proof attached by the node
    #[serde(default)]
    pub state_proof: Option<StateProof>,
    /// Node-local timestamp (seconds since Unix epoch)
    pub raw_timestamp: u64,
}

/// Reason a reply failed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    /// Reply answers a different request
    RequestMismatch {
        /// Outstanding request id
        expected: Uuid,
        /// Id carried by the reply
        found: Uuid,
    },
    /// Missing fields or undecodable proof
    MalformedProof(String),
    /// Signature or inclusion path does not check out
    SignatureMismatch(String),
    /// Proof older than the freshness threshold
    StaleProof {
        /// Proof age in seconds
        age_secs: u64,
    },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestMismatch { expected, found } => {
                write!(f, "request id mismatch: expected {}, found {}", expected, found)
            }
            Self::MalformedProof(msg) => write!(f, "malformed proof: {}", msg),
            Self::SignatureMismatch(msg) => write!(f, "signature mismatch: {}", msg),
            Self::StaleProof { age_secs } => write!(f, "stale proof: {}s old", age_secs),
        }
    }
}

impl From<VerificationFailure> for Error {
    fn from(failure: VerificationFailure) -> Self {
        match failure {
            VerificationFailure::SignatureMismatch(msg) => Error::SignatureMismatch(msg),
            other => Error::MalformedProof(other.to_string()),
        }
    }
}

/// Verification outcome for a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Proof checks out against the local pool state
    Valid,
    /// Proof checks out but references a newer pool ledger
    NeedsCatchup {
        /// Pool ledger size claimed by the proof
        pool_seq_no: u64,
    },
    /// Reply must not be trusted
    Invalid(VerificationFailure),
}

/// Reply after verification
///
/// Only [`crate::verifier::verify`] constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedReply {
    reply: Reply,
    status: ReplyStatus,
    verified_root_hash: Option<Hash>,
}

impl VerifiedReply {
    pub(crate) fn new(reply: Reply, status: ReplyStatus, verified_root_hash: Option<Hash>) -> Self {
        Self {
            reply,
            status,
            verified_root_hash,
        }
    }

    /// Underlying reply
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    /// Verification status
    pub fn status(&self) -> &ReplyStatus {
        &self.status
    }

    /// Whether the reply may contribute to consensus
    pub fn is_valid(&self) -> bool {
        !matches!(self.status, ReplyStatus::Invalid(_))
    }

    /// Whether the reply references a pool newer than the local log
    pub fn needs_catchup(&self) -> bool {
        matches!(self.status, ReplyStatus::NeedsCatchup { .. })
    }

    /// Root derived from the inclusion path, when verification got that far
    pub fn verified_root_hash(&self) -> Option<&Hash> {
        self.verified_root_hash.as_ref()
    }

    /// Failure reason for invalid replies
    pub fn failure(&self) -> Option<&VerificationFailure> {
        match &self.status {
            ReplyStatus::Invalid(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Why a request ended without consensus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoConsensusReason {
    /// Budget or deadline exhausted before any group reached quorum
    InsufficientValidReplies,
    /// More than one payload group reached quorum
    ConflictingQuorums,
    /// Write saw both success and refusal without a clear outcome
    WriteOutcomeAmbiguous,
    /// A quorum of nodes refused the request
    Rejected(String),
}

impl fmt::Display for NoConsensusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientValidReplies => write!(f, "insufficient valid replies"),
            Self::ConflictingQuorums => write!(f, "conflicting quorums"),
            Self::WriteOutcomeAmbiguous => write!(f, "write outcome ambiguous"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// Per-node note explaining why a node did not contribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiagnostic {
    /// Node name
    pub node: String,
    /// What went wrong
    pub detail: String,
}

impl NodeDiagnostic {
    /// Create a diagnostic entry
    pub fn new(node: impl Into<String>, detail: impl ToString) -> Self {
        Self {
            node: node.into(),
            detail: detail.to_string(),
        }
    }
}

/// Terminal outcome of a request
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusResult {
    /// A quorum of nodes agreed on `payload`
    Consensus {
        /// Agreed result
        payload: Value,
        /// Number of nodes in the agreeing group
        contributing_nodes: usize,
    },
    /// No agreement could be reached
    NoConsensus {
        /// Reason
        reason: NoConsensusReason,
        /// Per-node diagnostics
        diagnostics: Vec<NodeDiagnostic>,
    },
}

impl ConsensusResult {
    /// Whether consensus was reached
    pub fn is_consensus(&self) -> bool {
        matches!(self, Self::Consensus { .. })
    }

    /// Agreed payload
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Consensus { payload, .. } => Some(payload),
            Self::NoConsensus { .. } => None,
        }
    }

    /// Reason, for results without consensus
    pub fn no_consensus_reason(&self) -> Option<&NoConsensusReason> {
        match self {
            Self::Consensus { .. } => None,
            Self::NoConsensus { reason, .. } => Some(reason),
        }
    }

    pub(crate) fn no_consensus(
        reason: NoConsensusReason,
        diagnostics: Vec<NodeDiagnostic>,
    ) -> Self {
        Self::NoConsensus {
            reason,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_payload_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_payload(&a), canonical_payload(&b));
    }

    #[test]
    fn test_request_ids_unique() {
        let r1 = Request::new("GET_NYM", json!({"dest": "abc"}));
        let r2 = Request::new("GET_NYM", json!({"dest": "abc"}));
        assert_ne!(r1.request_id(), r2.request_id());
    }

    #[test]
    fn test_request_signature() {
        let keypair = KeyPair::from_seed(&[3u8; 32]);
        let request = Request::new("NYM", json!({"dest": "abc"})).signed("Trustee1", &keypair);

        assert_eq!(request.identifier(), Some("Trustee1"));
        assert!(request.verify_signature(&keypair.verkey()));

        let other = KeyPair::from_seed(&[4u8; 32]);
        assert!(!request.verify_signature(&other.verkey()));

        // Changing the identifier drops the signature
        let unsigned = request.with_identifier("Someone");
        assert!(unsigned.signature().is_none());
    }

    #[test]
    fn test_transaction_hash_is_stable() {
        let txn = PoolTransaction {
            sequence_no: 1,
            node_identity: "id1".into(),
            node_verkey: KeyPair::from_seed(&[1u8; 32]).verkey(),
            node_address: Some("127.0.0.1:9702".into()),
            metadata: TxnMetadata {
                alias: Some("Node1".into()),
                services: Some(vec![VALIDATOR_SERVICE.into()]),
                attributes: BTreeMap::new(),
            },
        };
        let roundtrip: PoolTransaction =
            serde_json::from_slice(&txn.canonical_bytes()).unwrap();
        assert_eq!(roundtrip.hash(), txn.hash());
    }

    #[test]
    fn test_no_consensus_reason_strings() {
        assert_eq!(
            NoConsensusReason::InsufficientValidReplies.to_string(),
            "insufficient valid replies"
        );
        assert_eq!(NoConsensusReason::ConflictingQuorums.to_string(), "conflicting quorums");
        assert_eq!(
            NoConsensusReason::WriteOutcomeAmbiguous.to_string(),
            "write outcome ambiguous"
        );
    }

    #[test]
    fn test_verification_failure_into_error() {
        let err: Error = VerificationFailure::SignatureMismatch("bad".into()).into();
        assert!(matches!(err, Error::SignatureMismatch(_)));

        let err: Error = VerificationFailure::MalformedProof("missing".into()).into();
        assert!(matches!(err, Error::MalformedProof(_)));
    }
}
