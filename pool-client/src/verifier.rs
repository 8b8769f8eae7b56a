//! Reply verification against the trusted pool state
//!
//! [`verify`] is a pure function of its inputs: the same reply checked
//! against the same anchor always yields the same [`VerifiedReply`].

use crate::crypto::{hash_bytes, state_proof_digest};
use crate::merkle::derive_root;
use crate::registry::RegistrySnapshot;
use crate::types::{
    canonical_payload, NodeInfo, Reply, ReplyStatus, VerificationFailure, VerifiedReply,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Longest inclusion path accepted (a tree of 2^64 leaves)
pub const MAX_PATH_LEN: usize = 64;

/// Trusted local state replies are checked against
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    snapshot: Arc<RegistrySnapshot>,
    multisig_threshold: usize,
    now: Option<u64>,
    freshness_threshold: Option<Duration>,
}

impl TrustAnchor {
    /// Anchor on `snapshot` requiring `f + 1` co-signers
    pub fn new(snapshot: Arc<RegistrySnapshot>) -> Self {
        let multisig_threshold = snapshot.max_faulty() + 1;
        Self {
            snapshot,
            multisig_threshold,
            now: None,
            freshness_threshold: None,
        }
    }

    /// Override the number of distinct known signers required
    pub fn with_multisig_threshold(mut self, threshold: usize) -> Self {
        self.multisig_threshold = threshold.max(1);
        self
    }

    /// Reject proofs older than `threshold` relative to `now` (Unix seconds)
    pub fn with_freshness(mut self, now: u64, threshold: Duration) -> Self {
        self.now = Some(now);
        self.freshness_threshold = Some(threshold);
        self
    }

    /// Local pool ledger size
    pub fn pool_seq_no(&self) -> u64 {
        self.snapshot.pool_seq_no()
    }

    /// Snapshot signer keys are taken from
    pub fn snapshot(&self) -> &Arc<RegistrySnapshot> {
        &self.snapshot
    }
}

/// Verify one reply from `node`
///
/// Checks, in order: request correlation, proof structure, the replying
/// node's own signature, co-signer signatures, the inclusion path and
/// freshness. A proof made at a pool ledger newer than the anchor's is
/// reported as [`ReplyStatus::NeedsCatchup`]. It still needs the full
/// threshold of co-signers known to the anchor; signers that joined after
/// the local pool ledger are ignored.
pub fn verify(
    reply: Reply,
    expected_request_id: Uuid,
    node: &NodeInfo,
    anchor: &TrustAnchor,
) -> VerifiedReply {
    match check(&reply, expected_request_id, node, anchor) {
        Ok((status, root)) => VerifiedReply::new(reply, status, Some(root)),
        Err(failure) => VerifiedReply::new(reply, ReplyStatus::Invalid(failure), None),
    }
}

fn check(
    reply: &Reply,
    expected_request_id: Uuid,
    node: &NodeInfo,
    anchor: &TrustAnchor,
) -> Result<(ReplyStatus, crate::crypto::Hash), VerificationFailure> {
    if reply.request_id != expected_request_id {
        return Err(VerificationFailure::RequestMismatch {
            expected: expected_request_id,
            found: reply.request_id,
        });
    }
    if reply.node_name != node.name {
        return Err(VerificationFailure::MalformedProof(format!(
            "reply claims to come from {} but arrived from {}",
            reply.node_name, node.name
        )));
    }

    let proof = reply
        .state_proof
        .as_ref()
        .ok_or_else(|| VerificationFailure::MalformedProof("missing state proof".into()))?;

    if proof.multi_signature.is_empty() {
        return Err(VerificationFailure::MalformedProof("empty multi-signature".into()));
    }
    if proof.inclusion_path.len() > MAX_PATH_LEN {
        return Err(VerificationFailure::MalformedProof(format!(
            "inclusion path of {} steps",
            proof.inclusion_path.len()
        )));
    }

    let mut signers = BTreeSet::new();
    for entry in &proof.multi_signature.signatures {
        if !signers.insert(entry.signer.as_str()) {
            return Err(VerificationFailure::MalformedProof(format!(
                "duplicate signer {}",
                entry.signer
            )));
        }
    }

    let digest = state_proof_digest(&proof.root_hash, proof.pool_seq_no, proof.timestamp);

    let own = proof.multi_signature.signature_of(&node.name).ok_or_else(|| {
        VerificationFailure::MalformedProof(format!("{} did not sign its own proof", node.name))
    })?;
    if !node.verkey.verify(&digest, own) {
        return Err(VerificationFailure::SignatureMismatch(format!(
            "signature of {} does not verify",
            node.name
        )));
    }

    // Unknown signers are ignored; a known signer with a bad signature is not
    let mut valid_signers = 0usize;
    for entry in &proof.multi_signature.signatures {
        let Some(verkey) = anchor.snapshot.validator_verkey(&entry.signer) else {
            continue;
        };
        if !verkey.verify(&digest, &entry.signature) {
            return Err(VerificationFailure::SignatureMismatch(format!(
                "signature of {} does not verify",
                entry.signer
            )));
        }
        valid_signers += 1;
    }

    if valid_signers < anchor.multisig_threshold {
        return Err(VerificationFailure::SignatureMismatch(format!(
            "{} of {} required validator signatures",
            valid_signers, anchor.multisig_threshold
        )));
    }

    let leaf = hash_bytes(&canonical_payload(&reply.result_payload));
    let derived = derive_root(&leaf, &proof.inclusion_path);
    if derived != proof.root_hash {
        return Err(VerificationFailure::SignatureMismatch(
            "inclusion path does not derive the signed root".into(),
        ));
    }

    if let (Some(now), Some(threshold)) = (anchor.now, anchor.freshness_threshold) {
        let age_secs = now.saturating_sub(proof.timestamp);
        if age_secs > threshold.as_secs() {
            return Err(VerificationFailure::StaleProof { age_secs });
        }
    }

    let status = if proof.pool_seq_no > anchor.pool_seq_no() {
        ReplyStatus::NeedsCatchup {
            pool_seq_no: proof.pool_seq_no,
        }
    } else {
        ReplyStatus::Valid
    };
    Ok((status, derived))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::merkle::{Direction, PathStep};
    use crate::pool_log::PoolTransactionLog;
    use crate::registry::NodeRegistry;
    use crate::types::{MultiSignature, PoolTransaction, StateProof, TxnMetadata};
    use serde_json::json;

    struct Fixture {
        registry: NodeRegistry,
        keys: Vec<KeyPair>,
    }

    fn fixture() -> Fixture {
        let keys: Vec<KeyPair> = (1..=4u8).map(|i| KeyPair::from_seed(&[i; 32])).collect();
        let genesis = keys
            .iter()
            .enumerate()
            .map(|(i, key)| PoolTransaction {
                sequence_no: i as u64 + 1,
                node_identity: format!("identity-{}", i + 1),
                node_verkey: key.verkey(),
                node_address: Some(format!("127.0.0.1:{}", 9701 + i)),
                metadata: TxnMetadata {
                    alias: Some(format!("Node{}", i + 1)),
                    services: Some(vec!["VALIDATOR".into()]),
                    ..Default::default()
                },
            })
            .collect();
        let log = PoolTransactionLog::from_genesis(genesis).unwrap();
        let registry = NodeRegistry::new(log).unwrap();
        Fixture { registry, keys }
    }

    impl Fixture {
        fn anchor(&self) -> TrustAnchor {
            TrustAnchor::new(self.registry.snapshot())
        }

        fn node(&self, index: usize) -> NodeInfo {
            self.registry.node_by_name(&format!("Node{}", index + 1)).unwrap()
        }

        /// Reply from `index` co-signed by `signers`
        fn reply(
            &self,
            index: usize,
            request_id: Uuid,
            pool_seq_no: u64,
            signers: &[usize],
        ) -> Reply {
            let payload = json!({"dest": "V4SG", "verkey": "~CoRE"});
            let leaf = hash_bytes(&canonical_payload(&payload));
            let sibling = hash_bytes(b"sibling");
            let path = vec![PathStep {
                side: Direction::Right,
                hash: sibling,
            }];
            let root_hash = derive_root(&leaf, &path);
            let timestamp = 1_700_000_000;
            let digest = state_proof_digest(&root_hash, pool_seq_no, timestamp);

            let names: Vec<String> = signers.iter().map(|i| format!("Node{}", i + 1)).collect();
            let multi_signature = MultiSignature::sign(
                &digest,
                signers
                    .iter()
                    .zip(names.iter())
                    .map(|(i, name)| (name.as_str(), &self.keys[*i])),
            );

            Reply {
                node_name: format!("Node{}", index + 1),
                request_id,
                result_payload: payload,
                state_proof: Some(StateProof {
                    root_hash,
                    pool_seq_no,
                    timestamp,
                    inclusion_path: path,
                    multi_signature,
                }),
                raw_timestamp: timestamp,
            }
        }
    }

    #[test]
    fn test_valid_reply() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let verified = verify(fx.reply(0, id, 4, &[0, 1]), id, &fx.node(0), &fx.anchor());

        assert_eq!(verified.status(), &ReplyStatus::Valid);
        assert!(verified.is_valid());
        assert!(verified.verified_root_hash().is_some());
    }

    #[test]
    fn test_request_mismatch() {
        let fx = fixture();
        let verified = verify(
            fx.reply(0, Uuid::now_v7(), 4, &[0, 1]),
            Uuid::now_v7(),
            &fx.node(0),
            &fx.anchor(),
        );
        assert!(matches!(
            verified.failure(),
            Some(VerificationFailure::RequestMismatch { .. })
        ));
        assert!(verified.verified_root_hash().is_none());
    }

    #[test]
    fn test_missing_proof_is_malformed() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let mut reply = fx.reply(0, id, 4, &[0, 1]);
        reply.state_proof = None;

        let verified = verify(reply, id, &fx.node(0), &fx.anchor());
        assert!(matches!(
            verified.failure(),
            Some(VerificationFailure::MalformedProof(_))
        ));
    }

    #[test]
    fn test_too_few_cosigners() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let verified = verify(fx.reply(0, id, 4, &[0]), id, &fx.node(0), &fx.anchor());
        assert!(matches!(
            verified.failure(),
            Some(VerificationFailure::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_raised_threshold() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let anchor = fx.anchor().with_multisig_threshold(3);

        let verified = verify(fx.reply(0, id, 4, &[0, 1]), id, &fx.node(0), &anchor);
        assert!(!verified.is_valid());

        let verified = verify(fx.reply(0, id, 4, &[0, 1, 3]), id, &fx.node(0), &anchor);
        assert!(verified.is_valid());
    }

    #[test]
    fn test_forged_payload_breaks_inclusion_path() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let mut reply = fx.reply(0, id, 4, &[0, 1, 2]);
        reply.result_payload = json!({"dest": "V4SG", "verkey": "~forged"});

        let verified = verify(reply, id, &fx.node(0), &fx.anchor());
        assert!(matches!(
            verified.failure(),
            Some(VerificationFailure::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_reply_relayed_from_another_node() {
        let fx = fixture();
        let id = Uuid::now_v7();
        // Node2's reply arriving on Node1's connection
        let verified = verify(fx.reply(1, id, 4, &[0, 1]), id, &fx.node(0), &fx.anchor());
        assert!(!verified.is_valid());
    }

    #[test]
    fn test_newer_pool_needs_catchup() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let verified = verify(fx.reply(2, id, 50, &[2, 3]), id, &fx.node(2), &fx.anchor());

        assert_eq!(verified.status(), &ReplyStatus::NeedsCatchup { pool_seq_no: 50 });
        assert!(verified.is_valid());
        assert!(verified.needs_catchup());
    }

    #[test]
    fn test_newer_pool_alone_is_not_trusted() {
        let fx = fixture();
        let id = Uuid::now_v7();
        // Only the replying node vouches for a pool ledger of 1000
        let verified = verify(fx.reply(2, id, 1000, &[2]), id, &fx.node(2), &fx.anchor());

        assert!(!verified.is_valid());
        assert!(!verified.needs_catchup());
        assert!(matches!(
            verified.failure(),
            Some(VerificationFailure::SignatureMismatch(msg)) if msg.contains("1 of 2")
        ));
    }

    #[test]
    fn test_stale_proof() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let anchor = fx
            .anchor()
            .with_freshness(1_700_000_000 + 600, Duration::from_secs(300));

        let verified = verify(fx.reply(0, id, 4, &[0, 1]), id, &fx.node(0), &anchor);
        assert_eq!(
            verified.failure(),
            Some(&VerificationFailure::StaleProof { age_secs: 600 })
        );
    }

    #[test]
    fn test_unknown_signers_are_ignored() {
        let fx = fixture();
        let id = Uuid::now_v7();
        let mut reply = fx.reply(0, id, 4, &[0, 1]);
        let stranger = KeyPair::from_seed(&[99u8; 32]);
        if let Some(proof) = reply.state_proof.as_mut() {
            proof.multi_signature.signatures.push(crate::types::SignerSignature {
                signer: "Stranger".into(),
                signature: stranger.sign(b"anything"),
            });
        }

        let verified = verify(reply, id, &fx.node(0), &fx.anchor());
        assert_eq!(verified.status(), &ReplyStatus::Valid);
    }
}
