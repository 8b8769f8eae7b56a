//! Property-based tests for pool client invariants
//!
//! These tests use proptest to verify:
//! - Quorum: consensus is only reported for a group of at least quorum nodes
//! - Conflict: two groups at quorum never produce consensus
//! - Log contiguity: sequence numbers stay 1..=tail whatever is appended
//! - Verification is a pure function of its inputs

use pool_client::consensus::{aggregate, bft_quorum, max_faulty};
use pool_client::crypto::KeyPair;
use pool_client::merkle::{merkle_root, MerkleTree};
use pool_client::pool_log::PoolTransactionLog;
use pool_client::registry::NodeRegistry;
use pool_client::testkit::SimulatedPool;
use pool_client::types::{PoolTransaction, TxnMetadata};
use pool_client::verifier::{verify, TrustAnchor};
use pool_client::{ConsensusResult, NoConsensusReason, Request, VerifiedReply};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

/// Strategy for a pool size and one answer index per node
fn answers_strategy() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (1usize..=7).prop_flat_map(|n| (Just(n), prop::collection::vec(0u8..3, n)))
}

/// Verified replies where node `i` answers with payload `answers[i]`
fn replies_for(answers: &[u8]) -> Vec<VerifiedReply> {
    let sim = SimulatedPool::new(answers.len()).unwrap();
    let log = PoolTransactionLog::from_genesis(sim.genesis()).unwrap();
    let registry = NodeRegistry::new(log).unwrap();
    let anchor = TrustAnchor::new(registry.snapshot());
    let request = Request::new("GET_ATTRIB", json!({"raw": "endpoint"}));

    answers
        .iter()
        .enumerate()
        .map(|(i, answer)| {
            let name = format!("Node{}", i + 1);
            let reply = sim.signed_reply(&name, &request, json!({"answer": answer}));
            let node = registry.node_by_name(&name).unwrap();
            verify(reply, request.request_id(), &node, &anchor)
        })
        .collect()
}

fn group_sizes(answers: &[u8]) -> BTreeMap<u8, usize> {
    let mut sizes = BTreeMap::new();
    for answer in answers {
        *sizes.entry(*answer).or_insert(0) += 1;
    }
    sizes
}

fn txn(sequence_no: u64) -> PoolTransaction {
    PoolTransaction {
        sequence_no,
        node_identity: format!("did:prop:{}", sequence_no % 5),
        node_verkey: KeyPair::from_seed(&[(sequence_no % 5) as u8 + 1; 32]).verkey(),
        node_address: Some(format!("10.0.0.{}:9702", sequence_no % 5)),
        metadata: TxnMetadata {
            alias: Some(format!("Node{}", sequence_no % 5)),
            services: Some(vec!["VALIDATOR".into()]),
            ..Default::default()
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Consensus implies at least quorum distinct nodes agreed
    #[test]
    fn prop_consensus_requires_quorum((n, answers) in answers_strategy(), extra in 0usize..3) {
        let quorum = (bft_quorum(n) + extra).min(n);
        let sizes = group_sizes(&answers);
        let largest = sizes.values().copied().max().unwrap_or(0);

        let result = aggregate(&replies_for(&answers), quorum);

        match result {
            ConsensusResult::Consensus { payload, contributing_nodes } => {
                prop_assert!(contributing_nodes >= quorum);
                let answer = payload["answer"].as_u64().unwrap() as u8;
                prop_assert_eq!(sizes[&answer], contributing_nodes);
            }
            ConsensusResult::NoConsensus { reason, .. } => {
                if largest < quorum {
                    prop_assert_eq!(reason, NoConsensusReason::InsufficientValidReplies);
                } else {
                    prop_assert_eq!(reason, NoConsensusReason::ConflictingQuorums);
                }
            }
        }
    }

    /// Two payload groups at quorum are always reported as a conflict
    #[test]
    fn prop_conflicting_quorums_never_agree((n, answers) in answers_strategy()) {
        let quorum = bft_quorum(n);
        let at_quorum = group_sizes(&answers)
            .values()
            .filter(|size| **size >= quorum)
            .count();

        let result = aggregate(&replies_for(&answers), quorum);

        if at_quorum > 1 {
            prop_assert_eq!(
                result.no_consensus_reason(),
                Some(&NoConsensusReason::ConflictingQuorums)
            );
        } else {
            prop_assert_ne!(
                result.no_consensus_reason(),
                Some(&NoConsensusReason::ConflictingQuorums)
            );
        }
    }

    /// A BFT quorum always contains more nodes than can be faulty
    #[test]
    fn prop_bft_quorum_exceeds_faulty(n in 1usize..200) {
        prop_assert!(bft_quorum(n) > max_faulty(n));
        prop_assert!(bft_quorum(n) <= n);
        prop_assert!(3 * max_faulty(n) < n);
    }

    /// Whatever is appended, the log stays contiguous from 1
    #[test]
    fn prop_log_stays_contiguous(attempts in prop::collection::vec(1u64..30, 1..60)) {
        let mut log = PoolTransactionLog::from_genesis(vec![txn(1)]).unwrap();

        for seq in attempts {
            let expected_ok = seq == log.tail() + 1;
            let before = log.root_hash();
            let result = log.append(txn(seq));

            prop_assert_eq!(result.is_ok(), expected_ok);
            if !expected_ok {
                prop_assert_eq!(log.root_hash(), before);
            }

            let seq_nos: Vec<u64> = log.transactions_from(1).map(|t| t.sequence_no).collect();
            prop_assert_eq!(seq_nos, (1..=log.tail()).collect::<Vec<_>>());
            prop_assert_eq!(log.len() as u64, log.tail());
        }
    }

    /// Batches are appended whole or not at all
    #[test]
    fn prop_batch_append_is_atomic(start in 1u64..6, len in 1usize..6, gap in 0usize..6) {
        let mut log = PoolTransactionLog::from_genesis((1..=3).map(txn).collect()).unwrap();
        let mut batch: Vec<PoolTransaction> = (start..start + len as u64).map(txn).collect();
        if gap < batch.len() && gap > 0 {
            batch.remove(gap);
        }
        let contiguous = batch
            .iter()
            .enumerate()
            .all(|(i, t)| t.sequence_no == 4 + i as u64);
        let predicted = log.root_hash_with(&batch);
        let before = log.root_hash();

        let result = log.append_batch(batch);

        prop_assert_eq!(result.is_ok(), contiguous);
        if contiguous {
            prop_assert_eq!(log.root_hash(), predicted);
        } else {
            prop_assert_eq!(log.root_hash(), before);
            prop_assert_eq!(log.tail(), 3);
        }
    }

    /// Every leaf of a Merkle tree has a proof that derives its root
    #[test]
    fn prop_merkle_proofs_verify(leaf_count in 1usize..40) {
        let leaves: Vec<[u8; 32]> = (0..leaf_count)
            .map(|i| pool_client::crypto::hash_bytes(&i.to_be_bytes()))
            .collect();
        let mut tree = MerkleTree::from_leaves(leaves.clone());

        prop_assert_eq!(tree.root(), merkle_root(&leaves));
        for i in 0..leaf_count {
            let proof = tree.generate_proof(i).unwrap();
            prop_assert!(proof.verify());
        }
    }

    /// Verifying the same reply twice gives the same verdict
    #[test]
    fn prop_verification_is_idempotent(
        answer in "[a-z]{1,12}",
        tamper in any::<bool>(),
        node in 1usize..=4,
    ) {
        let sim = SimulatedPool::new(4).unwrap();
        let log = PoolTransactionLog::from_genesis(sim.genesis()).unwrap();
        let registry = NodeRegistry::new(log).unwrap();
        let anchor = TrustAnchor::new(registry.snapshot());
        let request = Request::new("GET_NYM", json!({"dest": answer}));
        let name = format!("Node{}", node);
        let info = registry.node_by_name(&name).unwrap();

        let mut reply = sim.signed_reply(&name, &request, json!({"verkey": answer}));
        if tamper {
            reply.result_payload = json!({"verkey": 0});
        }

        let first = verify(reply.clone(), request.request_id(), &info, &anchor);
        let second = verify(reply, request.request_id(), &info, &anchor);

        prop_assert_eq!(first.status(), second.status());
        prop_assert_eq!(first.verified_root_hash(), second.verified_root_hash());
        prop_assert_eq!(first.is_valid(), !tamper);
    }
}
