//! Consensus over node replies
//!
//! Valid replies are grouped by canonical payload. Refusals (nack/reject)
//! are grouped by reason. Everything else a node produced (invalid replies,
//! transport failures) only contributes a diagnostic.

use crate::types::{
    canonical_payload, ConsensusResult, NoConsensusReason, NodeDiagnostic, VerifiedReply,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Faulty validators tolerated by a pool of `node_count`
pub fn max_faulty(node_count: usize) -> usize {
    node_count.saturating_sub(1) / 3
}

/// Smallest group size that must contain an honest node
pub fn bft_quorum(node_count: usize) -> usize {
    max_faulty(node_count) + 1
}

/// Combine verified replies into a consensus result
pub fn aggregate(verified_replies: &[VerifiedReply], quorum: usize) -> ConsensusResult {
    let mut tally = Tally::default();
    for reply in verified_replies {
        tally.add_reply(reply.clone());
    }
    tally.finish_read(quorum)
}

#[derive(Debug, Clone)]
struct PayloadGroup {
    payload: Value,
    nodes: BTreeSet<String>,
}

/// Running count of what nodes said about one request
#[derive(Debug, Default)]
pub struct Tally {
    groups: BTreeMap<Vec<u8>, PayloadGroup>,
    refusals: BTreeMap<String, BTreeSet<String>>,
    diagnostics: Vec<NodeDiagnostic>,
}

impl Tally {
    /// Count a verified reply; invalid ones only leave a diagnostic
    pub fn add_reply(&mut self, reply: VerifiedReply) {
        let node = reply.reply().node_name.clone();
        if let Some(failure) = reply.failure() {
            self.diagnostics.push(NodeDiagnostic::new(node, failure));
            return;
        }

        let key = canonical_payload(&reply.reply().result_payload);
        self.groups
            .entry(key)
            .or_insert_with(|| PayloadGroup {
                payload: reply.reply().result_payload.clone(),
                nodes: BTreeSet::new(),
            })
            .nodes
            .insert(node);
    }

    /// Count an explicit refusal
    pub fn add_refusal(&mut self, node: &str, reason: &str) {
        self.refusals
            .entry(reason.to_string())
            .or_default()
            .insert(node.to_string());
        self.diagnostics
            .push(NodeDiagnostic::new(node, format!("refused: {}", reason)));
    }

    /// Record a node that produced nothing usable
    pub fn add_failure(&mut self, node: &str, detail: impl ToString) {
        self.diagnostics.push(NodeDiagnostic::new(node, detail));
    }

    /// Diagnostics collected so far
    pub fn diagnostics(&self) -> &[NodeDiagnostic] {
        &self.diagnostics
    }

    fn groups_at(&self, quorum: usize) -> Vec<&PayloadGroup> {
        self.groups
            .values()
            .filter(|g| g.nodes.len() >= quorum)
            .collect()
    }

    fn largest_success(&self) -> usize {
        self.groups.values().map(|g| g.nodes.len()).max().unwrap_or(0)
    }

    fn largest_refusal(&self) -> Option<(&str, usize)> {
        self.refusals
            .iter()
            .map(|(reason, nodes)| (reason.as_str(), nodes.len()))
            .max_by_key(|(_, count)| *count)
    }

    /// Early read result: a payload group or a refusal reason has reached
    /// quorum
    pub fn read_outcome(&self, quorum: usize) -> Option<ConsensusResult> {
        let quorum = quorum.max(1);
        match self.groups_at(quorum).as_slice() {
            [group] => Some(ConsensusResult::Consensus {
                payload: group.payload.clone(),
                contributing_nodes: group.nodes.len(),
            }),
            [] => self
                .largest_refusal()
                .filter(|(_, count)| *count >= quorum)
                .map(|(reason, _)| {
                    self.no_consensus(NoConsensusReason::Rejected(reason.to_string()))
                }),
            _ => Some(self.no_consensus(NoConsensusReason::ConflictingQuorums)),
        }
    }

    /// Nodes a read must add so that, together with the `outstanding` ones,
    /// its largest payload group could still reach quorum
    pub fn read_shortfall(&self, quorum: usize, outstanding: usize) -> usize {
        quorum
            .max(1)
            .saturating_sub(self.largest_success() + outstanding)
    }

    /// Final read result once no more replies will arrive
    pub fn finish_read(self, quorum: usize) -> ConsensusResult {
        match self.read_outcome(quorum) {
            Some(result) => result,
            None => self.into_no_consensus(NoConsensusReason::InsufficientValidReplies),
        }
    }

    /// Early write result, given how many nodes have yet to answer
    ///
    /// Returns `None` while the outstanding nodes could still change the
    /// outcome.
    pub fn write_outcome(&self, quorum: usize, outstanding: usize) -> Option<ConsensusResult> {
        let quorum = quorum.max(1);
        let success = self.largest_success();
        let refusal = self.largest_refusal().map(|(_, c)| c).unwrap_or(0);

        if self.groups_at(quorum).len() > 1 {
            return Some(self.no_consensus(NoConsensusReason::ConflictingQuorums));
        }
        if success >= quorum && refusal >= quorum {
            return Some(self.no_consensus(NoConsensusReason::WriteOutcomeAmbiguous));
        }
        if success >= quorum && refusal + outstanding < quorum {
            return self.read_outcome(quorum);
        }
        if refusal >= quorum && success + outstanding < quorum {
            return self.largest_refusal().map(|(reason, _)| {
                self.no_consensus(NoConsensusReason::Rejected(reason.to_string()))
            });
        }
        if outstanding == 0 {
            return Some(self.settle_write(quorum, success, refusal));
        }
        None
    }

    /// Final write result once no more replies will arrive
    pub fn finish_write(self, quorum: usize) -> ConsensusResult {
        let quorum = quorum.max(1);
        match self.write_outcome(quorum, 0) {
            Some(result) => result,
            None => self.into_no_consensus(NoConsensusReason::InsufficientValidReplies),
        }
    }

    fn settle_write(&self, quorum: usize, success: usize, refusal: usize) -> ConsensusResult {
        if success >= quorum {
            if let Some(result) = self.read_outcome(quorum) {
                return result;
            }
        }
        if refusal >= quorum {
            if let Some((reason, _)) = self.largest_refusal() {
                return self.no_consensus(NoConsensusReason::Rejected(reason.to_string()));
            }
        }
        if success > 0 && refusal > 0 {
            return self.no_consensus(NoConsensusReason::WriteOutcomeAmbiguous);
        }
        self.no_consensus(NoConsensusReason::InsufficientValidReplies)
    }

    fn no_consensus(&self, reason: NoConsensusReason) -> ConsensusResult {
        ConsensusResult::no_consensus(reason, self.diagnostics.clone())
    }

    fn into_no_consensus(self, reason: NoConsensusReason) -> ConsensusResult {
        ConsensusResult::no_consensus(reason, self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Reply, ReplyStatus, VerificationFailure};
    use serde_json::json;
    use uuid::Uuid;

    fn verified(node: &str, payload: Value) -> VerifiedReply {
        let reply = Reply {
            node_name: node.to_string(),
            request_id: Uuid::nil(),
            result_payload: payload,
            state_proof: None,
            raw_timestamp: 0,
        };
        VerifiedReply::new(reply, ReplyStatus::Valid, Some([0u8; 32]))
    }

    fn invalid(node: &str) -> VerifiedReply {
        let reply = Reply {
            node_name: node.to_string(),
            request_id: Uuid::nil(),
            result_payload: json!("forged"),
            state_proof: None,
            raw_timestamp: 0,
        };
        let failure = VerificationFailure::SignatureMismatch("bad".into());
        VerifiedReply::new(reply, ReplyStatus::Invalid(failure), None)
    }

    #[test]
    fn test_quorum_arithmetic() {
        assert_eq!(max_faulty(1), 0);
        assert_eq!(bft_quorum(1), 1);
        assert_eq!(bft_quorum(4), 2);
        assert_eq!(bft_quorum(7), 3);
        assert_eq!(bft_quorum(10), 4);
        assert_eq!(max_faulty(0), 0);
    }

    #[test]
    fn test_majority_wins() {
        let x = json!({"value": "X"});
        let replies = vec![
            verified("Node1", x.clone()),
            verified("Node2", x.clone()),
            verified("Node3", x.clone()),
            verified("Node4", json!({"value": "Y"})),
        ];
        assert_eq!(
            aggregate(&replies, 2),
            ConsensusResult::Consensus {
                payload: x,
                contributing_nodes: 3
            }
        );
    }

    #[test]
    fn test_conflicting_quorums() {
        let replies = vec![
            verified("Node1", json!("X")),
            verified("Node2", json!("X")),
            verified("Node3", json!("Y")),
            verified("Node4", json!("Y")),
        ];
        let result = aggregate(&replies, 2);
        assert_eq!(
            result.no_consensus_reason(),
            Some(&NoConsensusReason::ConflictingQuorums)
        );
    }

    #[test]
    fn test_invalid_replies_do_not_count() {
        let replies = vec![verified("Node1", json!("X")), invalid("Node2"), invalid("Node3")];
        let result = aggregate(&replies, 2);
        match result {
            ConsensusResult::NoConsensus {
                reason,
                diagnostics,
            } => {
                assert_eq!(reason, NoConsensusReason::InsufficientValidReplies);
                assert_eq!(diagnostics.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_node_counts_once() {
        let replies = vec![verified("Node1", json!("X")), verified("Node1", json!("X"))];
        assert!(!aggregate(&replies, 2).is_consensus());
    }

    #[test]
    fn test_key_order_does_not_split_groups() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let replies = vec![verified("Node1", a), verified("Node2", b)];
        assert!(aggregate(&replies, 2).is_consensus());
    }

    #[test]
    fn test_write_waits_while_outcome_open() {
        let mut tally = Tally::default();
        tally.add_reply(verified("Node1", json!("ok")));
        tally.add_reply(verified("Node2", json!("ok")));
        tally.add_refusal("Node3", "duplicate");

        // Node4 could still make the refusals a quorum
        assert!(tally.write_outcome(2, 1).is_none());

        tally.add_failure("Node4", "unreachable");
        let result = tally.write_outcome(2, 0).unwrap();
        assert_eq!(result.payload(), Some(&json!("ok")));
    }

    #[test]
    fn test_write_ambiguous_when_both_reach_quorum() {
        let mut tally = Tally::default();
        tally.add_reply(verified("Node1", json!("ok")));
        tally.add_reply(verified("Node2", json!("ok")));
        tally.add_refusal("Node3", "duplicate");
        tally.add_refusal("Node4", "duplicate");

        assert_eq!(
            tally.finish_write(2).no_consensus_reason(),
            Some(&NoConsensusReason::WriteOutcomeAmbiguous)
        );
    }

    #[test]
    fn test_write_ambiguous_with_split_minorities() {
        let mut tally = Tally::default();
        tally.add_reply(verified("Node1", json!("ok")));
        tally.add_refusal("Node2", "duplicate");
        tally.add_failure("Node3", "unreachable");
        tally.add_failure("Node4", "unreachable");

        assert_eq!(
            tally.finish_write(2).no_consensus_reason(),
            Some(&NoConsensusReason::WriteOutcomeAmbiguous)
        );
    }

    #[test]
    fn test_write_rejected_by_quorum() {
        let mut tally = Tally::default();
        tally.add_refusal("Node1", "insufficient fees");
        tally.add_refusal("Node2", "insufficient fees");
        tally.add_refusal("Node3", "other");

        let result = tally.write_outcome(2, 1).unwrap();
        assert_eq!(
            result.no_consensus_reason(),
            Some(&NoConsensusReason::Rejected("insufficient fees".into()))
        );
        assert_eq!(
            result.no_consensus_reason().unwrap().to_string(),
            "rejected: insufficient fees"
        );
    }

    #[test]
    fn test_read_shortfall_counts_divergent_replies() {
        let mut tally = Tally::default();
        tally.add_reply(verified("Node1", json!("X")));
        tally.add_reply(verified("Node2", json!("Y")));

        // Neither group can reach 2 without another node
        assert_eq!(tally.read_shortfall(2, 0), 1);
        assert_eq!(tally.read_shortfall(2, 1), 0);
        assert_eq!(tally.read_shortfall(3, 0), 2);

        tally.add_failure("Node3", "unreachable");
        assert_eq!(tally.read_shortfall(2, 0), 1);
    }

    #[test]
    fn test_read_refused_by_quorum() {
        let mut tally = Tally::default();
        tally.add_refusal("Node1", "unknown ledger");
        assert!(tally.read_outcome(2).is_none());

        tally.add_refusal("Node2", "unknown ledger");
        assert_eq!(
            tally.read_outcome(2).unwrap().no_consensus_reason(),
            Some(&NoConsensusReason::Rejected("unknown ledger".into()))
        );
    }
}
