//! Request dispatch across validator nodes
//!
//! Each selected node gets its own task that performs the exchange and
//! reports into a completion channel. The dispatcher verifies replies as
//! they arrive and returns as soon as the outcome is decided or the deadline
//! passes. A read whose outstanding nodes can no longer complete a quorum
//! (failures, divergent payloads, refusals) is topped up with the next
//! untried nodes while the retry budget lasts. Outstanding tasks are left to
//! finish on their own.

use crate::catchup::CatchupHandle;
use crate::config::PoolConfig;
use crate::consensus::Tally;
use crate::metrics::PoolMetrics;
use crate::network::ConnectionManager;
use crate::protocol::Message;
use crate::registry::NodeRegistry;
use crate::types::{ConsensusResult, NodeInfo, ReplyStatus, Request};
use crate::verifier::{verify, TrustAnchor};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read or write semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Answered by a quorum of identical verified replies
    Read,
    /// Sent to every active node; success and refusal are both tallied
    Write,
}

/// How one request is dispatched
///
/// Unset fields fall back to the pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Read or write
    pub kind: RequestKind,
    /// Distinct agreeing nodes required
    pub quorum: Option<usize>,
    /// Overall deadline
    pub deadline: Option<Duration>,
    /// Extra nodes tried after failures
    pub retry_budget: Option<usize>,
    /// Nodes contacted up front (reads only)
    pub fanout: Option<usize>,
}

impl RequestPolicy {
    /// Read policy with pool defaults
    pub fn read() -> Self {
        Self {
            kind: RequestKind::Read,
            quorum: None,
            deadline: None,
            retry_budget: None,
            fanout: None,
        }
    }

    /// Write policy with pool defaults
    pub fn write() -> Self {
        Self {
            kind: RequestKind::Write,
            ..Self::read()
        }
    }

    /// Require `quorum` agreeing nodes
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Give up after `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Try at most `retry_budget` extra nodes
    pub fn with_retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = Some(retry_budget);
        self
    }

    /// Contact `fanout` nodes up front
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = Some(fanout);
        self
    }
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self::read()
    }
}

struct Completion {
    node: NodeInfo,
    result: Result<Message>,
}

/// Dispatches requests for one pool
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionManager>,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
    catchup: Option<CatchupHandle>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: Arc<NodeRegistry>,
        connections: Arc<ConnectionManager>,
        config: PoolConfig,
        metrics: Arc<PoolMetrics>,
        catchup: Option<CatchupHandle>,
    ) -> Self {
        Self {
            registry,
            connections,
            config,
            metrics,
            catchup,
        }
    }

    /// Submit `request` and wait for its terminal outcome
    ///
    /// Per-node failures never surface as errors; they end up in the
    /// diagnostics of a `NoConsensus` result. Errors are reserved for an
    /// unusable policy or a closed pool.
    pub async fn submit(
        &self,
        request: &Request,
        policy: &RequestPolicy,
    ) -> Result<ConsensusResult> {
        if self.connections.is_closed() {
            return Err(Error::PoolClosed);
        }

        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let candidates = self
            .connections
            .rank(snapshot.active_nodes().cloned().collect());
        let node_count = candidates.len();

        let quorum = policy
            .quorum
            .unwrap_or_else(|| self.config.quorum_policy.quorum_for(node_count));
        if quorum == 0 || quorum > node_count {
            return Err(Error::Configuration(format!(
                "quorum {} is not achievable with {} active nodes",
                quorum, node_count
            )));
        }

        let initial = match policy.kind {
            RequestKind::Write => node_count,
            RequestKind::Read => {
                let fanout = policy.fanout.unwrap_or(self.config.read_fanout);
                let fanout = if fanout == 0 { quorum } else { fanout };
                fanout.max(quorum).min(node_count)
            }
        };
        let mut retries_left = policy.retry_budget.unwrap_or(self.config.retry_budget);
        let deadline =
            started + policy.deadline.unwrap_or_else(|| self.config.request_timeout());

        let mut anchor = TrustAnchor::new(snapshot.clone());
        if let Some(threshold) = self.config.freshness_threshold() {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            anchor = anchor.with_freshness(now, threshold);
        }

        let request_id = request.request_id();
        debug!(
            %request_id,
            operation = request.operation_kind(),
            kind = ?policy.kind,
            quorum,
            initial,
            generation = snapshot.generation(),
            "Dispatching request"
        );

        let message = Message::Request(request.clone());
        let (tx, mut rx) = mpsc::channel::<Completion>(node_count.max(1));
        let mut queue: VecDeque<NodeInfo> = candidates.into();
        let mut in_flight: Vec<String> = Vec::with_capacity(node_count);
        let mut tally = Tally::default();

        let first_wave: Vec<NodeInfo> = queue.drain(..initial).collect();
        for node in first_wave {
            in_flight.push(node.name.clone());
            self.launch(node, &message, &tx);
        }

        let result = loop {
            if let Some(decided) = self.decided(&tally, policy.kind, quorum, in_flight.len()) {
                break decided;
            }
            if policy.kind == RequestKind::Read {
                let shortfall = tally.read_shortfall(quorum, in_flight.len());
                let extra = shortfall.min(retries_left).min(queue.len());
                for next in queue.drain(..extra) {
                    retries_left -= 1;
                    debug!(%request_id, node = %next.name, retries_left, "Topping up read");
                    in_flight.push(next.name.clone());
                    self.launch(next, &message, &tx);
                }
            }
            if in_flight.is_empty() {
                break self.finish(tally, policy.kind, quorum);
            }

            let completion = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(completion)) => completion,
                Ok(None) => break self.finish(tally, policy.kind, quorum),
                Err(_) => {
                    warn!(
                        %request_id,
                        outstanding = in_flight.len(),
                        "Request deadline exceeded"
                    );
                    for node in in_flight.drain(..) {
                        tally.add_failure(&node, "deadline exceeded");
                    }
                    break self.finish(tally, policy.kind, quorum);
                }
            };

            in_flight.retain(|name| name != &completion.node.name);
            self.record(&mut tally, completion, request_id, &anchor);
        };

        let outcome = match &result {
            ConsensusResult::Consensus { .. } => "consensus".to_string(),
            ConsensusResult::NoConsensus { reason, .. } => reason.to_string(),
        };
        self.metrics
            .record_request(&outcome, started.elapsed().as_secs_f64());
        info!(%request_id, outcome = %outcome, elapsed = ?started.elapsed(), "Request finished");

        Ok(result)
    }

    fn launch(&self, node: NodeInfo, message: &Message, tx: &mpsc::Sender<Completion>) {
        let connections = Arc::clone(&self.connections);
        let message = message.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let result = connections.exchange(&node, &message).await;
            // Receiver is gone once the request has been decided
            let _ = tx.send(Completion { node, result }).await;
        });
    }

    /// Fold one completion into the tally
    fn record(
        &self,
        tally: &mut Tally,
        completion: Completion,
        request_id: Uuid,
        anchor: &TrustAnchor,
    ) {
        let Completion { node, result } = completion;
        match result {
            Ok(Message::Reply(reply)) => {
                let verified = verify(reply, request_id, &node, anchor);
                if let (ReplyStatus::NeedsCatchup { pool_seq_no }, Some(catchup)) =
                    (verified.status(), &self.catchup)
                {
                    catchup.trigger(Some(*pool_seq_no));
                }

                if let Some(failure) = verified.failure() {
                    self.metrics.record_verification_failure();
                    warn!(%request_id, node = %node.name, %failure, "Reply failed verification");
                }
                tally.add_reply(verified);
            }
            Ok(
                Message::Nack {
                    request_id: id,
                    reason,
                }
                | Message::Reject {
                    request_id: id,
                    reason,
                },
            ) if id == request_id => {
                debug!(%request_id, node = %node.name, %reason, "Request refused");
                tally.add_refusal(&node.name, &reason);
            }
            Ok(other) => {
                tally.add_failure(&node.name, format!("unexpected {} message", other.kind()));
            }
            Err(e) => {
                if e.is_transient() {
                    debug!(%request_id, node = %node.name, error = %e, "Node failed");
                } else {
                    warn!(%request_id, node = %node.name, error = %e, "Node failed");
                }
                tally.add_failure(&node.name, e);
            }
        }
    }

    fn decided(
        &self,
        tally: &Tally,
        kind: RequestKind,
        quorum: usize,
        outstanding: usize,
    ) -> Option<ConsensusResult> {
        match kind {
            RequestKind::Read => tally.read_outcome(quorum),
            RequestKind::Write => tally.write_outcome(quorum, outstanding),
        }
    }

    fn finish(&self, tally: Tally, kind: RequestKind, quorum: usize) -> ConsensusResult {
        match kind {
            RequestKind::Read => tally.finish_read(quorum),
            RequestKind::Write => tally.finish_write(quorum),
        }
    }
}
