//! Pool ledger catchup
//!
//! A single background actor brings the local pool transaction log up to
//! the network's. One run walks the states
//!
//! ```text
//! Idle ─▶ Detecting ─▶ Fetching ─▶ Verifying ─▶ Idle
//!                          ▲            │
//!                          └────────────┘  (one round per batch)
//! ```
//!
//! Each batch is appended only after its multi-signed consistency proof
//! checks out, under the registry's append lock. A verified batch that ends
//! short of the requested range means the network has nothing further, and
//! ends the run successfully; a target hinted by a single reply can therefore
//! overshoot without harm. A failed batch leaves the log as it was before
//! that batch and ends the run. Requests in flight keep the snapshot they
//! started with.

use crate::config::CatchupConfig;
use crate::crypto::pool_ledger_digest;
use crate::metrics::PoolMetrics;
use crate::network::ConnectionManager;
use crate::pool_log::PoolTransactionLog;
use crate::protocol::{ConsistencyProof, Message};
use crate::registry::{NodeRegistry, RegistrySnapshot};
use crate::types::PoolTransaction;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Catchup state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupState {
    /// Nothing to do
    Idle,
    /// Establishing the target pool ledger size
    Detecting,
    /// Requesting a batch of transactions
    Fetching,
    /// Checking a batch against its consistency proof
    Verifying,
}

/// Summary of a completed catchup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupOutcome {
    /// Log tail before the run
    pub from_seq_no: u64,
    /// Log tail after the run
    pub to_seq_no: u64,
    /// Transactions appended
    pub appended: usize,
    /// Registry generation after the run
    pub generation: u64,
}

/// Message sent to the catchup actor
enum CatchupMessage {
    /// Fire-and-forget trigger from a reply that referenced a newer pool
    Trigger { target: Option<u64> },

    /// Explicit run with a result
    Run {
        target: Option<u64>,
        response: oneshot::Sender<Result<CatchupOutcome>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns catchup runs
struct CatchupManager {
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionManager>,
    config: CatchupConfig,
    metrics: Arc<PoolMetrics>,
    mailbox: mpsc::Receiver<CatchupMessage>,
    state: watch::Sender<CatchupState>,
    history: Arc<Mutex<Vec<CatchupState>>>,
}

impl CatchupManager {
    /// Run the actor event loop
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            let (mut target, mut waiters) = match message {
                CatchupMessage::Shutdown => break,
                CatchupMessage::Trigger { target } => (target, Vec::new()),
                CatchupMessage::Run { target, response } => (target, vec![response]),
            };

            // Coalesce everything already queued into this run
            let mut shutdown = false;
            while let Ok(queued) = self.mailbox.try_recv() {
                match queued {
                    CatchupMessage::Shutdown => shutdown = true,
                    CatchupMessage::Trigger { target: next } => target = merge_target(target, next),
                    CatchupMessage::Run {
                        target: next,
                        response,
                    } => {
                        target = merge_target(target, next);
                        waiters.push(response);
                    }
                }
            }

            let local = self.registry.snapshot().pool_seq_no();
            let stale = matches!(target, Some(t) if t <= local) && waiters.is_empty();
            if !stale {
                let result = self.catch_up(target).await;
                if let Some(last) = waiters.pop() {
                    for waiter in waiters {
                        let _ = waiter.send(share_result(&result));
                    }
                    let _ = last.send(result);
                }
            }

            if shutdown {
                break;
            }
        }
        debug!("Catchup actor stopped");
    }

    fn transition(&self, next: CatchupState) {
        self.history.lock().push(next);
        self.state.send_replace(next);
        debug!(state = ?next, "Catchup state");
    }

    /// One full run, always ending in `Idle`
    async fn catch_up(&self, target: Option<u64>) -> Result<CatchupOutcome> {
        self.transition(CatchupState::Detecting);
        let from_seq_no = self.registry.snapshot().pool_seq_no();
        let result = self.run_phases(target, from_seq_no).await;
        self.transition(CatchupState::Idle);

        match &result {
            Ok(outcome) => {
                self.metrics.record_catchup("ok", outcome.appended);
                self.metrics.set_generation(outcome.generation);
                if outcome.appended > 0 {
                    info!(
                        from = outcome.from_seq_no,
                        to = outcome.to_seq_no,
                        generation = outcome.generation,
                        "Pool ledger caught up"
                    );
                }
            }
            Err(e) => {
                let appended = (self.registry.snapshot().pool_seq_no() - from_seq_no) as usize;
                self.metrics.record_catchup("failed", appended);
                warn!(error = %e, "Catchup failed");
            }
        }
        result
    }

    async fn run_phases(&self, target: Option<u64>, from_seq_no: u64) -> Result<CatchupOutcome> {
        let snapshot = self.registry.snapshot();
        let target = match target {
            Some(target) => target,
            None => self.detect(&snapshot).await?,
        };

        let mut generation = snapshot.generation();
        let mut start = snapshot.pool_seq_no() + 1;
        let mut appended = 0usize;

        while start <= target {
            self.transition(CatchupState::Fetching);
            let end = target.min(start + self.config.batch_size - 1);
            let (batch, proof) = self.fetch(start, end).await?;

            self.transition(CatchupState::Verifying);
            let signers = self.registry.snapshot();
            let count = batch.len();
            let verified_end = proof.seq_no_end;
            let updated = self
                .registry
                .append_verified(batch, |log, batch| {
                    verify_batch(log, batch, &proof, start, end, &signers)
                })
                .map_err(|e| match e {
                    Error::CatchupVerification(_) => e,
                    other => Error::CatchupVerification(other.to_string()),
                })?;

            debug!(
                start,
                end = verified_end,
                generation = updated.generation(),
                "Catchup batch appended"
            );
            appended += count;
            generation = updated.generation();
            if verified_end < end {
                info!(
                    requested = target,
                    reached = verified_end,
                    "Network pool ledger ends before the catchup target"
                );
                break;
            }
            start = end + 1;
        }

        Ok(CatchupOutcome {
            from_seq_no,
            to_seq_no: self.registry.snapshot().pool_seq_no(),
            appended,
            generation,
        })
    }

    /// Ask every active node for its ledger status and adopt the largest
    /// size that `f + 1` of them agree on
    async fn detect(&self, snapshot: &RegistrySnapshot) -> Result<u64> {
        let pending: Vec<_> = snapshot
            .active_nodes()
            .map(|node| self.connections.send(node, Message::LedgerStatusRequest))
            .collect();

        let mut votes: BTreeMap<(u64, [u8; 32]), BTreeSet<String>> = BTreeMap::new();
        for reply in pending {
            let node_name = reply.node_name().to_string();
            match reply.await {
                Ok(Message::LedgerStatus {
                    node_name: reporter,
                    proof,
                }) if reporter == node_name => {
                    let digest = pool_ledger_digest(proof.seq_no_end, &proof.pool_root);
                    let signed = proof
                        .multi_signature
                        .signature_of(&reporter)
                        .zip(snapshot.validator_verkey(&reporter))
                        .map(|(sig, verkey)| verkey.verify(&digest, sig))
                        .unwrap_or(false);
                    if signed {
                        votes
                            .entry((proof.seq_no_end, proof.pool_root))
                            .or_default()
                            .insert(reporter);
                    } else {
                        warn!(node = %reporter, "Ledger status signature does not verify");
                    }
                }
                Ok(other) => {
                    debug!(node = %node_name, kind = other.kind(), "Unexpected ledger status reply")
                }
                Err(e) => debug!(node = %node_name, error = %e, "Ledger status request failed"),
            }
        }

        let needed = snapshot.max_faulty() + 1;
        votes
            .into_iter()
            .filter(|(_, nodes)| nodes.len() >= needed)
            .map(|((seq_no_end, _), _)| seq_no_end)
            .max()
            .ok_or_else(|| {
                Error::CatchupVerification(format!(
                    "no {} nodes agree on the pool ledger status",
                    needed
                ))
            })
    }

    /// Fetch `start..=end`, rotating through healthy nodes
    async fn fetch(
        &self,
        start: u64,
        end: u64,
    ) -> Result<(Vec<PoolTransaction>, ConsistencyProof)> {
        let snapshot = self.registry.snapshot();
        let nodes = self
            .connections
            .rank(snapshot.active_nodes().cloned().collect());

        let mut last_error = String::from("no active nodes");
        for node in nodes.iter().take(self.config.max_attempts) {
            match self
                .connections
                .exchange(node, &Message::CatchupRequest { start, end })
                .await
            {
                Ok(Message::CatchupReply {
                    transactions,
                    proof,
                }) => {
                    debug!(
                        node = %node.name,
                        start,
                        end,
                        count = transactions.len(),
                        "Catchup batch received"
                    );
                    return Ok((transactions, proof));
                }
                Ok(other) => {
                    last_error = format!("{} answered with {}", node.name, other.kind());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            warn!(node = %node.name, start, end, error = %last_error, "Catchup fetch failed");
        }

        Err(Error::CatchupVerification(format!(
            "unable to fetch transactions {}..={}: {}",
            start, end, last_error
        )))
    }
}

fn merge_target(current: Option<u64>, next: Option<u64>) -> Option<u64> {
    match (current, next) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Copy of a run's result for an extra waiter
fn share_result(result: &Result<CatchupOutcome>) -> Result<CatchupOutcome> {
    match result {
        Ok(outcome) => Ok(outcome.clone()),
        Err(Error::CatchupVerification(msg)) => Err(Error::CatchupVerification(msg.clone())),
        Err(Error::Concurrency(msg)) => Err(Error::Concurrency(msg.clone())),
        Err(Error::PoolClosed) => Err(Error::PoolClosed),
        Err(other) => Err(Error::CatchupVerification(other.to_string())),
    }
}

/// Check a fetched batch against its consistency proof
///
/// The batch was requested as `start..=end`. It may end early when the
/// network ledger is shorter, but it must end exactly where its proof does.
/// `signers` is the registry snapshot the proof's signatures are checked
/// against.
pub fn verify_batch(
    log: &PoolTransactionLog,
    batch: &[PoolTransaction],
    proof: &ConsistencyProof,
    start: u64,
    end: u64,
    signers: &RegistrySnapshot,
) -> Result<()> {
    let fail = |msg: String| Err(Error::CatchupVerification(msg));

    if batch.is_empty() {
        return fail(format!("empty batch for {}..={}", start, end));
    }
    if start != log.tail() + 1 {
        return fail(format!("batch starts at {} but log tail is {}", start, log.tail()));
    }
    for (offset, txn) in batch.iter().enumerate() {
        let expected = start + offset as u64;
        if txn.sequence_no != expected {
            return fail(format!(
                "non-contiguous batch: expected {}, found {}",
                expected, txn.sequence_no
            ));
        }
    }
    if proof.seq_no_end < start || proof.seq_no_end > end {
        return fail(format!(
            "proof ends at {} outside the requested {}..={}",
            proof.seq_no_end, start, end
        ));
    }
    let batch_end = start + batch.len() as u64 - 1;
    if batch_end != proof.seq_no_end {
        return fail(format!(
            "batch for {}..={} ends at {} but its proof ends at {}",
            start, end, batch_end, proof.seq_no_end
        ));
    }

    if proof.pool_root != log.root_hash_with(batch) {
        return fail("pool root does not match the extended log".into());
    }

    let digest = pool_ledger_digest(proof.seq_no_end, &proof.pool_root);
    let mut seen = BTreeSet::new();
    let mut valid = 0usize;
    for entry in &proof.multi_signature.signatures {
        if !seen.insert(entry.signer.as_str()) {
            continue;
        }
        let Some(verkey) = signers.validator_verkey(&entry.signer) else {
            continue;
        };
        if !verkey.verify(&digest, &entry.signature) {
            return fail(format!("consistency signature of {} does not verify", entry.signer));
        }
        valid += 1;
    }

    let needed = signers.max_faulty() + 1;
    if valid < needed {
        return fail(format!("{} of {} required consistency signatures", valid, needed));
    }
    Ok(())
}

/// Handle for sending messages to the catchup actor
#[derive(Debug, Clone)]
pub struct CatchupHandle {
    sender: mpsc::Sender<CatchupMessage>,
    state: watch::Receiver<CatchupState>,
    history: Arc<Mutex<Vec<CatchupState>>>,
}

impl std::fmt::Debug for CatchupMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatchupMessage::Trigger { target } => write!(f, "Trigger({:?})", target),
            CatchupMessage::Run { target, .. } => write!(f, "Run({:?})", target),
            CatchupMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl CatchupHandle {
    /// Ask for a catchup towards `target` without waiting
    ///
    /// Returns `false` if the mailbox is full or closed. A full mailbox
    /// already holds a pending run, which will pick up the newest state.
    pub fn trigger(&self, target: Option<u64>) -> bool {
        self.sender
            .try_send(CatchupMessage::Trigger { target })
            .is_ok()
    }

    /// Run a catchup and wait for its outcome
    ///
    /// With `target == None` the target is detected from the nodes.
    pub async fn run(&self, target: Option<u64>) -> Result<CatchupOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CatchupMessage::Run {
                target,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Catchup mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Current state
    pub fn state(&self) -> CatchupState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<CatchupState> {
        self.state.clone()
    }

    /// Every state entered so far, starting with the initial `Idle`
    pub fn history(&self) -> Vec<CatchupState> {
        self.history.lock().clone()
    }

    /// Ask the actor to stop without waiting; a run in progress finishes first
    pub fn request_shutdown(&self) -> bool {
        self.sender.try_send(CatchupMessage::Shutdown).is_ok()
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CatchupMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Catchup mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the catchup actor
pub fn spawn_catchup_manager(
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionManager>,
    config: CatchupConfig,
    metrics: Arc<PoolMetrics>,
) -> CatchupHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_size.max(1));
    let (state_tx, state_rx) = watch::channel(CatchupState::Idle);
    let history = Arc::new(Mutex::new(vec![CatchupState::Idle]));

    let manager = CatchupManager {
        registry,
        connections,
        config,
        metrics,
        mailbox: rx,
        state: state_tx,
        history: history.clone(),
    };

    tokio::spawn(async move {
        manager.run().await;
    });

    CatchupHandle {
        sender: tx,
        state: state_rx,
        history,
    }
}
