//! Node registry derived from the pool transaction log
//!
//! The registry owns the log. Every successful append rebuilds the node set
//! from scratch and publishes it as a new immutable [`RegistrySnapshot`] with
//! a bumped generation. Readers clone the current `Arc` and keep using it for
//! the lifetime of their request, so they never observe a half-applied
//! update.

use crate::consensus::{bft_quorum, max_faulty};
use crate::crypto::{Hash, VerKey};
use crate::pool_log::PoolTransactionLog;
use crate::types::{NodeInfo, PoolTransaction, VALIDATOR_SERVICE};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Consistent view of the validator set at one log position
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    generation: u64,
    nodes: BTreeMap<String, NodeInfo>,
    pool_seq_no: u64,
    pool_root: Hash,
}

impl RegistrySnapshot {
    /// Rebuild counter this snapshot was produced at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pool ledger size the snapshot was derived from
    pub fn pool_seq_no(&self) -> u64 {
        self.pool_seq_no
    }

    /// Pool ledger root the snapshot was derived from
    pub fn pool_root(&self) -> &Hash {
        &self.pool_root
    }

    /// All known nodes, active or not
    pub fn current_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Nodes currently offering the validator service
    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.is_active)
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is known
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of active validators
    pub fn active_count(&self) -> usize {
        self.active_nodes().count()
    }

    /// Look up a node by name
    pub fn node_by_name(&self, name: &str) -> Result<&NodeInfo> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// Verification key of an active validator
    pub fn validator_verkey(&self, name: &str) -> Option<&VerKey> {
        self.nodes
            .get(name)
            .filter(|n| n.is_active)
            .map(|n| &n.verkey)
    }

    /// Faulty validators tolerated by the active set
    pub fn max_faulty(&self) -> usize {
        max_faulty(self.active_count())
    }

    /// Default BFT quorum for the active set
    pub fn bft_quorum(&self) -> usize {
        bft_quorum(self.active_count())
    }
}

#[derive(Debug, Clone)]
struct NodeFold {
    identity: String,
    alias: String,
    address: Option<String>,
    verkey: VerKey,
    active: bool,
}

/// Fold the full log into the node set
///
/// Transactions are keyed by node identity; later entries override only the
/// fields they carry. Nodes without an address or with an unusable key are
/// skipped rather than failing the whole registry.
fn derive_nodes<'a>(
    transactions: impl Iterator<Item = &'a PoolTransaction>,
) -> BTreeMap<String, NodeInfo> {
    let mut folds: BTreeMap<String, NodeFold> = BTreeMap::new();

    for txn in transactions {
        match folds.get_mut(&txn.node_identity) {
            Some(fold) => {
                if let Some(alias) = &txn.metadata.alias {
                    if alias != &fold.alias {
                        warn!(
                            identity = %txn.node_identity,
                            "Ignoring alias change from {} to {}", fold.alias, alias
                        );
                    }
                }
                if let Some(address) = &txn.node_address {
                    fold.address = Some(address.clone());
                }
                fold.verkey = txn.node_verkey;
                if let Some(services) = &txn.metadata.services {
                    fold.active = services.iter().any(|s| s == VALIDATOR_SERVICE);
                }
            }
            None => {
                let Some(alias) = txn.metadata.alias.clone() else {
                    warn!(
                        identity = %txn.node_identity,
                        sequence_no = txn.sequence_no,
                        "Skipped: first transaction for node has no alias"
                    );
                    continue;
                };
                let active = txn
                    .metadata
                    .services
                    .as_ref()
                    .map(|s| s.iter().any(|s| s == VALIDATOR_SERVICE))
                    .unwrap_or(false);
                folds.insert(
                    txn.node_identity.clone(),
                    NodeFold {
                        identity: txn.node_identity.clone(),
                        alias,
                        address: txn.node_address.clone(),
                        verkey: txn.node_verkey,
                        active,
                    },
                );
            }
        }
    }

    folds
        .into_values()
        .filter_map(|fold| {
            let Some(address) = fold.address else {
                info!("Skipped: node '{}' has no client address", fold.alias);
                return None;
            };
            if !fold.verkey.is_valid() {
                info!("Skipped: node '{}' has an invalid verkey", fold.alias);
                return None;
            }
            Some((
                fold.alias.clone(),
                NodeInfo {
                    name: fold.alias,
                    identity: fold.identity,
                    address,
                    verkey: fold.verkey,
                    is_active: fold.active,
                },
            ))
        })
        .collect()
}

/// Owner of the pool log and its derived node set
#[derive(Debug)]
pub struct NodeRegistry {
    /// Serializes appends; held across append + rebuild + publish
    log: Mutex<PoolTransactionLog>,
    /// Current published snapshot
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl NodeRegistry {
    /// Create a registry over an existing log
    pub fn new(log: PoolTransactionLog) -> Result<Self> {
        let snapshot = Self::build_snapshot(&log, 1);
        if snapshot.active_count() == 0 {
            return Err(Error::PoolOpen(
                "Genesis defines no active validator nodes".to_string(),
            ));
        }

        Ok(Self {
            log: Mutex::new(log),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn build_snapshot(log: &PoolTransactionLog, generation: u64) -> RegistrySnapshot {
        RegistrySnapshot {
            generation,
            nodes: derive_nodes(log.transactions_from(1)),
            pool_seq_no: log.tail(),
            pool_root: log.root_hash(),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Current generation counter
    pub fn generation(&self) -> u64 {
        self.snapshot.read().generation
    }

    /// Nodes of the current snapshot
    pub fn current_nodes(&self) -> Vec<NodeInfo> {
        self.snapshot().current_nodes().cloned().collect()
    }

    /// Look up a node in the current snapshot
    pub fn node_by_name(&self, name: &str) -> Result<NodeInfo> {
        self.snapshot().node_by_name(name).cloned()
    }

    /// Append a batch to the log and publish the rebuilt snapshot
    ///
    /// `verify` runs under the append lock against the log as it stands, so
    /// no other append can slip in between verification and mutation.
    pub fn append_verified<F>(
        &self,
        batch: Vec<PoolTransaction>,
        verify: F,
    ) -> Result<Arc<RegistrySnapshot>>
    where
        F: FnOnce(&PoolTransactionLog, &[PoolTransaction]) -> Result<()>,
    {
        let mut log = self.log.lock();
        verify(&log, &batch)?;
        log.append_batch(batch)?;

        let generation = self.generation() + 1;
        let snapshot = Arc::new(Self::build_snapshot(&log, generation));
        *self.snapshot.write() = snapshot.clone();

        info!(
            generation,
            pool_seq_no = snapshot.pool_seq_no(),
            active_nodes = snapshot.active_count(),
            "Node registry rebuilt"
        );
        Ok(snapshot)
    }

    /// Append a batch without extra verification
    pub fn append(&self, batch: Vec<PoolTransaction>) -> Result<Arc<RegistrySnapshot>> {
        self.append_verified(batch, |_, _| Ok(()))
    }

    /// Run `f` with read access to the log
    pub fn with_log<R>(&self, f: impl FnOnce(&PoolTransactionLog) -> R) -> R {
        f(&self.log.lock())
    }
}
