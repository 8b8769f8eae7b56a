//! Open pool handle
//!
//! A [`PoolHandle`] ties together the node registry, the connections, the
//! dispatcher and the catchup actor for one validator pool. Dropping it
//! closes the pool.

use crate::catchup::{spawn_catchup_manager, CatchupHandle, CatchupOutcome, CatchupState};
use crate::config::PoolConfig;
use crate::crypto::Hash;
use crate::dispatcher::{Dispatcher, RequestPolicy};
use crate::metrics::PoolMetrics;
use crate::network::{ConnectionManager, NodeTransport, TcpTransport};
use crate::pool_log::PoolTransactionLog;
use crate::registry::{NodeRegistry, RegistrySnapshot};
use crate::types::{ConsensusResult, NodeInfo, PoolTransaction, Request};
use crate::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Handle to an open validator pool
#[derive(Debug)]
pub struct PoolHandle {
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionManager>,
    dispatcher: Dispatcher,
    catchup: CatchupHandle,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
    closed: AtomicBool,
}

impl PoolHandle {
    /// Open a pool over TCP from genesis transactions
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(genesis: Vec<PoolTransaction>, config: PoolConfig) -> Result<Self> {
        Self::open_with_transport(genesis, config, Arc::new(TcpTransport::new())).await
    }

    /// Open a pool from a genesis file (one JSON transaction per line)
    pub async fn open_from_file(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let log = PoolTransactionLog::from_json_file(path)?;
        Self::from_log(log, config, Arc::new(TcpTransport::new()))
    }

    /// Open a pool over a caller-supplied transport
    pub async fn open_with_transport(
        genesis: Vec<PoolTransaction>,
        config: PoolConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        let log = PoolTransactionLog::from_genesis(genesis)?;
        Self::from_log(log, config, transport)
    }

    fn from_log(
        log: PoolTransactionLog,
        config: PoolConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(
            PoolMetrics::new()
                .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?,
        );
        let registry = Arc::new(NodeRegistry::new(log)?);
        let connections = Arc::new(ConnectionManager::new(transport, &config, metrics.clone()));
        let catchup = spawn_catchup_manager(
            registry.clone(),
            connections.clone(),
            config.catchup.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            connections.clone(),
            config.clone(),
            metrics.clone(),
            Some(catchup.clone()),
        );

        let snapshot = registry.snapshot();
        metrics.set_generation(snapshot.generation());
        info!(
            nodes = snapshot.len(),
            active = snapshot.active_count(),
            pool_seq_no = snapshot.pool_seq_no(),
            "Pool opened"
        );

        Ok(Self {
            registry,
            connections,
            dispatcher,
            catchup,
            config,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Submit a request and wait for its consensus result
    pub async fn submit(
        &self,
        request: &Request,
        policy: &RequestPolicy,
    ) -> Result<ConsensusResult> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        self.dispatcher.submit(request, policy).await
    }

    /// Detect and fetch newer pool transactions now
    pub async fn refresh(&self) -> Result<CatchupOutcome> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        self.catchup.run(None).await
    }

    /// Release all connections and stop the catchup actor; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connections.close_all();
        self.catchup.request_shutdown();
        info!("Pool closed");
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current registry snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    /// Nodes known to the current snapshot
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.registry.current_nodes()
    }

    /// Pool ledger root of the current snapshot
    pub fn last_known_root_hash(&self) -> Hash {
        *self.registry.snapshot().pool_root()
    }

    /// Local pool ledger size
    pub fn pool_seq_no(&self) -> u64 {
        self.registry.snapshot().pool_seq_no()
    }

    /// Registry generation
    pub fn generation(&self) -> u64 {
        self.registry.generation()
    }

    /// Current catchup state
    pub fn catchup_state(&self) -> CatchupState {
        self.catchup.state()
    }

    /// Every catchup state entered since the pool was opened
    pub fn catchup_history(&self) -> Vec<CatchupState> {
        self.catchup.history()
    }

    /// Watch catchup state changes
    pub fn subscribe_catchup(&self) -> watch::Receiver<CatchupState> {
        self.catchup.subscribe()
    }

    /// Live node connections
    pub fn open_connections(&self) -> usize {
        self.connections.open_connections()
    }

    /// Health score of a node, if it has been contacted
    pub fn health_of(&self, node: &str) -> Option<f64> {
        self.connections.health_of(node)
    }

    /// Pool transactions as newline-delimited JSON, for caching to disk
    pub fn pool_transactions_json(&self) -> Result<String> {
        self.registry.with_log(|log| log.to_json_lines())
    }

    /// Configuration the pool was opened with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool metrics
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.close();
    }
}
