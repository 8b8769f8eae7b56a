//! Connection management for validator nodes
//!
//! One slot per node holds at most one live connection. A slot's async mutex
//! serializes exchanges on that connection; its link state (backoff and
//! health) sits behind a short synchronous lock.
//!
//! Connections are dialed lazily on first use. After a failed dial the node
//! is in backoff, and sends fail fast with `NodeUnreachable` until the
//! backoff window has passed.

pub mod backoff;
pub mod health;
pub mod transport;

pub use backoff::Backoff;
pub use health::HealthScore;
pub use transport::{NodeConnection, NodeTransport, TcpTransport};

use crate::config::{HealthConfig, PoolConfig};
use crate::metrics::PoolMetrics;
use crate::protocol::Message;
use crate::types::NodeInfo;
use crate::{Error, Result};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LinkState {
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    health: HealthScore,
    live: bool,
}

struct NodeSlot {
    connection: tokio::sync::Mutex<Option<Box<dyn NodeConnection>>>,
    link: parking_lot::Mutex<LinkState>,
}

impl NodeSlot {
    fn new() -> Self {
        Self {
            connection: tokio::sync::Mutex::new(None),
            link: parking_lot::Mutex::new(LinkState::default()),
        }
    }
}

/// Owner of all node connections for one pool
pub struct ConnectionManager {
    transport: Arc<dyn NodeTransport>,
    slots: DashMap<String, Arc<NodeSlot>>,
    connect_timeout: Duration,
    reply_timeout: Duration,
    backoff: Backoff,
    health_config: HealthConfig,
    metrics: Arc<PoolMetrics>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("nodes", &self.slots.len())
            .field("open_connections", &self.open_connections())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager over `transport`
    pub fn new(
        transport: Arc<dyn NodeTransport>,
        config: &PoolConfig,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            transport,
            slots: DashMap::new(),
            connect_timeout: config.connect_timeout(),
            reply_timeout: config.reply_timeout(),
            backoff: Backoff::new(config.backoff.clone()),
            health_config: config.health.clone(),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, name: &str) -> Arc<NodeSlot> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NodeSlot::new()))
            .clone()
    }

    /// Send `message` to `node` on a background task
    ///
    /// The exchange runs to completion (or timeout) even if the returned
    /// handle is dropped, so abandoned requests never leave a connection
    /// half-read.
    pub fn send(self: &Arc<Self>, node: &NodeInfo, message: Message) -> PendingReply {
        let manager = Arc::clone(self);
        let node = node.clone();
        let node_name = node.name.clone();
        let handle = tokio::spawn(async move { manager.exchange(&node, &message).await });

        PendingReply { node_name, handle }
    }

    /// Send `message` to `node` and wait for the answer
    pub async fn exchange(&self, node: &NodeInfo, message: &Message) -> Result<Message> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let slot = self.slot(&node.name);
        let mut guard = slot.connection.lock().await;

        if self.is_closed() {
            self.drop_connection(&slot, &mut guard);
            return Err(Error::PoolClosed);
        }

        if guard.is_none() {
            let connection = self.dial(node, &slot).await?;
            *guard = Some(connection);
            slot.link.lock().live = true;
            self.metrics.open_connections.inc();
        }

        let Some(connection) = guard.as_mut() else {
            return Err(Error::unreachable(&node.name, "no connection"));
        };

        let started = Instant::now();
        let outcome = timeout(self.reply_timeout, connection.exchange(message)).await;

        match outcome {
            Ok(Ok(reply)) => {
                {
                    let mut link = slot.link.lock();
                    link.health.record_success(started.elapsed(), &self.health_config);
                    link.consecutive_failures = 0;
                    link.retry_at = None;
                }
                if self.is_closed() {
                    self.drop_connection(&slot, &mut guard);
                }
                Ok(reply)
            }
            Ok(Err(e)) => {
                self.drop_connection(&slot, &mut guard);
                slot.link.lock().health.record_failure(&self.health_config);
                self.metrics.record_node_failure("disconnected");
                warn!(node = %node.name, error = %e, "Connection dropped mid-flight");
                Err(Error::disconnected(&node.name, e.to_string()))
            }
            Err(_) => {
                // A late reply must never be read as the answer to the next request
                self.drop_connection(&slot, &mut guard);
                slot.link.lock().health.record_failure(&self.health_config);
                self.metrics.record_node_failure("disconnected");
                warn!(node = %node.name, timeout = ?self.reply_timeout, "Reply timed out");
                Err(Error::disconnected(&node.name, "reply timeout"))
            }
        }
    }

    async fn dial(&self, node: &NodeInfo, slot: &NodeSlot) -> Result<Box<dyn NodeConnection>> {
        let retry_at = slot.link.lock().retry_at;
        if let Some(retry_at) = retry_at {
            let now = Instant::now();
            if retry_at > now {
                return Err(Error::unreachable(
                    &node.name,
                    format!("in backoff for another {:?}", retry_at - now),
                ));
            }
        }

        let failure = match timeout(self.connect_timeout, self.transport.connect(node)).await {
            Ok(Ok(connection)) => {
                debug!(node = %node.name, address = %node.address, "Connected");
                return Ok(connection);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dial timeout after {:?}", self.connect_timeout),
        };

        let delay = {
            let mut link = slot.link.lock();
            link.consecutive_failures = link.consecutive_failures.saturating_add(1);
            link.health.record_failure(&self.health_config);
            let delay = self.backoff.delay(link.consecutive_failures);
            link.retry_at = Some(Instant::now() + delay);
            delay
        };
        self.metrics.record_node_failure("unreachable");
        warn!(node = %node.name, error = %failure, retry_in = ?delay, "Dial failed");

        Err(Error::unreachable(&node.name, failure))
    }

    fn drop_connection(&self, slot: &NodeSlot, guard: &mut Option<Box<dyn NodeConnection>>) {
        if guard.take().is_some() {
            slot.link.lock().live = false;
            self.metrics.open_connections.dec();
        }
    }

    /// Order `nodes` for dispatch
    ///
    /// Higher health bucket first, ties broken randomly, nodes below the
    /// health floor after all others.
    pub fn rank(&self, mut nodes: Vec<NodeInfo>) -> Vec<NodeInfo> {
        nodes.shuffle(&mut rand::thread_rng());

        let mut keyed: Vec<(bool, Reverse<u8>, NodeInfo)> = nodes
            .into_iter()
            .map(|node| {
                let health = self
                    .slots
                    .get(&node.name)
                    .map(|slot| slot.link.lock().health.clone())
                    .unwrap_or_default();
                let below_floor = health.below_floor(&self.health_config);
                (below_floor, Reverse(health.bucket()), node)
            })
            .collect();

        // Stable sort keeps the shuffled order inside a bucket
        keyed.sort_by_key(|(below_floor, bucket, _)| (*below_floor, *bucket));
        keyed.into_iter().map(|(_, _, node)| node).collect()
    }

    /// Health score of a node, if it has been contacted
    pub fn health_of(&self, name: &str) -> Option<f64> {
        self.slots.get(name).map(|slot| slot.link.lock().health.score())
    }

    /// Number of live connections
    pub fn open_connections(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.link.lock().live)
            .count()
    }

    /// Whether the manager has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every connection; idempotent
    ///
    /// Idle connections are dropped immediately. Connections busy with an
    /// exchange are dropped by that exchange when it finishes.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut released = 0usize;
        for entry in self.slots.iter() {
            let slot = entry.value();
            if let Ok(mut guard) = slot.connection.try_lock() {
                if guard.is_some() {
                    self.drop_connection(slot, &mut guard);
                    released += 1;
                }
            }
        }
        info!(released, "Closed node connections");
    }
}

/// Handle to an in-flight exchange with one node
#[derive(Debug)]
pub struct PendingReply {
    node_name: String,
    handle: JoinHandle<Result<Message>>,
}

impl PendingReply {
    /// Node the request was sent to
    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

impl Future for PendingReply {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| Err(Error::Concurrency(format!("send task failed: {}", e))))
        })
    }
}
