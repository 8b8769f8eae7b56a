//! Simulated validator pool for tests and local experiments
//!
//! [`SimulatedPool`] holds a network-side pool ledger (which may run ahead
//! of the genesis handed to the client), a key pair per validator, and a
//! configurable behaviour per node. It answers requests in memory through
//! [`SimulatedTransport`] or over real TCP listeners via [`spawn_tcp`].

use crate::crypto::{hash_bytes, pool_ledger_digest, state_proof_digest, KeyPair};
use crate::merkle::MerkleTree;
use crate::network::transport::{read_frame, write_frame};
use crate::network::{NodeConnection, NodeTransport};
use crate::pool_log::PoolTransactionLog;
use crate::protocol::{ConsistencyProof, Message};
use crate::types::{
    canonical_payload, MultiSignature, NodeInfo, PoolTransaction, Reply, Request, StateProof,
    TxnMetadata, VALIDATOR_SERVICE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How a simulated node treats incoming traffic
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBehavior {
    /// Answers correctly with a fully signed proof
    Honest,
    /// Answers with this payload under a correctly signed proof
    RespondWith(Value),
    /// Refuses connections
    Unreachable,
    /// Accepts connections but drops them on every exchange
    Disconnect,
    /// Accepts requests and never answers
    Silent,
    /// Tampers with payloads and catchup batches after signing
    Forge,
    /// Answers without a state proof
    Malformed,
    /// Answers correctly after a delay
    Slow(Duration),
    /// Refuses requests before processing
    Nack(String),
    /// Rejects requests after processing
    Reject(String),
}

/// Builder for [`SimulatedPool`]
#[derive(Debug, Clone)]
pub struct SimulatedPoolBuilder {
    validators: usize,
    joining_validators: usize,
    genesis_len: Option<u64>,
    network_len: Option<u64>,
    addresses: Vec<String>,
    answer: Value,
}

impl Default for SimulatedPoolBuilder {
    fn default() -> Self {
        Self {
            validators: 4,
            joining_validators: 0,
            genesis_len: None,
            network_len: None,
            addresses: Vec::new(),
            answer: json!({"dest": "V4SGRU86Z58d6TV7PBUe6f", "verkey": "~CoRER63DVYnWZtK8uAzNbx"}),
        }
    }
}

impl SimulatedPoolBuilder {
    /// Validators present in genesis
    pub fn validators(mut self, count: usize) -> Self {
        self.validators = count.max(1);
        self
    }

    /// Validators that join after genesis (network ledger only)
    pub fn joining_validators(mut self, count: usize) -> Self {
        self.joining_validators = count;
        self
    }

    /// Length of the genesis handed to the client
    pub fn genesis_len(mut self, len: u64) -> Self {
        self.genesis_len = Some(len);
        self
    }

    /// Length of the network's pool ledger
    pub fn network_len(mut self, len: u64) -> Self {
        self.network_len = Some(len);
        self
    }

    /// Client addresses, one per validator (genesis then joining)
    pub fn addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Payload honest nodes answer with
    pub fn answer(mut self, answer: Value) -> Self {
        self.answer = answer;
        self
    }

    /// Build the pool
    ///
    /// The ledger starts with one transaction per genesis validator, then
    /// attribute updates up to `genesis_len`, then more updates and the
    /// joining validators up to `network_len`.
    pub fn build(self) -> Result<SimulatedPool> {
        let total = self.validators + self.joining_validators;
        let genesis_len = self.genesis_len.unwrap_or(self.validators as u64);
        let network_len = self
            .network_len
            .unwrap_or(genesis_len + self.joining_validators as u64);

        if genesis_len < self.validators as u64
            || network_len < genesis_len + self.joining_validators as u64
        {
            return Err(Error::Configuration(format!(
                "cannot lay out {} validators (+{} joining) in genesis {} / network {}",
                self.validators, self.joining_validators, genesis_len, network_len
            )));
        }

        let keys: Vec<KeyPair> = (0..total)
            .map(|i| KeyPair::from_seed(&seed_for(i)))
            .collect();
        let names: Vec<String> = (0..total).map(|i| format!("Node{}", i + 1)).collect();
        let address = |i: usize| {
            self.addresses
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("node{}.sim:{}", i + 1, 9700 + 2 * (i + 1)))
        };

        let node_txn = |seq: u64, i: usize| PoolTransaction {
            sequence_no: seq,
            node_identity: identity_for(i),
            node_verkey: keys[i].verkey(),
            node_address: Some(address(i)),
            metadata: TxnMetadata {
                alias: Some(names[i].clone()),
                services: Some(vec![VALIDATOR_SERVICE.to_string()]),
                attributes: BTreeMap::new(),
            },
        };
        let update_txn = |seq: u64, i: usize| PoolTransaction {
            sequence_no: seq,
            node_identity: identity_for(i),
            node_verkey: keys[i].verkey(),
            node_address: None,
            metadata: TxnMetadata {
                alias: None,
                services: None,
                attributes: BTreeMap::from([("revision".to_string(), seq.to_string())]),
            },
        };

        let mut transactions = Vec::with_capacity(network_len as usize);
        for i in 0..self.validators {
            transactions.push(node_txn(i as u64 + 1, i));
        }
        let joining_from = network_len - self.joining_validators as u64;
        for seq in (self.validators as u64 + 1)..=network_len {
            if seq > joining_from {
                let i = self.validators + (seq - joining_from - 1) as usize;
                transactions.push(node_txn(seq, i));
            } else {
                transactions.push(update_txn(seq, (seq as usize - 1) % self.validators));
            }
        }

        let network_log = PoolTransactionLog::from_genesis(transactions)?;
        info!(
            validators = self.validators,
            joining = self.joining_validators,
            genesis_len,
            network_len,
            "Simulated pool built"
        );

        Ok(SimulatedPool {
            keys,
            names,
            network_log,
            genesis_len,
            answer: self.answer,
            behaviors: parking_lot::RwLock::new(HashMap::new()),
            requests_seen: DashMap::new(),
        })
    }
}

fn seed_for(index: usize) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&(index as u64 + 1).to_be_bytes());
    seed[8..16].copy_from_slice(b"sim-node");
    seed
}

fn identity_for(index: usize) -> String {
    format!("did:sim:{}", index + 1)
}

/// In-process validator pool
#[derive(Debug)]
pub struct SimulatedPool {
    keys: Vec<KeyPair>,
    names: Vec<String>,
    network_log: PoolTransactionLog,
    genesis_len: u64,
    answer: Value,
    behaviors: parking_lot::RwLock<HashMap<String, NodeBehavior>>,
    requests_seen: DashMap<String, usize>,
}

impl SimulatedPool {
    /// Start building a pool
    pub fn builder() -> SimulatedPoolBuilder {
        SimulatedPoolBuilder::default()
    }

    /// Pool of `validators` honest nodes whose genesis matches the network
    pub fn new(validators: usize) -> Result<Self> {
        Self::builder().validators(validators).build()
    }

    /// Genesis transactions for the client
    pub fn genesis(&self) -> Vec<PoolTransaction> {
        self.network_log
            .transactions_from(1)
            .take(self.genesis_len as usize)
            .cloned()
            .collect()
    }

    /// The network's full pool ledger
    pub fn network_log(&self) -> &PoolTransactionLog {
        &self.network_log
    }

    /// Names of every node, genesis validators first
    pub fn node_names(&self) -> &[String] {
        &self.names
    }

    /// Payload honest nodes answer with
    pub fn answer(&self) -> &Value {
        &self.answer
    }

    /// Change a node's behaviour
    pub fn set_behavior(&self, node: &str, behavior: NodeBehavior) {
        self.behaviors.write().insert(node.to_string(), behavior);
    }

    /// Current behaviour of a node
    pub fn behavior(&self, node: &str) -> NodeBehavior {
        self.behaviors
            .read()
            .get(node)
            .cloned()
            .unwrap_or(NodeBehavior::Honest)
    }

    /// Client requests a node has received
    pub fn requests_seen(&self, node: &str) -> usize {
        self.requests_seen.get(node).map(|c| *c).unwrap_or(0)
    }

    fn signers(&self) -> impl Iterator<Item = (&str, &KeyPair)> {
        self.names.iter().map(String::as_str).zip(self.keys.iter())
    }

    fn index_of(&self, node: &str) -> Option<usize> {
        self.names.iter().position(|n| n == node)
    }

    /// Consistency proof for the first `seq_no_end` network transactions
    pub fn consistency_proof(&self, seq_no_end: u64) -> ConsistencyProof {
        let prefix: Vec<PoolTransaction> = self
            .network_log
            .transactions_from(1)
            .take(seq_no_end as usize)
            .cloned()
            .collect();
        let pool_root = PoolTransactionLog::new().root_hash_with(&prefix);
        let digest = pool_ledger_digest(seq_no_end, &pool_root);

        ConsistencyProof {
            seq_no_end,
            pool_root,
            multi_signature: MultiSignature::sign(&digest, self.signers()),
        }
    }

    /// Reply for `request` carrying `payload` under a fully signed proof
    pub fn signed_reply(&self, node: &str, request: &Request, payload: Value) -> Reply {
        // State tree of three entries: the answer, the operation and the request
        let mut tree = MerkleTree::from_leaves(vec![
            hash_bytes(&canonical_payload(&payload)),
            hash_bytes(request.operation_kind().as_bytes()),
            hash_bytes(request.request_id().as_bytes()),
        ]);
        let root_hash = tree.root();
        let path = tree
            .generate_proof(0)
            .map(|proof| proof.path)
            .unwrap_or_default();
        let pool_seq_no = self.network_log.tail();
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        let digest = state_proof_digest(&root_hash, pool_seq_no, timestamp);

        Reply {
            node_name: node.to_string(),
            request_id: request.request_id(),
            result_payload: payload,
            state_proof: Some(StateProof {
                root_hash,
                pool_seq_no,
                timestamp,
                inclusion_path: path,
                multi_signature: MultiSignature::sign(&digest, self.signers()),
            }),
            raw_timestamp: timestamp,
        }
    }

    /// Answer one message as `node` would; `None` means no answer
    pub fn respond(&self, node: &str, message: &Message) -> Option<Message> {
        let behavior = self.behavior(node);
        self.index_of(node)?;

        match message {
            Message::Request(request) => {
                *self.requests_seen.entry(node.to_string()).or_insert(0) += 1;
                let request_id = request.request_id();
                match behavior {
                    NodeBehavior::Nack(reason) => Some(Message::Nack { request_id, reason }),
                    NodeBehavior::Reject(reason) => Some(Message::Reject { request_id, reason }),
                    NodeBehavior::RespondWith(payload) => {
                        Some(Message::Reply(self.signed_reply(node, request, payload)))
                    }
                    NodeBehavior::Forge => {
                        let mut reply = self.signed_reply(node, request, self.answer.clone());
                        reply.result_payload = json!({"forged": true});
                        Some(Message::Reply(reply))
                    }
                    NodeBehavior::Malformed => {
                        let mut reply = self.signed_reply(node, request, self.answer.clone());
                        reply.state_proof = None;
                        Some(Message::Reply(reply))
                    }
                    NodeBehavior::Silent => None,
                    _ => Some(Message::Reply(self.signed_reply(
                        node,
                        request,
                        self.answer.clone(),
                    ))),
                }
            }
            Message::CatchupRequest { start, end } => {
                let end = (*end).min(self.network_log.tail());
                let mut transactions: Vec<PoolTransaction> = self
                    .network_log
                    .transactions_from(*start)
                    .take_while(|t| t.sequence_no <= end)
                    .cloned()
                    .collect();
                if behavior == NodeBehavior::Forge {
                    if let Some(first) = transactions.first_mut() {
                        first
                            .metadata
                            .attributes
                            .insert("forged".to_string(), "true".to_string());
                    }
                }
                debug!(node, start, end, "Serving catchup batch");
                Some(Message::CatchupReply {
                    transactions,
                    proof: self.consistency_proof(end),
                })
            }
            Message::LedgerStatusRequest => Some(Message::LedgerStatus {
                node_name: node.to_string(),
                proof: self.consistency_proof(self.network_log.tail()),
            }),
            _ => None,
        }
    }

    /// Node info as a client would derive it from the network ledger
    pub fn node_info(&self, node: &str) -> Option<NodeInfo> {
        let i = self.index_of(node)?;
        let address = self
            .network_log
            .transactions_from(1)
            .filter(|t| t.node_identity == identity_for(i))
            .find_map(|t| t.node_address.clone())?;
        Some(NodeInfo {
            name: node.to_string(),
            identity: identity_for(i),
            address,
            verkey: self.keys[i].verkey(),
            is_active: true,
        })
    }
}

/// In-memory transport into a [`SimulatedPool`]
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    pool: Arc<SimulatedPool>,
}

impl SimulatedTransport {
    /// Transport into `pool`
    pub fn new(pool: Arc<SimulatedPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeTransport for SimulatedTransport {
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn NodeConnection>> {
        if self.pool.behavior(&node.name) == NodeBehavior::Unreachable {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", node.name),
            )));
        }
        Ok(Box::new(SimulatedConnection {
            pool: self.pool.clone(),
            node: node.name.clone(),
        }))
    }
}

struct SimulatedConnection {
    pool: Arc<SimulatedPool>,
    node: String,
}

#[async_trait]
impl NodeConnection for SimulatedConnection {
    async fn exchange(&mut self, message: &Message) -> Result<Message> {
        match self.pool.behavior(&self.node) {
            NodeBehavior::Disconnect | NodeBehavior::Unreachable => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            NodeBehavior::Slow(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        match self.pool.respond(&self.node, message) {
            Some(answer) => Ok(answer),
            None => std::future::pending::<Result<Message>>().await,
        }
    }
}

/// Simulated pool served over TCP on loopback
#[derive(Debug)]
pub struct TcpSimulation {
    /// The pool behind the listeners
    pub pool: Arc<SimulatedPool>,
    /// One accept loop per node
    pub servers: Vec<JoinHandle<()>>,
}

impl Drop for TcpSimulation {
    fn drop(&mut self) {
        for server in &self.servers {
            server.abort();
        }
    }
}

/// Bind one loopback listener per node and serve `builder`'s pool on them
pub async fn spawn_tcp(builder: SimulatedPoolBuilder) -> Result<TcpSimulation> {
    let nodes = builder.validators + builder.joining_validators;
    let mut listeners = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        listeners.push(TcpListener::bind("127.0.0.1:0").await?);
    }
    let addresses = listeners
        .iter()
        .map(|l| l.local_addr().map(|a| a.to_string()))
        .collect::<io::Result<Vec<_>>>()?;

    let pool = Arc::new(builder.addresses(addresses).build()?);
    let servers = listeners
        .into_iter()
        .zip(pool.node_names().to_vec())
        .map(|(listener, name)| tokio::spawn(serve_node(pool.clone(), name, listener)))
        .collect();

    Ok(TcpSimulation { pool, servers })
}

async fn serve_node(pool: Arc<SimulatedPool>, node: String, listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if pool.behavior(&node) == NodeBehavior::Unreachable {
            continue;
        }

        let pool = pool.clone();
        let node = node.clone();
        tokio::spawn(async move {
            while let Ok(message) = read_frame(&mut stream).await {
                match pool.behavior(&node) {
                    NodeBehavior::Disconnect | NodeBehavior::Unreachable => return,
                    NodeBehavior::Slow(delay) => tokio::time::sleep(delay).await,
                    _ => {}
                }
                let Some(answer) = pool.respond(&node, &message) else {
                    continue;
                };
                if write_frame(&mut stream, &answer).await.is_err() {
                    return;
                }
            }
        });
    }
}
