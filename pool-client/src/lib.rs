//! Ledger Pool Client
//!
//! Client for a permissioned validator pool that answers reads and writes
//! under byzantine fault tolerance.
//!
//! # Architecture
//!
//! - **Pool ledger**: Append-only log of membership transactions, Merkle-rooted
//! - **Registry**: Immutable node snapshots derived from the pool ledger
//! - **Dispatcher**: Concurrent fan-out with per-request quorum and deadline
//! - **Verifier**: State proofs checked against the registry's validator keys
//! - **Catchup**: Single actor that fetches and verifies newer pool transactions
//!
//! # Invariants
//!
//! - A result is only returned when a quorum of distinct nodes agree
//! - Pool ledger sequence numbers stay contiguous from 1
//! - Catchup batches are appended only after their consistency proof verifies

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod catchup;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod merkle;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod pool_log;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod testkit;
pub mod types;
pub mod verifier;

// Re-exports
pub use catchup::{CatchupOutcome, CatchupState};
pub use config::{PoolConfig, QuorumPolicy};
pub use dispatcher::{RequestKind, RequestPolicy};
pub use error::{Error, Result};
pub use pool::PoolHandle;
pub use registry::RegistrySnapshot;
pub use runner::PoolRunner;
pub use types::{
    ConsensusResult, NoConsensusReason, NodeInfo, PoolTransaction, Reply, Request, StateProof,
    VerifiedReply,
};
