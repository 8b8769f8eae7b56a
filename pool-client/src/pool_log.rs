//! Pool transaction log
//!
//! Ordered, append-only record of validator-set membership transactions.
//! It is the only source of node identities and verification keys.
//!
//! # Invariants
//!
//! - Sequence numbers are contiguous starting at 1
//! - Entries are never modified or removed
//! - A failed append (single or batch) leaves the log untouched

use crate::crypto::Hash;
use crate::merkle::merkle_root;
use crate::types::PoolTransaction;
use crate::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Append-only pool transaction log
#[derive(Debug, Clone, Default)]
pub struct PoolTransactionLog {
    /// Transactions, index `i` holds sequence number `i + 1`
    transactions: Vec<PoolTransaction>,
    /// Leaf hashes, parallel to `transactions`
    leaf_hashes: Vec<Hash>,
}

impl PoolTransactionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from trusted genesis transactions
    ///
    /// Fails if genesis is empty or its sequence numbers are not 1..=n.
    pub fn from_genesis(genesis: Vec<PoolTransaction>) -> Result<Self> {
        if genesis.is_empty() {
            return Err(Error::PoolOpen("No genesis transactions found".to_string()));
        }

        let mut log = Self::new();
        log.append_batch(genesis)
            .map_err(|e| Error::PoolOpen(format!("Inconsistent genesis: {}", e)))?;
        Ok(log)
    }

    /// Load genesis from newline-delimited JSON (one transaction per line)
    pub fn from_json_str(content: &str) -> Result<Self> {
        let genesis = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<PoolTransaction>(line).map_err(|e| {
                    Error::PoolOpen(format!("Error parsing genesis transaction: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_genesis(genesis)
    }

    /// Load genesis from a file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::PoolOpen(format!(
                "Can't open genesis transactions file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    /// Encode as newline-delimited JSON
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for txn in &self.transactions {
            out.push_str(&serde_json::to_string(txn)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Append one transaction
    pub fn append(&mut self, transaction: PoolTransaction) -> Result<()> {
        Self::check_next(self.tail(), transaction.sequence_no)?;
        self.push(transaction);
        Ok(())
    }

    /// Append a batch atomically
    ///
    /// Every entry is validated against the running tail before anything is
    /// stored, so a failure at any position leaves the log unchanged.
    pub fn append_batch(&mut self, batch: Vec<PoolTransaction>) -> Result<()> {
        let mut tail = self.tail();
        for txn in &batch {
            Self::check_next(tail, txn.sequence_no)?;
            tail = txn.sequence_no;
        }

        debug!(
            count = batch.len(),
            from = self.tail() + 1,
            to = tail,
            "Appending pool transactions"
        );
        for txn in batch {
            self.push(txn);
        }
        Ok(())
    }

    fn check_next(tail: u64, sequence_no: u64) -> Result<()> {
        if sequence_no >= 1 && sequence_no <= tail {
            return Err(Error::Duplicate(sequence_no));
        }
        if sequence_no != tail + 1 {
            return Err(Error::SequenceGap {
                expected: tail + 1,
                found: sequence_no,
            });
        }
        Ok(())
    }

    fn push(&mut self, transaction: PoolTransaction) {
        self.leaf_hashes.push(transaction.hash());
        self.transactions.push(transaction);
    }

    /// Sequence number of the last entry (0 when empty)
    pub fn tail(&self) -> u64 {
        self.transactions.len() as u64
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Transaction with the given sequence number
    pub fn get(&self, sequence_no: u64) -> Option<&PoolTransaction> {
        let index = usize::try_from(sequence_no.checked_sub(1)?).ok()?;
        self.transactions.get(index)
    }

    /// Entries with `sequence_no >= from`, in order
    ///
    /// The iterator is lazy and finite; cloning it restarts from the same
    /// position.
    pub fn transactions_from(
        &self,
        from: u64,
    ) -> impl Iterator<Item = &PoolTransaction> + Clone + '_ {
        let skip = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        self.transactions.iter().skip(skip)
    }

    /// Merkle root over all transaction hashes
    pub fn root_hash(&self) -> Hash {
        merkle_root(&self.leaf_hashes)
    }

    /// Root the log would have after appending `extra`
    pub fn root_hash_with(&self, extra: &[PoolTransaction]) -> Hash {
        let mut leaves = self.leaf_hashes.clone();
        leaves.extend(extra.iter().map(PoolTransaction::hash));
        merkle_root(&leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::TxnMetadata;

    fn txn(sequence_no: u64) -> PoolTransaction {
        PoolTransaction {
            sequence_no,
            node_identity: format!("id{}", sequence_no),
            node_verkey: KeyPair::from_seed(&[sequence_no as u8; 32]).verkey(),
            node_address: Some(format!("127.0.0.1:{}", 9700 + sequence_no)),
            metadata: TxnMetadata {
                alias: Some(format!("Node{}", sequence_no)),
                services: Some(vec!["VALIDATOR".into()]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_genesis_must_not_be_empty() {
        assert!(matches!(
            PoolTransactionLog::from_genesis(vec![]),
            Err(Error::PoolOpen(_))
        ));
    }

    #[test]
    fn test_genesis_must_be_contiguous() {
        let result = PoolTransactionLog::from_genesis(vec![txn(1), txn(3)]);
        assert!(matches!(result, Err(Error::PoolOpen(_))));

        let result = PoolTransactionLog::from_genesis(vec![txn(1), txn(1)]);
        assert!(matches!(result, Err(Error::PoolOpen(_))));

        let result = PoolTransactionLog::from_genesis(vec![txn(2)]);
        assert!(matches!(result, Err(Error::PoolOpen(_))));
    }

    #[test]
    fn test_append_rejects_gap_and_duplicate() {
        let mut log = PoolTransactionLog::from_genesis(vec![txn(1), txn(2)]).unwrap();

        assert!(matches!(
            log.append(txn(4)),
            Err(Error::SequenceGap { expected: 3, found: 4 })
        ));
        assert!(matches!(log.append(txn(2)), Err(Error::Duplicate(2))));
        assert_eq!(log.len(), 2);

        log.append(txn(3)).unwrap();
        assert_eq!(log.tail(), 3);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut log = PoolTransactionLog::from_genesis(vec![txn(1)]).unwrap();
        let root = log.root_hash();

        let result = log.append_batch(vec![txn(2), txn(3), txn(5)]);
        assert!(result.is_err());
        assert_eq!(log.tail(), 1);
        assert_eq!(log.root_hash(), root);

        log.append_batch(vec![txn(2), txn(3)]).unwrap();
        assert_eq!(log.tail(), 3);
    }

    #[test]
    fn test_transactions_from_is_restartable() {
        let log = PoolTransactionLog::from_genesis((1..=5).map(txn).collect()).unwrap();

        let iter = log.transactions_from(3);
        let first: Vec<u64> = iter.clone().map(|t| t.sequence_no).collect();
        let second: Vec<u64> = iter.map(|t| t.sequence_no).collect();
        assert_eq!(first, vec![3, 4, 5]);
        assert_eq!(first, second);

        assert_eq!(log.transactions_from(0).count(), 5);
        assert_eq!(log.transactions_from(6).count(), 0);
        assert_eq!(log.get(5).map(|t| t.sequence_no), Some(5));
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_root_hash_with_matches_after_append() {
        let mut log = PoolTransactionLog::from_genesis(vec![txn(1), txn(2)]).unwrap();
        let predicted = log.root_hash_with(&[txn(3), txn(4)]);
        log.append_batch(vec![txn(3), txn(4)]).unwrap();
        assert_eq!(log.root_hash(), predicted);
    }

    #[test]
    fn test_json_lines_roundtrip() {
        let log = PoolTransactionLog::from_genesis((1..=4).map(txn).collect()).unwrap();
        let encoded = log.to_json_lines().unwrap();
        assert_eq!(encoded.lines().count(), 4);

        let decoded = PoolTransactionLog::from_json_str(&encoded).unwrap();
        assert_eq!(decoded.root_hash(), log.root_hash());
    }

    #[test]
    fn test_from_json_file() {
        let log = PoolTransactionLog::from_genesis((1..=4).map(txn).collect()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_genesis.txn");
        std::fs::write(&path, log.to_json_lines().unwrap()).unwrap();

        let loaded = PoolTransactionLog::from_json_file(&path).unwrap();
        assert_eq!(loaded.tail(), 4);

        assert!(PoolTransactionLog::from_json_file(dir.path().join("missing")).is_err());
        assert!(PoolTransactionLog::from_json_str("{invalid}").is_err());
    }
}
