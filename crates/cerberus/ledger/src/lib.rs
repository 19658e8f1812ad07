//! Cerberus Ledger - the durable record of what the gate decided
//!
//! An append-only log of `ExecutionRecord`s grouped into hash-chained,
//! Merkle-rooted blocks. Records are immutable once appended; blocks are
//! immutable once sealed. Anchoring a block produces a new block value
//! rather than mutating the sealed one, so the chain never needs rewriting.
//!
//! The ledger is single-writer: all mutating methods take `&mut self` and
//! the gate serializes access behind one lock.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

use cerberus_crypto::content_hash;
use cerberus_types::{canonical_json, ExecutionRecord, RecordId, RequestId};

/// Hash the first block chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Duplicate record id: {0}")]
    DuplicateRecord(RecordId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A sealed block of records.
///
/// `merkle_root` commits to the records' content hashes;
/// `previous_block_hash` chains to the prior block. Anchor fields are
/// excluded from the block hash so anchoring never perturbs the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub block_id: u64,
    pub record_ids: Vec<RecordId>,
    pub record_count: usize,
    /// 64-char hex BLAKE3 Merkle root over the records' hashes.
    pub merkle_root: String,
    pub previous_block_hash: String,
    pub sealed_at: DateTime<Utc>,
    /// External timestamp proof over the Merkle root, once anchored.
    pub anchor_hash: Option<String>,
    pub anchored_at: Option<DateTime<Utc>>,
}

impl LedgerBlock {
    /// Hash linking the next block to this one.
    pub fn block_hash(&self) -> String {
        #[derive(Serialize)]
        struct Content<'a> {
            block_id: u64,
            merkle_root: &'a str,
            previous_block_hash: &'a str,
            record_count: usize,
            sealed_at: DateTime<Utc>,
        }
        let content = Content {
            block_id: self.block_id,
            merkle_root: &self.merkle_root,
            previous_block_hash: &self.previous_block_hash,
            record_count: self.record_count,
            sealed_at: self.sealed_at,
        };
        // Serialization of a plain struct of strings and ints cannot fail.
        let bytes = canonical_json(&content).unwrap_or_default();
        content_hash(&bytes)
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor_hash.is_some()
    }

    fn with_anchor(&self, anchor_hash: String) -> LedgerBlock {
        let mut anchored = self.clone();
        anchored.anchor_hash = Some(anchor_hash);
        anchored.anchored_at = Some(Utc::now());
        anchored
    }
}

/// Receipt for a successful append
#[derive(Clone, Debug)]
pub struct AppendReceipt {
    /// Content hash of the appended record.
    pub record_hash: String,
    /// The block sealed by this append, if it filled one.
    pub sealed_block: Option<LedgerBlock>,
}

/// Append-only execution ledger with block sealing.
pub struct DurableLedger {
    block_size: usize,
    records: HashMap<RecordId, ExecutionRecord>,
    record_hashes: HashMap<RecordId, String>,
    pending: Vec<RecordId>,
    blocks: Vec<LedgerBlock>,
}

impl DurableLedger {
    /// `block_size` records per block; sealing happens automatically when a
    /// block fills. A size of zero is treated as one.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            records: HashMap::new(),
            record_hashes: HashMap::new(),
            pending: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Append a record. Duplicate record ids are rejected and leave the
    /// ledger unchanged.
    pub fn append(&mut self, record: ExecutionRecord) -> Result<AppendReceipt, LedgerError> {
        if self.records.contains_key(&record.record_id) {
            return Err(LedgerError::DuplicateRecord(record.record_id));
        }

        let record_hash = content_hash(&canonical_json(&record)?);
        let record_id = record.record_id.clone();

        debug!(
            record_id = %record_id,
            request_id = %record.request_id,
            decision = %record.decision,
            "Ledger append"
        );

        self.record_hashes.insert(record_id.clone(), record_hash.clone());
        self.records.insert(record_id.clone(), record);
        self.pending.push(record_id);

        let sealed_block = if self.pending.len() >= self.block_size {
            self.seal_pending()
        } else {
            None
        };

        Ok(AppendReceipt {
            record_hash,
            sealed_block,
        })
    }

    /// Seal whatever is pending into a (possibly short) block. Returns
    /// `None` when nothing is pending.
    pub fn force_seal(&mut self) -> Option<LedgerBlock> {
        if self.pending.is_empty() {
            return None;
        }
        self.seal_pending()
    }

    fn seal_pending(&mut self) -> Option<LedgerBlock> {
        let record_ids = std::mem::take(&mut self.pending);
        let leaves: Vec<String> = record_ids
            .iter()
            .filter_map(|id| self.record_hashes.get(id).cloned())
            .collect();
        let merkle_root = merkle_root(&leaves);

        let previous_block_hash = self
            .blocks
            .last()
            .map(|b| b.block_hash())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let block = LedgerBlock {
            block_id: self.blocks.len() as u64,
            record_count: record_ids.len(),
            record_ids,
            merkle_root,
            previous_block_hash,
            sealed_at: Utc::now(),
            anchor_hash: None,
            anchored_at: None,
        };

        info!(
            block_id = block.block_id,
            record_count = block.record_count,
            merkle_root = %block.merkle_root,
            "Sealed ledger block"
        );

        self.blocks.push(block.clone());
        Some(block)
    }

    /// Attach an external anchor proof to a sealed block. Returns `false`
    /// for unknown blocks. Re-anchoring replaces the previous proof.
    pub fn anchor_block(&mut self, block_id: u64, anchor_hash: &str) -> bool {
        let Some(slot) = self.blocks.iter_mut().find(|b| b.block_id == block_id) else {
            return false;
        };
        *slot = slot.with_anchor(anchor_hash.to_string());
        info!(block_id = block_id, "Anchored ledger block");
        true
    }

    /// Recompute every record hash, Merkle root, and hash link from the
    /// stored records' content. A missing or altered record fails the check.
    pub fn verify_chain(&self) -> bool {
        let mut expected_previous = GENESIS_HASH.to_string();
        for block in &self.blocks {
            if block.previous_block_hash != expected_previous {
                return false;
            }
            let mut leaves = Vec::with_capacity(block.record_ids.len());
            for record_id in &block.record_ids {
                let Some(record) = self.records.get(record_id) else {
                    return false;
                };
                let Ok(bytes) = canonical_json(record) else {
                    return false;
                };
                leaves.push(content_hash(&bytes));
            }
            if leaves.len() != block.record_count || merkle_root(&leaves) != block.merkle_root {
                return false;
            }
            expected_previous = block.block_hash();
        }
        true
    }

    pub fn get_record(&self, record_id: &RecordId) -> Option<&ExecutionRecord> {
        self.records.get(record_id)
    }

    pub fn records_for_request(&self, request_id: &RequestId) -> Vec<&ExecutionRecord> {
        self.records
            .values()
            .filter(|r| &r.request_id == request_id)
            .collect()
    }

    pub fn get_block(&self, block_id: u64) -> Option<&LedgerBlock> {
        self.blocks.iter().find(|b| b.block_id == block_id)
    }

    pub fn blocks(&self) -> &[LedgerBlock] {
        &self.blocks
    }

    pub fn sealed_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn pending_record_count(&self) -> usize {
        self.pending.len()
    }

    pub fn total_records(&self) -> usize {
        self.records.len()
    }
}

/// Pairwise BLAKE3 Merkle root over hex leaf hashes. An odd leaf is paired
/// with itself. An empty leaf set hashes to the genesis constant.
fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return GENESIS_HASH.to_string();
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let combined = format!("{}{}", pair[0], right);
            next.push(content_hash(combined.as_bytes()));
        }
        level = next;
    }
    level.remove(0)
}
