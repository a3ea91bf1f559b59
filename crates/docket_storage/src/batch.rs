//! Atomic write batches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Stores `value` under `key`, replacing any previous value.
    Put {
        /// Target key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Removes `key` if present.
    Delete {
        /// Target key.
        key: String,
    },
    /// Removes every key starting with `prefix`.
    DeletePrefix {
        /// Prefix to clear.
        prefix: String,
    },
}

/// An ordered group of operations applied atomically by a backend.
///
/// Operations apply in insertion order, so a `DeletePrefix` followed by a
/// `Put` under the same prefix leaves the new key in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    /// Adds a delete.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Adds a prefix delete.
    pub fn delete_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::DeletePrefix {
            prefix: prefix.into(),
        });
        self
    }

    /// Appends every operation of `other`.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Returns the operations in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies the batch to an ordered map.
    ///
    /// Returns the change in live size (key plus value bytes) the batch
    /// caused, so callers can keep a running total without rescanning.
    pub(crate) fn apply_to(&self, map: &mut BTreeMap<String, Vec<u8>>) -> i64 {
        let mut delta = 0i64;
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    delta += entry_size(key, value);
                    if let Some(old) = map.insert(key.clone(), value.clone()) {
                        delta -= entry_size(key, &old);
                    }
                }
                BatchOp::Delete { key } => {
                    if let Some(old) = map.remove(key) {
                        delta -= entry_size(key, &old);
                    }
                }
                BatchOp::DeletePrefix { prefix } => {
                    let doomed: Vec<String> = map
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        if let Some(old) = map.remove(&key) {
                            delta -= entry_size(&key, &old);
                        }
                    }
                }
            }
        }
        delta
    }
}

/// Bytes a live entry counts for in size accounting.
pub(crate) fn entry_size(key: &str, value: &[u8]) -> i64 {
    (key.len() + value.len()) as i64
}
