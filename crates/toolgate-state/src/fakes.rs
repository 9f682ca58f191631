//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryAuditStore`, which satisfies the `AuditStore` contract
//! without any external dependencies.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryAuditStore
// ---------------------------------------------------------------------------

/// In-memory audit store backed by a `BTreeMap<seq, entry>`.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Mutex<BTreeMap<u64, AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&entry.seq) {
            return Err(StoreError::DuplicateEntry { seq: entry.seq });
        }
        entries.insert(entry.seq, entry.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditLogEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(filter.apply(entries.values()))
    }

    async fn count(&self) -> StoreResult<u64> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.len() as u64)
    }

    async fn last_seq(&self) -> StoreResult<Option<u64>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().next_back().copied())
    }
}
