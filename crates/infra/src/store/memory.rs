//! In-memory transactional store for tests/dev.
//!
//! Mirrors the Postgres semantics the queue managers depend on:
//! - writes are staged per transaction and become visible only on commit
//! - row locks are held by a transaction until commit, rollback or drop
//! - claims skip rows locked by other transactions (SKIP LOCKED)
//! - locking reads and updates of a row locked elsewhere fail with
//!   `RowLocked` instead of blocking (NOWAIT)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dispatch_core::{ExportJobId, ScimBridgeId, SlackMessageId};

use super::{Store, StoreResult};
use crate::export_jobs::ExportJob;
use crate::scim_bridges::ScimBridge;
use crate::slack_messages::SlackMessage;

/// Lockable row identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RowKey {
    ExportJob(ExportJobId),
    ScimBridge(ScimBridgeId),
    SlackMessage(SlackMessageId),
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    export_jobs: BTreeMap<ExportJobId, ExportJob>,
    scim_bridges: BTreeMap<ScimBridgeId, ScimBridge>,
    slack_messages: BTreeMap<SlackMessageId, SlackMessage>,
}

/// A row type stored in [`Tables`].
pub(crate) trait MemoryRow: Clone {
    type Key: Ord + Copy;

    fn key(&self) -> Self::Key;
    fn row_key(key: Self::Key) -> RowKey;
    fn table(tables: &Tables) -> &BTreeMap<Self::Key, Self>;
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self>;
}

impl MemoryRow for ExportJob {
    type Key = ExportJobId;

    fn key(&self) -> ExportJobId {
        self.id
    }
    fn row_key(key: ExportJobId) -> RowKey {
        RowKey::ExportJob(key)
    }
    fn table(tables: &Tables) -> &BTreeMap<ExportJobId, Self> {
        &tables.export_jobs
    }
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<ExportJobId, Self> {
        &mut tables.export_jobs
    }
}

impl MemoryRow for ScimBridge {
    type Key = ScimBridgeId;

    fn key(&self) -> ScimBridgeId {
        self.id
    }
    fn row_key(key: ScimBridgeId) -> RowKey {
        RowKey::ScimBridge(key)
    }
    fn table(tables: &Tables) -> &BTreeMap<ScimBridgeId, Self> {
        &tables.scim_bridges
    }
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<ScimBridgeId, Self> {
        &mut tables.scim_bridges
    }
}

impl MemoryRow for SlackMessage {
    type Key = SlackMessageId;

    fn key(&self) -> SlackMessageId {
        self.id
    }
    fn row_key(key: SlackMessageId) -> RowKey {
        RowKey::SlackMessage(key)
    }
    fn table(tables: &Tables) -> &BTreeMap<SlackMessageId, Self> {
        &tables.slack_messages
    }
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<SlackMessageId, Self> {
        &mut tables.slack_messages
    }
}

#[derive(Debug, Default)]
struct Shared {
    committed: Tables,
    /// Row lock -> owning transaction id.
    locks: HashMap<RowKey, u64>,
    next_tx_id: u64,
}

/// In-memory store shared by clones (one logical database).
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed rows of one table, in key order.
    pub(crate) fn committed_rows<R: MemoryRow>(&self) -> Vec<R> {
        R::table(&self.lock_shared().committed)
            .values()
            .cloned()
            .collect()
    }

    /// Number of row locks currently held by open transactions.
    pub fn held_locks(&self) -> usize {
        self.lock_shared().locks.len()
    }
}

/// Open in-memory transaction.
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    writes: Tables,
    deleted: HashSet<RowKey>,
    finished: bool,
}

impl MemoryTx {
    /// Exclusive view over committed state plus this transaction's writes.
    pub(crate) fn state(&mut self) -> TxState<'_> {
        TxState {
            tx_id: self.id,
            shared: self.shared.lock().unwrap_or_else(PoisonError::into_inner),
            writes: &mut self.writes,
            deleted: &mut self.deleted,
        }
    }

    fn finish(&mut self, apply: bool) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if apply {
            let writes = std::mem::take(&mut self.writes);
            shared.committed.export_jobs.extend(writes.export_jobs);
            shared.committed.scim_bridges.extend(writes.scim_bridges);
            shared.committed.slack_messages.extend(writes.slack_messages);
            for key in self.deleted.drain() {
                match key {
                    RowKey::ExportJob(id) => {
                        shared.committed.export_jobs.remove(&id);
                    }
                    RowKey::ScimBridge(id) => {
                        shared.committed.scim_bridges.remove(&id);
                    }
                    RowKey::SlackMessage(id) => {
                        shared.committed.slack_messages.remove(&id);
                    }
                }
            }
        }
        let id = self.id;
        shared.locks.retain(|_, owner| *owner != id);
        self.finished = true;
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false);
        }
    }
}

/// Locked view used by the entity implementations.
pub(crate) struct TxState<'a> {
    tx_id: u64,
    shared: MutexGuard<'a, Shared>,
    writes: &'a mut Tables,
    deleted: &'a mut HashSet<RowKey>,
}

impl TxState<'_> {
    /// Every row visible to this transaction, in key order.
    pub(crate) fn rows<R: MemoryRow>(&self) -> Vec<R> {
        let mut merged: BTreeMap<R::Key, R> = R::table(&self.shared.committed).clone();
        merged.extend(
            R::table(self.writes)
                .iter()
                .map(|(key, row)| (*key, row.clone())),
        );
        merged
            .into_iter()
            .filter(|(key, _)| !self.deleted.contains(&R::row_key(*key)))
            .map(|(_, row)| row)
            .collect()
    }

    pub(crate) fn row<R: MemoryRow>(&self, key: R::Key) -> Option<R> {
        if self.deleted.contains(&R::row_key(key)) {
            return None;
        }
        R::table(self.writes)
            .get(&key)
            .or_else(|| R::table(&self.shared.committed).get(&key))
            .cloned()
    }

    /// Stage an insert or update of `row`.
    pub(crate) fn put<R: MemoryRow>(&mut self, row: R) {
        let key = row.key();
        self.deleted.remove(&R::row_key(key));
        R::table_mut(self.writes).insert(key, row);
    }

    /// Stage a delete.
    pub(crate) fn delete<R: MemoryRow>(&mut self, key: R::Key) {
        R::table_mut(self.writes).remove(&key);
        self.deleted.insert(R::row_key(key));
    }

    /// Acquire the row lock unless another transaction holds it.
    pub(crate) fn try_lock(&mut self, key: RowKey) -> bool {
        match self.shared.locks.get(&key) {
            Some(owner) if *owner != self.tx_id => false,
            _ => {
                self.shared.locks.insert(key, self.tx_id);
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let mut shared = self.lock_shared();
        shared.next_tx_id += 1;
        Ok(MemoryTx {
            id: shared.next_tx_id,
            shared: self.shared.clone(),
            writes: Tables::default(),
            deleted: HashSet::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> StoreResult<()> {
        tx.finish(true);
        Ok(())
    }

    async fn rollback(&self, mut tx: MemoryTx) -> StoreResult<()> {
        tx.finish(false);
        Ok(())
    }
}
