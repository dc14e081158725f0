use crate::{
    events::AggregatorEvent,
    table::{BundleTable, StoreError},
};
use std::ops::Deref;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::error;

/// Serializes every read-then-write sequence against the bundle table.
/// Holding the guard is also a transactional scope: acquiring it opens a
/// SQLite transaction, `commit` ends it, and dropping an uncommitted
/// guard rolls the transaction back.
pub struct QueryGroup {
    table: Mutex<BundleTable>,
    events: broadcast::Sender<AggregatorEvent>,
}

impl QueryGroup {
    pub fn new(table: BundleTable, events: broadcast::Sender<AggregatorEvent>) -> Self {
        Self { table: Mutex::new(table), events }
    }

    pub async fn lock(&self) -> Result<QueryGroupGuard<'_>, StoreError> {
        let table = self.table.lock().await;
        table.begin()?;
        let _ = self.events.send(AggregatorEvent::QueryGroupStarted);
        Ok(QueryGroupGuard { table, events: &self.events, committed: false })
    }
}

pub struct QueryGroupGuard<'a> {
    table: MutexGuard<'a, BundleTable>,
    events: &'a broadcast::Sender<AggregatorEvent>,
    committed: bool,
}

impl QueryGroupGuard<'_> {
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.table.commit()?;
        self.committed = true;
        let _ = self.events.send(AggregatorEvent::QueryGroupFinished { committed: true });
        Ok(())
    }
}

impl Deref for QueryGroupGuard<'_> {
    type Target = BundleTable;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl Drop for QueryGroupGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.table.rollback() {
                error!(%err, "could not roll back abandoned query group");
            }
            let _ = self.events.send(AggregatorEvent::QueryGroupFinished { committed: false });
        }
    }
}
