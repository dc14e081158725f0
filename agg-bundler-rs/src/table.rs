use agg_rs::types::{Bundle, BundleRow};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored bundle blob is corrupt: {0}")]
    CorruptBundle(#[from] serde_json::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bundles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle BLOB NOT NULL,
    eligible_after INTEGER NOT NULL,
    next_eligibility_delay INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS bundles_eligible_after ON bundles (eligible_after);
";

/// Durable, insertion-ordered store of pending bundles. All mutation runs
/// under the query group, which brackets calls in a single transaction.
pub struct BundleTable {
    conn: Connection,
}

impl BundleTable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub(crate) fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub(crate) fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Insert a row, assigning its id.
    pub fn add(&self, row: &mut BundleRow) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(&row.bundle)?;
        self.conn.execute(
            "INSERT INTO bundles (bundle, eligible_after, next_eligibility_delay)
             VALUES (?1, ?2, ?3)",
            params![blob, row.eligible_after as i64, row.next_eligibility_delay as i64],
        )?;
        row.id = self.conn.last_insert_rowid() as u64;
        Ok(())
    }

    /// Rewrite a row by id.
    pub fn update(&self, row: &BundleRow) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(&row.bundle)?;
        self.conn.execute(
            "UPDATE bundles
             SET bundle = ?2, eligible_after = ?3, next_eligibility_delay = ?4
             WHERE id = ?1",
            params![
                row.id as i64,
                blob,
                row.eligible_after as i64,
                row.next_eligibility_delay as i64
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, ids: &[u64]) -> Result<(), StoreError> {
        let mut statement = self.conn.prepare("DELETE FROM bundles WHERE id = ?1")?;
        for id in ids {
            statement.execute(params![*id as i64])?;
        }
        Ok(())
    }

    /// Up to `limit` rows with `eligible_after <= block_number`, oldest
    /// insertion first.
    pub fn find_eligible(&self, block_number: u64, limit: usize) -> Result<Vec<BundleRow>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT id, bundle, eligible_after, next_eligibility_delay
             FROM bundles
             WHERE eligible_after <= ?1
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let rows = statement
            .query_map(params![block_number as i64, limit as i64], row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Every row in insertion order, regardless of eligibility.
    pub fn all(&self) -> Result<Vec<BundleRow>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT id, bundle, eligible_after, next_eligibility_delay
             FROM bundles
             ORDER BY id ASC",
        )?;
        let rows = statement.query_map([], row_from_sql)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM bundles", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

type RawRow = (i64, Vec<u8>, i64, i64);

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row((id, blob, eligible_after, next_eligibility_delay): RawRow) -> Result<BundleRow, StoreError> {
    let bundle: Bundle = serde_json::from_slice(&blob)?;
    Ok(BundleRow {
        id: id as u64,
        bundle,
        eligible_after: eligible_after as u64,
        next_eligibility_delay: next_eligibility_delay as u64,
    })
}
