//! SQLite adapter: Implementation of `ReviewSink`.
//!
//! Persists abstained cases for human review. The original instance is stored
//! as JSON exactly as received.
//!
//! # Mutex Behavior
//!
//! The connection is protected by a `Mutex`. A poisoned mutex is reported as
//! `ReviewStoreError::Poisoned` instead of panicking the decision path.
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::SecondsFormat;
use rusqlite::{params, Connection};

use crate::domain::{RawInstance, ReviewCase};
use crate::ports::{ReviewPage, ReviewSink};

/// Error type for review queue operations.
#[derive(Debug, thiserror::Error)]
pub enum ReviewStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("Review queue lock poisoned")]
    Poisoned,

    #[error("Pagination {name} {value} out of range")]
    OutOfRange { name: &'static str, value: String },
}

fn to_sql_int(name: &'static str, value: usize) -> Result<i64, ReviewStoreError> {
    i64::try_from(value).map_err(|_| ReviewStoreError::OutOfRange {
        name,
        value: value.to_string(),
    })
}

fn from_sql_count(count: i64) -> Result<usize, ReviewStoreError> {
    usize::try_from(count).map_err(|_| ReviewStoreError::OutOfRange {
        name: "count",
        value: count.to_string(),
    })
}

/// SQLite review queue.
pub struct SqliteReviewQueue {
    conn: Mutex<Connection>,
}

impl SqliteReviewQueue {
    /// Open (or create) the queue at `path`.
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ReviewStoreError> {
        let conn = Connection::open(path)?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.init_schema()?;
        Ok(queue)
    }

    /// Create an in-memory SQLite database (for testing).
    ///
    /// # Errors
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, ReviewStoreError> {
        let conn = Connection::open_in_memory()?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.init_schema()?;
        Ok(queue)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ReviewStoreError> {
        self.conn.lock().map_err(|_| ReviewStoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), ReviewStoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS review_cases (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                bundle_version TEXT NOT NULL,
                instance_json TEXT NOT NULL,
                probability REAL NOT NULL,
                uncertainty REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_review_cases_created
                ON review_cases(created_at DESC);
            ",
        )?;

        Ok(())
    }

    fn row_to_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ReviewRow, String)> {
        Ok((
            ReviewRow {
                id: row.get(0)?,
                bundle_version: row.get(1)?,
                instance_json: row.get(2)?,
                probability: row.get(3)?,
                uncertainty: row.get(4)?,
            },
            row.get(5)?,
        ))
    }

    fn query_cases(
        conn: &Connection,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReviewCase>, ReviewStoreError> {
        let limit = to_sql_int("limit", limit)?;
        let offset = to_sql_int("offset", offset)?;
        let mut stmt = conn.prepare(
            r"
            SELECT id, bundle_version, instance_json, probability, uncertainty, created_at
            FROM review_cases
            ORDER BY created_at DESC, seq DESC
            LIMIT ?1 OFFSET ?2
            ",
        )?;

        let rows = stmt
            .query_map(params![limit, offset], Self::row_to_case)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(row, created_at)| row.into_case(&created_at))
            .collect()
    }
}

struct ReviewRow {
    id: String,
    bundle_version: String,
    instance_json: String,
    probability: f64,
    uncertainty: f64,
}

impl ReviewRow {
    fn into_case(self, created_at: &str) -> Result<ReviewCase, ReviewStoreError> {
        let instance: RawInstance = serde_json::from_str(&self.instance_json)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|_| ReviewStoreError::Timestamp(created_at.to_string()))?;
        Ok(ReviewCase {
            id: self.id,
            created_at,
            bundle_version: self.bundle_version,
            instance,
            probability: self.probability,
            uncertainty: self.uncertainty,
        })
    }
}

impl ReviewSink for SqliteReviewQueue {
    type Error = ReviewStoreError;

    fn submit(&self, case: &ReviewCase) -> Result<(), Self::Error> {
        let instance_json = serde_json::to_string(&case.instance)?;
        let conn = self.lock()?;

        conn.execute(
            r"
            INSERT INTO review_cases (
                id, bundle_version, instance_json, probability, uncertainty, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                case.id,
                case.bundle_version,
                instance_json,
                case.probability,
                case.uncertainty,
                // Fixed width so lexical order is chronological.
                case.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;

        tracing::debug!("Queued review case {}", case.id);
        Ok(())
    }

    fn load_recent(&self, limit: usize) -> Result<Vec<ReviewCase>, Self::Error> {
        let conn = self.lock()?;
        Self::query_cases(&conn, 0, limit)
    }

    fn load_paginated(&self, offset: usize, limit: usize) -> Result<ReviewPage, Self::Error> {
        let conn = self.lock()?;
        let total_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM review_cases", [], |row| row.get(0))?;
        let items = Self::query_cases(&conn, offset, limit)?;
        Ok(ReviewPage::new(items, from_sql_count(total_count)?, offset, limit))
    }

    fn count(&self) -> Result<usize, Self::Error> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM review_cases", [], |row| row.get(0))?;
        from_sql_count(count)
    }

    fn resolve(&self, id: &str) -> Result<bool, Self::Error> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM review_cases WHERE id = ?1", params![id])?;
        if removed > 0 {
            tracing::info!("Resolved review case {id}");
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decision, Verdict};

    fn case(age: f64) -> ReviewCase {
        let decision = Decision {
            verdict: Verdict::Abstain,
            probability: 0.5,
            raw_score: 0.5,
            uncertainty: std::f64::consts::LN_2,
            disagreement: 0.1,
            cost_risk: 100.0,
            bundle_version: "census-7".into(),
        };
        ReviewCase::new(
            &decision,
            RawInstance::new().with("age", age).with_missing("occupation"),
        )
    }

    #[test]
    fn test_submit_and_load() {
        let queue = SqliteReviewQueue::in_memory().expect("Failed to create queue");
        let submitted = case(41.0);
        queue.submit(&submitted).expect("submit");

        let loaded = queue.load_recent(10).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, submitted.id);
        assert_eq!(loaded[0].instance, submitted.instance);
        assert_eq!(loaded[0].bundle_version, "census-7");
        assert_eq!(loaded[0].uncertainty, std::f64::consts::LN_2);
    }

    #[test]
    fn test_pagination_newest_first() {
        let queue = SqliteReviewQueue::in_memory().expect("Failed to create queue");
        let mut ids = Vec::new();
        for i in 0..5 {
            let c = case(30.0 + f64::from(i));
            ids.push(c.id.clone());
            queue.submit(&c).expect("submit");
        }

        assert_eq!(queue.count().expect("count"), 5);
        let page = queue.load_paginated(0, 2).expect("page");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_count, 5);
        assert!(page.has_more);
        assert_eq!(page.items[0].id, ids[4]);

        let last = queue.load_paginated(4, 2).expect("page");
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.items[0].id, ids[0]);
    }

    #[test]
    fn test_pagination_beyond_sql_range() {
        let queue = SqliteReviewQueue::in_memory().expect("Failed to create queue");
        queue.submit(&case(33.0)).expect("submit");

        assert!(matches!(
            queue.load_paginated(usize::MAX, 20),
            Err(ReviewStoreError::OutOfRange { name: "offset", .. })
        ));
        assert!(matches!(
            queue.load_recent(usize::MAX),
            Err(ReviewStoreError::OutOfRange { name: "limit", .. })
        ));

        let far = queue.load_paginated(1_000_000, 20).expect("page");
        assert!(far.items.is_empty());
        assert_eq!(far.total_count, 1);
        assert_eq!(far.next_offset(), None);
    }

    #[test]
    fn test_resolve() {
        let queue = SqliteReviewQueue::in_memory().expect("Failed to create queue");
        let c = case(50.0);
        queue.submit(&c).expect("submit");

        assert!(queue.resolve(&c.id).expect("resolve"));
        assert!(!queue.resolve(&c.id).expect("resolve again"));
        assert_eq!(queue.count().expect("count"), 0);
    }
}
