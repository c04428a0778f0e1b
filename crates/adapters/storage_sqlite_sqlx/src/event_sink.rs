//! `SQLite` implementation of [`EventSink`].

use std::future::Future;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use homebus_app::ports::EventSink;
use homebus_domain::error::HomeBusError;
use homebus_domain::event::Event;
use homebus_domain::id::OwnerId;
use homebus_domain::time::to_rfc3339;

use crate::decode;
use crate::error::StorageError;

struct Wrapper(Event);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let owner: String = row.try_get("owner")?;
        let created: String = row.try_get("created")?;
        let processed: Option<String> = row.try_get("processed")?;

        Ok(Self(Event {
            id: decode::parse(&id)?,
            owner: decode::parse(&owner)?,
            content: row.try_get("content")?,
            created: decode::timestamp(&created)?,
            processed: processed.as_deref().map(decode::timestamp).transpose()?,
            processing_error: row.try_get("processing_error")?,
        }))
    }
}

const INSERT: &str = r"
    INSERT INTO events (id, owner, content, created, processed, processing_error)
    VALUES (?, ?, ?, ?, ?, ?)
";
const SELECT_RECENT: &str =
    "SELECT * FROM events WHERE owner = ? ORDER BY created DESC, id LIMIT ?";

/// `SQLite`-backed event sink. Events are only ever appended.
pub struct SqliteEventSink {
    pool: SqlitePool,
}

impl SqliteEventSink {
    /// Create a new event sink using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent events of `owner`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Storage`] if the query fails.
    pub async fn recent(&self, owner: OwnerId, limit: usize) -> Result<Vec<Event>, HomeBusError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_RECENT)
            .bind(owner.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(rows.into_iter().map(|w| w.0).collect())
    }
}

impl EventSink for SqliteEventSink {
    fn save(&self, events: Vec<Event>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        let pool = self.pool.clone();
        async move {
            let mut tx = pool.begin().await.map_err(StorageError::from)?;
            for event in &events {
                sqlx::query(INSERT)
                    .bind(event.id.to_string())
                    .bind(event.owner.to_string())
                    .bind(&event.content)
                    .bind(to_rfc3339(event.created))
                    .bind(event.processed.map(to_rfc3339))
                    .bind(event.processing_error)
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            }
            tx.commit().await.map_err(StorageError::from)?;

            Ok(())
        }
    }
}
