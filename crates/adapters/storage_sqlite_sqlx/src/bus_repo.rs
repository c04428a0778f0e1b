//! `SQLite` implementation of [`BusRepository`].

use std::future::Future;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use homebus_app::ports::BusRepository;
use homebus_domain::bus::Bus;
use homebus_domain::error::HomeBusError;
use homebus_domain::id::OwnerId;
use homebus_domain::time::to_rfc3339;

use crate::decode;
use crate::error::StorageError;

/// Wrapper for converting database rows into domain [`Bus`].
struct Wrapper(Bus);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let owner: String = row.try_get("owner")?;
        let status: String = row.try_get("status")?;
        let last_synchronized: Option<String> = row.try_get("last_synchronized")?;
        let created: String = row.try_get("created")?;
        let modified: String = row.try_get("modified")?;

        Ok(Self(Bus {
            id: decode::parse(&id)?,
            owner: decode::parse(&owner)?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            enabled: row.try_get("enabled")?,
            status: decode::parse(&status)?,
            last_synchronized: last_synchronized
                .as_deref()
                .map(decode::timestamp)
                .transpose()?,
            created: decode::timestamp(&created)?,
            modified: decode::timestamp(&modified)?,
        }))
    }
}

const SELECT_ALL: &str = "SELECT * FROM buses ORDER BY name, id";
const SELECT_BY_OWNER: &str = "SELECT * FROM buses WHERE owner = ? ORDER BY name, id";
const UPSERT: &str = r"
    INSERT INTO buses (id, owner, name, address, enabled, status, last_synchronized, created, modified)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (id) DO UPDATE SET
        owner = excluded.owner,
        name = excluded.name,
        address = excluded.address,
        enabled = excluded.enabled,
        status = excluded.status,
        last_synchronized = excluded.last_synchronized,
        modified = excluded.modified
";

/// `SQLite`-backed bus configuration store.
pub struct SqliteBusRepository {
    pool: SqlitePool,
}

impl SqliteBusRepository {
    /// Create a new repository using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl BusRepository for SqliteBusRepository {
    fn get_all(&self) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        let pool = self.pool.clone();
        async move {
            let rows: Vec<Wrapper> = sqlx::query_as(SELECT_ALL)
                .fetch_all(&pool)
                .await
                .map_err(StorageError::from)?;

            Ok(rows.into_iter().map(|w| w.0).collect())
        }
    }

    fn get_by_owner(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        let pool = self.pool.clone();
        async move {
            let rows: Vec<Wrapper> = sqlx::query_as(SELECT_BY_OWNER)
                .bind(owner.to_string())
                .fetch_all(&pool)
                .await
                .map_err(StorageError::from)?;

            Ok(rows.into_iter().map(|w| w.0).collect())
        }
    }

    fn save_buses(&self, buses: Vec<Bus>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        let pool = self.pool.clone();
        async move {
            let mut tx = pool.begin().await.map_err(StorageError::from)?;
            for bus in &buses {
                bus.validate()?;
                sqlx::query(UPSERT)
                    .bind(bus.id.to_string())
                    .bind(bus.owner.to_string())
                    .bind(&bus.name)
                    .bind(&bus.address)
                    .bind(bus.enabled)
                    .bind(bus.status.as_str())
                    .bind(bus.last_synchronized.map(to_rfc3339))
                    .bind(to_rfc3339(bus.created))
                    .bind(to_rfc3339(bus.modified))
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            }
            tx.commit().await.map_err(StorageError::from)?;

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Config;
    use homebus_domain::bus::BusConnectionStatus;
    use homebus_domain::time::now;

    async fn setup() -> SqliteBusRepository {
        let db = Config {
            database_url: "sqlite::memory:".to_string(),
        }
        .build()
        .await
        .unwrap();
        SqliteBusRepository::new(db.pool().clone())
    }

    fn bus(owner: OwnerId, name: &str) -> Bus {
        Bus::builder()
            .owner(owner)
            .name(name)
            .address("mqtt://localhost:1883")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn should_save_and_list_buses_by_name() {
        let repo = setup().await;
        let owner = OwnerId::new();
        let garage = bus(owner, "garage");
        let attic = bus(owner, "attic");

        repo.save_buses(vec![garage.clone(), attic.clone()]).await.unwrap();

        assert_eq!(repo.get_all().await.unwrap(), vec![attic, garage]);
    }

    #[tokio::test]
    async fn should_filter_by_owner() {
        let repo = setup().await;
        let mine = OwnerId::new();
        repo.save_buses(vec![bus(mine, "home"), bus(OwnerId::new(), "office")])
            .await
            .unwrap();

        let buses = repo.get_by_owner(mine).await.unwrap();

        assert_eq!(buses.len(), 1);
        assert_eq!(buses[0].name, "home");
    }

    #[tokio::test]
    async fn should_persist_status_changes() {
        let repo = setup().await;
        let mut home = bus(OwnerId::new(), "home");
        repo.save_buses(vec![home.clone()]).await.unwrap();

        let at = now();
        home.mark_synchronized(at);
        repo.save_buses(vec![home.clone()]).await.unwrap();

        let stored = repo.get_all().await.unwrap().remove(0);
        assert_eq!(stored.status, BusConnectionStatus::Connected);
        assert_eq!(stored.last_synchronized, Some(at));
        assert_eq!(stored, home);
    }

    #[tokio::test]
    async fn should_reject_invalid_bus_without_writing() {
        let repo = setup().await;
        let owner = OwnerId::new();
        let mut broken = bus(owner, "broken");
        broken.address.clear();

        let result = repo.save_buses(vec![bus(owner, "home"), broken]).await;

        assert!(matches!(result, Err(HomeBusError::Validation(_))));
        assert!(repo.get_all().await.unwrap().is_empty());
    }
}
