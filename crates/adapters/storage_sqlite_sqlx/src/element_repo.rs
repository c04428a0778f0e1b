//! `SQLite` implementation of [`ElementRepository`].

use std::future::Future;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use homebus_app::ports::ElementRepository;
use homebus_domain::element::Element;
use homebus_domain::error::HomeBusError;
use homebus_domain::id::{ElementId, OwnerId};
use homebus_domain::time::to_rfc3339;

use crate::decode;
use crate::error::StorageError;

/// Wrapper for converting database rows into domain [`Element`].
struct Wrapper(Element);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let element_id: String = row.try_get("element_id")?;
        let parent_id: String = row.try_get("parent_id")?;
        let owner: String = row.try_get("owner")?;
        let element_type: String = row.try_get("element_type")?;
        let tree_index: i64 = row.try_get("tree_index")?;
        let tree_depth: i64 = row.try_get("tree_depth")?;
        let created: String = row.try_get("created")?;
        let modified: String = row.try_get("modified")?;

        Ok(Self(Element {
            element_id: ElementId::new(element_id),
            parent_id: ElementId::new(parent_id),
            owner: decode::parse(&owner)?,
            element_type: decode::parse(&element_type)?,
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            tree_index: decode::index(tree_index)?,
            tree_depth: decode::index(tree_depth)?,
            created: decode::timestamp(&created)?,
            modified: decode::timestamp(&modified)?,
        }))
    }
}

const SELECT_BY_OWNER: &str =
    "SELECT * FROM elements WHERE owner = ? ORDER BY tree_index, element_id";
const UPSERT: &str = r"
    INSERT INTO elements (owner, element_id, parent_id, element_type, name, category, tree_index, tree_depth, created, modified)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (owner, element_id) DO UPDATE SET
        parent_id = excluded.parent_id,
        element_type = excluded.element_type,
        name = excluded.name,
        category = excluded.category,
        tree_index = excluded.tree_index,
        tree_depth = excluded.tree_depth,
        modified = excluded.modified
";

/// `SQLite`-backed element tree store.
pub struct SqliteElementRepository {
    pool: SqlitePool,
}

impl SqliteElementRepository {
    /// Create a new repository using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl ElementRepository for SqliteElementRepository {
    fn get_elements(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Element>, HomeBusError>> + Send {
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

    fn save_elements(
        &self,
        owner: OwnerId,
        elements: Vec<Element>,
    ) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        let pool = self.pool.clone();
        async move {
            let mut tx = pool.begin().await.map_err(StorageError::from)?;
            for element in &elements {
                element.validate()?;
                sqlx::query(UPSERT)
                    .bind(owner.to_string())
                    .bind(element.element_id.as_str())
                    .bind(element.parent_id.as_str())
                    .bind(element.element_type.as_str())
                    .bind(&element.name)
                    .bind(&element.category)
                    .bind(i64::from(element.tree_index))
                    .bind(i64::from(element.tree_depth))
                    .bind(to_rfc3339(element.created))
                    .bind(to_rfc3339(element.modified))
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            }
            tx.commit().await.map_err(StorageError::from)?;
            tracing::debug!(%owner, count = elements.len(), "saved elements");

            Ok(())
        }
    }
}
