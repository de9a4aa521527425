//! Service rows read from the relational services table

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{
    any::{install_default_drivers, AnyPoolOptions},
    AnyPool, Row,
};

use crate::error::RowSourceError;

/// The database table name for the service providers.
pub const TABLE_NAME_SERVICES: &str = "mpass_services";

/// The column name for the SAML entity ID.
pub const COLUMN_ID_ENTITY_ID: &str = "samlEntityId";

/// The column name for the SAML (POST-binding) assertion consumer service URL.
pub const COLUMN_ID_ACS_URL: &str = "samlAcsUrl";

// Columns are read by position; unquoted identifiers are case-folded by some databases.
fn select_services() -> String {
    format!("SELECT {COLUMN_ID_ENTITY_ID}, {COLUMN_ID_ACS_URL} FROM {TABLE_NAME_SERVICES}")
}

/// One row of the services table, projected to the columns used for metadata.
///
/// Null columns are kept as `None` and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRow {
    pub entity_id: Option<String>,
    pub acs_url: Option<String>,
}

impl ServiceRow {
    pub fn new(entity_id: &str, acs_url: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            acs_url: Some(acs_url.into()),
        }
    }
}

/// Source of the current service rows
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Read every row of the services table.
    ///
    /// No ordering is promised beyond what the underlying store returns.
    async fn fetch_all(&self) -> Result<Vec<ServiceRow>, RowSourceError>;
}

/// Row source backed by an `sqlx` connection pool.
#[derive(Debug, Clone)]
pub struct SqlRowSource {
    pool: AnyPool,
}

impl SqlRowSource {
    #[must_use]
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create a row source for a database URL without connecting yet.
    pub fn connect_lazy(url: &str) -> Result<Self, sqlx::Error> {
        install_default_drivers();
        let pool = AnyPoolOptions::new().connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl RowSource for SqlRowSource {
    async fn fetch_all(&self) -> Result<Vec<ServiceRow>, RowSourceError> {
        // Returned to the pool when dropped, on every exit path.
        let mut connection = self.pool.acquire().await?;

        let query = select_services();
        let rows = sqlx::query(&query)
            .fetch_all(&mut *connection)
            .await?;

        let services = rows
            .iter()
            .map(|row| {
                Ok(ServiceRow {
                    entity_id: row.try_get(0)?,
                    acs_url: row.try_get(1)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        tracing::debug!(
            table = TABLE_NAME_SERVICES,
            count = services.len(),
            "Fetched service rows"
        );
        Ok(services)
    }
}

/// In-memory row source, for testing and for embedding without a database.
#[derive(Debug, Default)]
pub struct InMemoryRowSource {
    rows: Mutex<Vec<ServiceRow>>,
    failing: AtomicBool,
}

impl InMemoryRowSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: ServiceRow) {
        self.rows.lock().push(row);
    }

    pub fn replace(&self, rows: Vec<ServiceRow>) {
        *self.rows.lock() = rows;
    }

    pub fn clear(&self) {
        self.rows.lock().clear();
    }

    /// Make every subsequent fetch fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RowSource for InMemoryRowSource {
    async fn fetch_all(&self) -> Result<Vec<ServiceRow>, RowSourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RowSourceError::Other("in-memory source set to fail".into()));
        }
        Ok(self.rows.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn memory_pool() -> AnyPool {
        install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(2))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn create_table(pool: &AnyPool) {
        sqlx::query(
            "CREATE TABLE mpass_services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                samlEntityId VARCHAR(255),
                samlAcsUrl VARCHAR(255),
                startTime TIMESTAMP,
                endTime TIMESTAMP
            )",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn query_uses_fixed_identifiers() {
        assert_eq!(
            select_services(),
            "SELECT samlEntityId, samlAcsUrl FROM mpass_services"
        );
    }

    #[tokio::test]
    async fn test_fetch_empty_table() {
        let pool = memory_pool().await;
        create_table(&pool).await;

        let rows = SqlRowSource::new(pool).fetch_all().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_rows_including_nulls() {
        let pool = memory_pool().await;
        create_table(&pool).await;
        sqlx::query(
            "INSERT INTO mpass_services (samlEntityId, samlAcsUrl, startTime) VALUES
                ('https://www.example.org/entity', 'https://www.example.org/acs', CURRENT_TIMESTAMP),
                (NULL, 'https://www.example.org/acs2', CURRENT_TIMESTAMP)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let rows = SqlRowSource::new(pool).fetch_all().await.unwrap();
        assert_eq!(
            rows,
            vec![
                ServiceRow::new("https://www.example.org/entity", "https://www.example.org/acs"),
                ServiceRow {
                    entity_id: None,
                    acs_url: Some("https://www.example.org/acs2".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_unavailable_and_releases_connection() {
        let pool = memory_pool().await;
        let source = SqlRowSource::new(pool.clone());

        let result = source.fetch_all().await;
        assert!(matches!(result, Err(RowSourceError::Unavailable(_))));

        // The single pooled connection must be free again.
        create_table(&pool).await;
        assert!(source.fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_source() {
        let source = InMemoryRowSource::new();
        source.insert(ServiceRow::new("https://a.example.org", "https://a.example.org/acs"));
        assert_eq!(source.fetch_all().await.unwrap().len(), 1);

        source.set_failing(true);
        assert!(source.fetch_all().await.is_err());

        source.set_failing(false);
        source.clear();
        assert!(source.fetch_all().await.unwrap().is_empty());
    }
}
