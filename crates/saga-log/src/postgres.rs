use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    MessageId, Result, SagaId, SagaLogError, SagaLogQuery, SagaRecord, Version,
    store::{ProcessedMessageStore, SagaLogStore},
};

const SELECT_COLUMNS: &str =
    "id, saga_type, status, correlation_id, version, created_at, updated_at, document";

/// PostgreSQL-backed saga log.
#[derive(Clone)]
pub struct PostgresSagaLogStore {
    pool: PgPool,
}

impl PostgresSagaLogStore {
    /// Creates a new PostgreSQL saga log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Closes the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            status: row.try_get("status")?,
            correlation_id: row.try_get("correlation_id")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            document: row.try_get("document")?,
        })
    }

    async fn count_grouped(&self, column: &str) -> Result<BTreeMap<String, u64>> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS count FROM saga_instances GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(key, count.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl SagaLogStore for PostgresSagaLogStore {
    async fn insert(&self, record: SagaRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_instances (id, saga_type, status, correlation_id, version, created_at, updated_at, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.saga_type)
        .bind(&record.status)
        .bind(&record.correlation_id)
        .bind(Version::first().as_i64())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.document)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_instances_pkey")
            {
                return SagaLogError::AlreadyExists(record.id);
            }
            SagaLogError::Database(e)
        })?;

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(saga_id = %record.id, expected = expected.as_i64()))]
    async fn update(&self, record: SagaRecord, expected: Version) -> Result<Version> {
        let next = expected.next();

        // Single statement: the status, timestamps and document land together or not at all.
        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET status = $3, correlation_id = $4, version = $5, updated_at = $6, document = $7
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(expected.as_i64())
        .bind(&record.status)
        .bind(&record.correlation_id)
        .bind(next.as_i64())
        .bind(record.updated_at)
        .bind(&record.document)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(next);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                .bind(record.id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            Some(actual) => {
                metrics::counter!("saga_log_write_conflicts_total", "backend" => "postgres")
                    .increment(1);
                tracing::warn!(actual, "stale saga write rejected");
                Err(SagaLogError::ConcurrencyConflict {
                    saga_id: record.id,
                    expected,
                    actual: Version::new(actual),
                })
            }
            None => Err(SagaLogError::NotFound(record.id)),
        }
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM saga_instances WHERE id = $1");
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn query(&self, query: SagaLogQuery) -> Result<Vec<SagaRecord>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        self.count_grouped("status").await
    }

    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>> {
        self.count_grouped("saga_type").await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedMessageStore for PostgresSagaLogStore {
    async fn claim(&self, consumer: &str, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (consumer, message_id, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (consumer, message_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, consumer: &str, message_id: &MessageId) -> Result<()> {
        sqlx::query("DELETE FROM processed_messages WHERE consumer = $1 AND message_id = $2")
            .bind(consumer)
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
