use super::model::{ImageAsset, ImagePatch, ImageQuery, NewImageAsset, SortOrder};
use super::MetadataBackend;
use crate::config::DatabaseConfig;
use crate::connection::Connector;
use crate::error::{ConnectionError, MetadataError};
use crate::ids::{ImageId, ProductId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::io::ErrorKind;
use tracing::{debug, info};
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "id, product_id, remote_handle, url, alt_text, display_order, is_primary, \
                       width, height, byte_size, format, uploaded_at, created_at";

/// Row shape of `product_images`
#[derive(Debug, Clone, FromRow)]
struct ImageRow {
    id: Uuid,
    product_id: String,
    remote_handle: String,
    url: String,
    alt_text: Option<String>,
    display_order: i32,
    is_primary: bool,
    width: i32,
    height: i32,
    byte_size: i64,
    format: String,
    uploaded_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageAsset {
    type Error = MetadataError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let product_id = ProductId::parse(row.product_id).map_err(|e| {
            MetadataError::Connection(ConnectionError::Operation(format!(
                "corrupt product_id in row {}: {}",
                row.id, e
            )))
        })?;

        Ok(ImageAsset {
            id: ImageId::from(row.id),
            product_id,
            remote_handle: row.remote_handle,
            url: row.url,
            alt_text: row.alt_text,
            display_order: row.display_order.max(0) as u32,
            is_primary: row.is_primary,
            width: row.width.max(0) as u32,
            height: row.height.max(0) as u32,
            byte_size: row.byte_size.max(0) as u64,
            format: row.format,
            uploaded_at: row.uploaded_at,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL metadata backend. Each handle is a connection pool.
#[derive(Debug, Clone)]
pub struct PgBackend {
    config: DatabaseConfig,
}

impl PgBackend {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Connector for PgBackend {
    type Handle = PgPool;

    async fn open(&self, target: &str) -> Result<PgPool, ConnectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.connect_timeout())
            .idle_timeout(Some(self.config.idle_timeout()))
            .connect(target)
            .await
            .map_err(classify_connection)?;

        debug!(
            max_connections = self.config.max_connections,
            "PostgreSQL pool established"
        );
        Ok(pool)
    }

    async fn close(&self, handle: PgPool) -> Result<(), ConnectionError> {
        handle.close().await;
        Ok(())
    }

    fn is_live(&self, handle: &PgPool) -> bool {
        !handle.is_closed()
    }

    async fn ping(&self, handle: &PgPool) -> Result<(), ConnectionError> {
        sqlx::query("SELECT 1")
            .execute(handle)
            .await
            .map_err(classify_connection)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataBackend for PgBackend {
    async fn ensure_indexes(&self, handle: &PgPool) -> Result<(), MetadataError> {
        info!("Running database migrations");

        MIGRATOR.run(handle).await.map_err(|e| match e {
            MigrateError::Execute(err) => classify(err),
            other => MetadataError::Connection(ConnectionError::Operation(format!(
                "migration failed: {}",
                other
            ))),
        })?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn find(
        &self,
        handle: &PgPool,
        query: &ImageQuery,
    ) -> Result<Vec<ImageAsset>, MetadataError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM product_images", COLUMNS));
        push_filter(&mut qb, query);

        qb.push(match query.sort {
            SortOrder::Ascending => " ORDER BY product_id ASC, display_order ASC",
            SortOrder::Descending => " ORDER BY product_id DESC, display_order DESC",
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(skip) = query.skip {
            qb.push(" OFFSET ").push_bind(skip as i64);
        }

        let rows = qb
            .build_query_as::<ImageRow>()
            .fetch_all(handle)
            .await
            .map_err(classify)?;

        rows.into_iter().map(ImageAsset::try_from).collect()
    }

    async fn insert_one(
        &self,
        handle: &PgPool,
        image: &NewImageAsset,
        display_order: u32,
    ) -> Result<ImageAsset, MetadataError> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            r#"
            INSERT INTO product_images (
                id, product_id, remote_handle, url, alt_text,
                display_order, is_primary, width, height, byte_size,
                format, uploaded_at, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, NOW()
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(image.product_id.as_str())
        .bind(&image.remote_handle)
        .bind(&image.url)
        .bind(&image.alt_text)
        .bind(display_order as i32)
        .bind(image.is_primary)
        .bind(image.width as i32)
        .bind(image.height as i32)
        .bind(image.byte_size as i64)
        .bind(&image.format)
        .bind(image.uploaded_at)
        .fetch_one(handle)
        .await
        .map_err(classify)?;

        ImageAsset::try_from(row)
    }

    async fn update_one(
        &self,
        handle: &PgPool,
        id: ImageId,
        patch: &ImagePatch,
    ) -> Result<Option<ImageAsset>, MetadataError> {
        if patch.is_empty() {
            let mut found = self.find(handle, &ImageQuery::by_id(id).limit(1)).await?;
            return Ok(found.pop());
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE product_images SET ");
        push_patch(&mut qb, patch);
        qb.push(" WHERE id = ").push_bind(id.as_uuid());
        qb.push(" RETURNING ").push(COLUMNS);

        let row = qb
            .build_query_as::<ImageRow>()
            .fetch_optional(handle)
            .await
            .map_err(classify)?;

        row.map(ImageAsset::try_from).transpose()
    }

    async fn update_many(
        &self,
        handle: &PgPool,
        filter: &ImageQuery,
        patch: &ImagePatch,
    ) -> Result<u64, MetadataError> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE product_images SET ");
        push_patch(&mut qb, patch);
        push_filter(&mut qb, filter);

        let result = qb.build().execute(handle).await.map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn set_display_orders(
        &self,
        handle: &PgPool,
        product_id: &ProductId,
        orders: &[(ImageId, u32)],
    ) -> Result<u64, MetadataError> {
        let ids: Vec<Uuid> = orders.iter().map(|(id, _)| id.as_uuid()).collect();
        let positions: Vec<i32> = orders.iter().map(|(_, order)| *order as i32).collect();

        // One statement so the deferrable unique constraint is checked once,
        // after every row has moved.
        let result = sqlx::query(
            r#"
            UPDATE product_images AS p
            SET display_order = v.display_order
            FROM UNNEST($2::uuid[], $3::int4[]) AS v(id, display_order)
            WHERE p.id = v.id AND p.product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .bind(ids)
        .bind(positions)
        .execute(handle)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected())
    }

    async fn delete_one(&self, handle: &PgPool, id: ImageId) -> Result<bool, MetadataError> {
        let result = sqlx::query("DELETE FROM product_images WHERE id = $1")
            .bind(id.as_uuid())
            .execute(handle)
            .await
            .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(&self, handle: &PgPool, filter: &ImageQuery) -> Result<u64, MetadataError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM product_images");
        push_filter(&mut qb, filter);

        let result = qb.build().execute(handle).await.map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn max_display_order(
        &self,
        handle: &PgPool,
        product_id: &ProductId,
    ) -> Result<Option<u32>, MetadataError> {
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(display_order) FROM product_images WHERE product_id = $1",
        )
        .bind(product_id.as_str())
        .fetch_one(handle)
        .await
        .map_err(classify)?;

        Ok(max.map(|m| m.max(0) as u32))
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ImageQuery) {
    qb.push(" WHERE TRUE");
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id.as_uuid());
    }
    if let Some(ref product_id) = filter.product_id {
        qb.push(" AND product_id = ")
            .push_bind(product_id.as_str().to_string());
    }
    if let Some(is_primary) = filter.is_primary {
        qb.push(" AND is_primary = ").push_bind(is_primary);
    }
}

fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &ImagePatch) {
    let mut set = qb.separated(", ");
    if let Some(is_primary) = patch.is_primary {
        set.push("is_primary = ");
        set.push_bind_unseparated(is_primary);
    }
    if let Some(ref alt_text) = patch.alt_text {
        set.push("alt_text = ");
        set.push_bind_unseparated(alt_text.clone());
    }
    if let Some(order) = patch.display_order {
        set.push("display_order = ");
        set.push_bind_unseparated(order as i32);
    }
}

/// Map a driver error onto the closed error kinds.
fn classify(err: sqlx::Error) -> MetadataError {
    let connection = |e: ConnectionError| MetadataError::Connection(e);

    match err {
        sqlx::Error::Database(ref db) => match db.code().as_deref() {
            Some("23505") => MetadataError::WriteConflict(db.message().to_string()),
            Some("28P01") | Some("28000") => {
                connection(ConnectionError::AuthFailure(db.message().to_string()))
            }
            // admin_shutdown, crash_shutdown, cannot_connect_now
            Some("57P01") | Some("57P02") | Some("57P03") => {
                connection(ConnectionError::TopologyLost(db.message().to_string()))
            }
            Some(code) if code.starts_with("08") => {
                connection(ConnectionError::TopologyLost(db.message().to_string()))
            }
            _ => connection(ConnectionError::Operation(db.message().to_string())),
        },
        sqlx::Error::Io(ref io) => {
            let message = io.to_string();
            match io.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected => connection(ConnectionError::TopologyLost(message)),
                ErrorKind::ConnectionRefused => connection(ConnectionError::Unreachable(message)),
                ErrorKind::TimedOut => connection(ConnectionError::Timeout(message)),
                _ if is_dns_failure(&message) => connection(ConnectionError::HostUnresolved(message)),
                _ => connection(ConnectionError::Operation(message)),
            }
        }
        sqlx::Error::Tls(e) => connection(ConnectionError::Handshake(e.to_string())),
        sqlx::Error::Protocol(message) => connection(ConnectionError::Handshake(message)),
        sqlx::Error::Configuration(e) => connection(ConnectionError::Configuration(e.to_string())),
        sqlx::Error::PoolTimedOut => connection(ConnectionError::Timeout(
            "timed out acquiring a pooled connection".to_string(),
        )),
        sqlx::Error::PoolClosed => {
            connection(ConnectionError::TopologyLost("connection pool is closed".to_string()))
        }
        sqlx::Error::WorkerCrashed => connection(ConnectionError::TopologyLost(
            "connection worker crashed".to_string(),
        )),
        other => connection(ConnectionError::Operation(other.to_string())),
    }
}

fn classify_connection(err: sqlx::Error) -> ConnectionError {
    match classify(err) {
        MetadataError::Connection(e) => e,
        other => ConnectionError::Operation(other.to_string()),
    }
}

fn is_dns_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("failed to lookup address")
        || message.contains("name or service not known")
        || message.contains("no such host")
}
