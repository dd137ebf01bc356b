//! Artifact file-record persistence.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{map_db_err, RepoError};
use crate::models::{FileDetail, FileRecord};

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub deployment_id: Uuid,
    pub original_name: String,
    pub storage_key: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
}

#[async_trait]
pub trait FileRecordRepository: Send + Sync + 'static {
    /// Insert a file record. A dangling `deployment_id` surfaces as
    /// `RepoError::ForeignKey`.
    async fn create(&self, new: NewFileRecord) -> Result<FileRecord, RepoError>;

    /// Files for one deployment, most recent first.
    async fn find_by_deployment(&self, deployment_id: Uuid) -> Result<Vec<FileDetail>, RepoError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, RepoError>;
}

pub struct PgFileRecordRepository {
    pool: Pool<Postgres>,
}

impl PgFileRecordRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRecordRepository for PgFileRecordRepository {
    async fn create(&self, new: NewFileRecord) -> Result<FileRecord, RepoError> {
        sqlx::query_as::<_, FileRecord>(
            "INSERT INTO deployment_files \
             (deployment_id, original_name, storage_key, file_type, size_bytes, uploaded_by) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, deployment_id, original_name, storage_key, file_type, size_bytes, uploaded_by, uploaded_at",
        )
        .bind(new.deployment_id)
        .bind(&new.original_name)
        .bind(&new.storage_key)
        .bind(&new.file_type)
        .bind(new.size_bytes)
        .bind(new.uploaded_by)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn find_by_deployment(&self, deployment_id: Uuid) -> Result<Vec<FileDetail>, RepoError> {
        sqlx::query_as::<_, FileDetail>(
            "SELECT df.id, df.deployment_id, df.original_name, df.storage_key, df.file_type, \
                    df.size_bytes, df.uploaded_by, df.uploaded_at, u.email AS uploader_email \
             FROM deployment_files df \
             LEFT JOIN users u ON u.id = df.uploaded_by \
             WHERE df.deployment_id = $1 \
             ORDER BY df.uploaded_at DESC",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, RepoError> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, deployment_id, original_name, storage_key, file_type, size_bytes, uploaded_by, uploaded_at \
             FROM deployment_files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)
    }
}
