//! Deployment persistence.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{map_db_err, RepoError};
use crate::models::{Deployment, DeploymentDetail};

const DETAIL_SELECT: &str = r#"
SELECT d.id, d.service_id, d.version, d.changes, d.created_by, d.branch_name, d.created_at,
       s.name AS service_name, s.application, u.email AS creator_email
FROM deployments d
LEFT JOIN services s ON s.id = d.service_id
LEFT JOIN users u ON u.id = d.created_by
"#;

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub service_id: Uuid,
    pub version: String,
    pub changes: Option<String>,
    pub created_by: Uuid,
    pub branch_name: Option<String>,
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync + 'static {
    /// Fast-path uniqueness probe. The UNIQUE constraint enforced in
    /// `create` is the source of truth under concurrency.
    async fn version_exists(&self, service_id: Uuid, version: &str) -> Result<bool, RepoError>;

    async fn service_name(&self, service_id: Uuid) -> Result<Option<String>, RepoError>;

    /// Insert a deployment. A racing insert on the same (service_id,
    /// version) pair surfaces as `RepoError::UniqueViolation`.
    async fn create(&self, new: NewDeployment) -> Result<DeploymentDetail, RepoError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DeploymentDetail>, RepoError>;

    async fn find_all(&self) -> Result<Vec<DeploymentDetail>, RepoError>;

    async fn find_by_service(&self, service_id: Uuid) -> Result<Vec<DeploymentDetail>, RepoError>;

    /// Delete file rows then the deployment inside one transaction.
    /// Returns `Ok(None)` when no such deployment exists.
    async fn delete(&self, id: Uuid) -> Result<Option<Deployment>, RepoError>;
}

pub struct PgDeploymentRepository {
    pool: Pool<Postgres>,
}

impl PgDeploymentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeploymentRepository for PgDeploymentRepository {
    async fn version_exists(&self, service_id: Uuid, version: &str) -> Result<bool, RepoError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM deployments WHERE service_id = $1 AND version = $2)",
        )
        .bind(service_id)
        .bind(version)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn service_name(&self, service_id: Uuid) -> Result<Option<String>, RepoError> {
        sqlx::query_scalar::<_, String>("SELECT name FROM services WHERE id = $1")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    async fn create(&self, new: NewDeployment) -> Result<DeploymentDetail, RepoError> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO deployments (service_id, version, changes, created_by, branch_name) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(new.service_id)
        .bind(&new.version)
        .bind(&new.changes)
        .bind(new.created_by)
        .bind(new.branch_name.as_deref().unwrap_or("main"))
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        let detail = sqlx::query_as::<_, DeploymentDetail>(
            &format!("{DETAIL_SELECT} WHERE d.id = $1"),
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(detail)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DeploymentDetail>, RepoError> {
        sqlx::query_as::<_, DeploymentDetail>(&format!("{DETAIL_SELECT} WHERE d.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    async fn find_all(&self) -> Result<Vec<DeploymentDetail>, RepoError> {
        sqlx::query_as::<_, DeploymentDetail>(&format!(
            "{DETAIL_SELECT} ORDER BY d.created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn find_by_service(&self, service_id: Uuid) -> Result<Vec<DeploymentDetail>, RepoError> {
        sqlx::query_as::<_, DeploymentDetail>(&format!(
            "{DETAIL_SELECT} WHERE d.service_id = $1 ORDER BY d.created_at DESC"
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn delete(&self, id: Uuid) -> Result<Option<Deployment>, RepoError> {
        // Object-storage bytes referenced by the file rows are intentionally
        // left in place; only the rows are removed.
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        sqlx::query("DELETE FROM deployment_files WHERE deployment_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        let deleted = sqlx::query_as::<_, Deployment>(
            "DELETE FROM deployments WHERE id = $1 \
             RETURNING id, service_id, version, changes, created_by, branch_name, created_at",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        Ok(deleted)
    }
}
