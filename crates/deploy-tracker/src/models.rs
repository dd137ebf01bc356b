use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub application: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: String,
    pub changes: Option<String>,
    pub created_by: Uuid,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
}

/// Deployment row enriched with owning-service and creator identity, the
/// shape every read path and the creation workflow return.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct DeploymentDetail {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: String,
    pub changes: Option<String>,
    pub created_by: Uuid,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
    pub service_name: Option<String>,
    pub application: Option<String>,
    pub creator_email: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct FileRecord {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub original_name: String,
    pub storage_key: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct FileDetail {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub original_name: String,
    pub storage_key: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
    pub uploaded_at: DateTime<Utc>,
    pub uploader_email: Option<String>,
}
