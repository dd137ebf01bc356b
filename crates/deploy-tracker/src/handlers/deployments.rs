//! Deployment HTTP surface: multipart intake, status mapping, read paths.

use std::io::Write;
use std::path::Path as FsPath;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Redirect,
    Extension, Json,
};
use once_cell::sync::Lazy;
use prometheus::IntCounter;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::models::{DeploymentDetail, FileDetail, FileRecord};
use crate::services::workflow::{CreateDeployment, StagedArtifact, TempSpool};
use crate::telemetry::REGISTRY;
use crate::AppState;

const SIGNED_URL_TTL_SECS: u64 = 3600;

static SIGNED_URL_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("artifact_signed_url_requests_total", "Signed download URL requests")
        .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

#[derive(Serialize, ToSchema)]
pub struct CreateDeploymentResponse {
    pub success: bool,
    pub deployment: DeploymentDetail,
    pub file: FileRecord,
}

#[derive(Serialize, ToSchema)]
pub struct AttachFileResponse {
    pub success: bool,
    pub file: FileRecord,
}

#[derive(Serialize, ToSchema)]
pub struct DeploymentWithFiles {
    #[serde(flatten)]
    pub deployment: DeploymentDetail,
    pub files: Vec<FileDetail>,
}

#[derive(Serialize, ToSchema)]
pub struct DeploymentListResponse {
    pub success: bool,
    pub deployments: Vec<DeploymentWithFiles>,
}

#[derive(Serialize, ToSchema)]
pub struct DeploymentResponse {
    pub success: bool,
    pub deployment: DeploymentDetail,
    pub files: Vec<FileDetail>,
}

#[derive(Serialize, ToSchema)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: &'static str,
}

/// Multipart form for deployment creation (documentation shape only).
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct DeploymentForm {
    service_id: String,
    version: String,
    changes: Option<String>,
    branch_name: Option<String>,
    #[schema(value_type = String, format = Binary)]
    file: String,
}

struct Intake {
    service_id: Option<String>,
    version: Option<String>,
    changes: Option<String>,
    branch_name: Option<String>,
    artifact: Option<StagedArtifact>,
}

/// Drain the multipart stream, spooling the file field to local disk.
async fn read_multipart(spool_dir: &FsPath, mut multipart: Multipart) -> ApiResult<Intake> {
    let mut intake = Intake {
        service_id: None,
        version: None,
        changes: None,
        branch_name: None,
        artifact: None,
    };
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("serviceId") => intake.service_id = Some(read_text(field).await?),
            Some("version") => intake.version = Some(read_text(field).await?),
            Some("changes") => intake.changes = Some(read_text(field).await?),
            Some("branchName") => intake.branch_name = Some(read_text(field).await?),
            Some("file") => {
                let original_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ApiError::bad_request("file field is missing a filename"))?;
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let (spool, mut out) = TempSpool::create(spool_dir)
                    .map_err(|e| ApiError::internal(format!("artifact staging failed: {e}")))?;
                let mut size: i64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("artifact upload aborted: {e}")))?
                {
                    out.write_all(&chunk)
                        .map_err(|e| ApiError::internal(format!("artifact staging failed: {e}")))?;
                    size += chunk.len() as i64;
                }
                intake.artifact = Some(StagedArtifact {
                    original_name,
                    content_type,
                    size_bytes: size,
                    spool,
                });
            }
            _ => {}
        }
    }
    Ok(intake)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart field: {e}")))
}

fn caller_id(identity: Option<Extension<Identity>>) -> Uuid {
    identity.map(|Extension(i)| i.user_id).unwrap_or_else(Uuid::nil)
}

/// Create a deployment with its mandatory artifact
#[utoipa::path(post, path = "/deployments",
    request_body(content = DeploymentForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, body = CreateDeploymentResponse),
        (status = 400, body = crate::error::ApiErrorBody, description = "Missing file or invalid fields"),
        (status = 409, body = crate::error::ApiErrorBody, description = "Version already exists for service"),
        (status = 500, body = crate::error::ApiErrorBody),
    ))]
#[tracing::instrument(level = "info", skip(state, identity, multipart))]
pub async fn create_deployment(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<CreateDeploymentResponse>)> {
    let created_by = caller_id(identity);
    let intake = read_multipart(&state.spool_dir, multipart).await?;
    let Some(artifact) = intake.artifact else {
        return Err(ApiError::bad_request(
            "File upload is mandatory for deployment creation",
        ));
    };
    let service_id: Uuid = intake
        .service_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("serviceId is required"))?
        .parse()
        .map_err(|_| ApiError::bad_request("serviceId must be a UUID"))?;
    let version = intake
        .version
        .ok_or_else(|| ApiError::bad_request("version is required"))?;

    let input = CreateDeployment {
        service_id,
        version,
        changes: intake.changes,
        branch_name: intake.branch_name,
        created_by,
    };
    // Run on a spawned task: a client disconnect drops this handler future,
    // but compensation inside the workflow must still run to completion.
    let workflow = state.workflow();
    let (deployment, file) = tokio::spawn(async move {
        workflow.create_with_artifact(input, artifact).await
    })
    .await
    .map_err(|e| {
        error!(error=%e, "deployment workflow task failed");
        ApiError::internal("workflow task failed")
    })??;
    Ok((
        StatusCode::CREATED,
        Json(CreateDeploymentResponse { success: true, deployment, file }),
    ))
}

/// Attach an additional artifact to an existing deployment
#[utoipa::path(post, path = "/deployments/{id}/files",
    params(("id" = Uuid, Path, description = "Deployment id")),
    request_body(content = DeploymentForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, body = AttachFileResponse),
        (status = 404, body = crate::error::ApiErrorBody),
        (status = 500, body = crate::error::ApiErrorBody),
    ))]
#[tracing::instrument(level = "info", skip(state, identity, multipart))]
pub async fn attach_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Option<Extension<Identity>>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<AttachFileResponse>)> {
    let uploaded_by = caller_id(identity);
    let intake = read_multipart(&state.spool_dir, multipart).await?;
    let Some(artifact) = intake.artifact else {
        return Err(ApiError::bad_request("No file uploaded"));
    };
    let workflow = state.workflow();
    let file = tokio::spawn(async move {
        workflow.attach_artifact(id, uploaded_by, artifact).await
    })
    .await
    .map_err(|e| {
        error!(error=%e, "attach workflow task failed");
        ApiError::internal("workflow task failed")
    })??;
    Ok((StatusCode::CREATED, Json(AttachFileResponse { success: true, file })))
}

/// List all deployments with their files
#[utoipa::path(get, path = "/deployments",
    responses((status = 200, body = DeploymentListResponse)))]
pub async fn list_deployments(
    State(state): State<AppState>,
) -> ApiResult<Json<DeploymentListResponse>> {
    let deployments = state.deployments.find_all().await?;
    let mut out = Vec::with_capacity(deployments.len());
    for deployment in deployments {
        let files = state.files.find_by_deployment(deployment.id).await?;
        out.push(DeploymentWithFiles { deployment, files });
    }
    Ok(Json(DeploymentListResponse { success: true, deployments: out }))
}

/// List deployments for one service
#[utoipa::path(get, path = "/services/{service_id}/deployments",
    params(("service_id" = Uuid, Path, description = "Service id")),
    responses((status = 200, body = DeploymentListResponse)))]
pub async fn list_deployments_by_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<DeploymentListResponse>> {
    let deployments = state.deployments.find_by_service(service_id).await?;
    let mut out = Vec::with_capacity(deployments.len());
    for deployment in deployments {
        let files = state.files.find_by_deployment(deployment.id).await?;
        out.push(DeploymentWithFiles { deployment, files });
    }
    Ok(Json(DeploymentListResponse { success: true, deployments: out }))
}

/// Get one deployment with its files
#[utoipa::path(get, path = "/deployments/{id}",
    params(("id" = Uuid, Path, description = "Deployment id")),
    responses(
        (status = 200, body = DeploymentResponse),
        (status = 404, body = crate::error::ApiErrorBody),
    ))]
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeploymentResponse>> {
    let deployment = state
        .deployments
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Deployment not found"))?;
    let files = state.files.find_by_deployment(id).await?;
    Ok(Json(DeploymentResponse { success: true, deployment, files }))
}

/// Redirect to a time-limited signed URL for a stored artifact
#[utoipa::path(get, path = "/deployments/{id}/file",
    params(("id" = Uuid, Path, description = "File id")),
    responses(
        (status = 307, description = "Redirect to signed URL"),
        (status = 404, body = crate::error::ApiErrorBody),
    ))]
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Redirect> {
    let file = state
        .files
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    SIGNED_URL_REQUESTS.inc();
    let url = state
        .storage
        .signed_url(
            &state.bucket,
            &file.storage_key,
            std::time::Duration::from_secs(SIGNED_URL_TTL_SECS),
        )
        .await?;
    Ok(Redirect::temporary(&url))
}

/// Delete a deployment and its file rows
#[utoipa::path(delete, path = "/deployments/{id}",
    params(("id" = Uuid, Path, description = "Deployment id")),
    responses(
        (status = 200, body = DeleteResponse),
        (status = 404, body = crate::error::ApiErrorBody),
    ))]
#[tracing::instrument(level = "info", skip(state))]
pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeleteResponse>> {
    // Stored object bytes are intentionally not reclaimed here; see the
    // repository delete for the row-level cascade.
    match state.deployments.delete(id).await? {
        Some(_) => Ok(Json(DeleteResponse {
            success: true,
            message: "Deployment deleted successfully",
        })),
        None => Err(ApiError::not_found("Deployment not found")),
    }
}
