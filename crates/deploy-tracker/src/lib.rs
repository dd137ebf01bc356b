pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod models;
pub mod secrets;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::{Pool, Postgres};
use utoipa::OpenApi;

use handlers::deployments::{
    attach_file, create_deployment, delete_deployment, download_file, get_deployment,
    list_deployments, list_deployments_by_service,
};
use handlers::health::health;
use handlers::readiness::readiness;
use services::deployments::{DeploymentRepository, PgDeploymentRepository};
use services::files::{FileRecordRepository, PgFileRecordRepository};
use services::workflow::DeploymentWorkflow;
use storage::ArtifactStore;
use telemetry::metrics_handler;

/// Request body cap for artifact uploads, shared by the router's body limit
/// and the outer `RequestBodyLimitLayer`.
pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Postgres>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub files: Arc<dyn FileRecordRepository>,
    pub storage: Arc<dyn ArtifactStore>,
    pub bucket: String,
    pub spool_dir: PathBuf,
}

impl AppState {
    pub fn new(
        db: Pool<Postgres>,
        storage: Arc<dyn ArtifactStore>,
        bucket: String,
        spool_dir: PathBuf,
    ) -> Self {
        Self {
            deployments: Arc::new(PgDeploymentRepository::new(db.clone())),
            files: Arc::new(PgFileRecordRepository::new(db.clone())),
            db,
            storage,
            bucket,
            spool_dir,
        }
    }

    pub fn workflow(&self) -> DeploymentWorkflow {
        DeploymentWorkflow::new(
            self.deployments.clone(),
            self.files.clone(),
            self.storage.clone(),
            self.bucket.clone(),
        )
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::deployments::create_deployment,
        handlers::deployments::attach_file,
        handlers::deployments::list_deployments,
        handlers::deployments::list_deployments_by_service,
        handlers::deployments::get_deployment,
        handlers::deployments::download_file,
        handlers::deployments::delete_deployment,
    ),
    components(schemas(
        error::ApiErrorBody,
        handlers::health::HealthResponse,
        handlers::readiness::ReadinessResponse,
        handlers::deployments::CreateDeploymentResponse,
        handlers::deployments::AttachFileResponse,
        handlers::deployments::DeploymentWithFiles,
        handlers::deployments::DeploymentListResponse,
        handlers::deployments::DeploymentResponse,
        handlers::deployments::DeleteResponse,
        handlers::deployments::DeploymentForm,
        models::DeploymentDetail,
        models::FileRecord,
        models::FileDetail,
    )),
    tags((name = "deploy-tracker", description = "Deployment Tracker API"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/deployments", post(create_deployment).get(list_deployments))
        .route(
            "/deployments/:id",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/deployments/:id/files", post(attach_file))
        .route("/deployments/:id/file", get(download_file))
        .route(
            "/services/:service_id/deployments",
            get(list_deployments_by_service),
        )
        .route(
            "/openapi.json",
            get(|| async move { axum::Json(openapi.clone()) }),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
