//! Binary entrypoint for the Deployment Tracker service.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
};
use deploy_tracker::config::Settings;
use deploy_tracker::db::init_db;
use deploy_tracker::storage::build_store;
use deploy_tracker::telemetry::{normalize_path, HTTP_REQUESTS, HTTP_REQUEST_DURATION};
use deploy_tracker::{build_router, AppState, MAX_UPLOAD_BYTES};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;
use uuid::Uuid;

async fn track_metrics(mut req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let req_id = Uuid::new_v4();
    req.extensions_mut().insert(req_id);
    let start = std::time::Instant::now();
    let mut resp = next.run(req).await;
    let status = resp.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[method.as_str(), path_label.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), path_label.as_str()])
        .observe(start.elapsed().as_secs_f64());
    if let Ok(v) = HeaderValue::from_str(&req_id.to_string()) {
        resp.headers_mut().insert("x-request-id", v);
    }
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let settings = Settings::load().await;
    let db_pool = init_db(&settings.database_url).await?;
    let storage = build_store(&settings.storage).await;
    let state = AppState::new(
        db_pool,
        storage,
        settings.storage.bucket.clone(),
        settings.spool_dir.clone(),
    );

    let app = build_router(state)
        .layer(middleware::from_fn(track_metrics))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive());

    info!(addr=%settings.bind_addr, "deployment tracker listening");
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
