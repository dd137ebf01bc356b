//! Bearer-token authentication middleware.
//!
//! Token verification is a collaborator concern; the workflow only needs a
//! trusted caller id for `created_by` / `uploaded_by`. Disabled unless
//! `DT_AUTH_ENABLED=1`, which is how tests and local development run.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: Uuid,
}

fn is_auth_enabled() -> bool {
    std::env::var("DT_AUTH_ENABLED").unwrap_or_default() == "1"
}

fn extract_bearer(req: &Request) -> Option<String> {
    let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() == 2 && parts[0].eq_ignore_ascii_case("Bearer") {
        Some(parts[1].trim().to_string())
    } else {
        None
    }
}

// Constant-time equality
fn ct_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn validate_env_token(token: &str) -> Option<Identity> {
    let expected = std::env::var("DT_API_TOKEN").ok()?;
    if expected.is_empty() || !ct_equal(&expected, token) {
        return None;
    }
    let user_id = std::env::var("DT_API_USER_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(Uuid::nil);
    Some(Identity { user_id })
}

async fn validate_db_token(db: &sqlx::Pool<sqlx::Postgres>, token: &str) -> Option<Identity> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hex_hash = hex::encode(hasher.finalize());
    let row = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE token_hash = $1")
        .bind(&hex_hash)
        .fetch_optional(db)
        .await
        .ok()?;
    row.map(|user_id| Identity { user_id })
}

pub async fn auth_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    if !is_auth_enabled() {
        return Ok(next.run(req).await);
    }
    let path = req.uri().path();
    if matches!(path, "/health" | "/readyz" | "/metrics" | "/openapi.json") {
        return Ok(next.run(req).await);
    }
    let Some(token) = extract_bearer(&req) else {
        tracing::debug!(%path, "auth missing bearer token");
        return Err(
            ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token")
                .into_response(),
        );
    };
    let mode = std::env::var("DT_AUTH_MODE").unwrap_or_else(|_| "env".into());
    let identity = if mode == "db" {
        validate_db_token(&state.db, &token).await
    } else {
        validate_env_token(&token)
    };
    let Some(identity) = identity else {
        tracing::debug!(%path, "auth invalid token");
        return Err(
            ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token")
                .into_response(),
        );
    };
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
