//! End-to-end HTTP tests against a real Postgres database and the in-memory
//! artifact store. Each test skips when `DATABASE_URL` is unset.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use serial_test::serial;
use tower::ServiceExt;
use uuid::Uuid;

use deploy_tracker::build_router;
use deploy_tracker::test_support::{insert_service, try_test_state, TEST_BUCKET};

const BOUNDARY: &str = "dt-test-boundary-7f3a";

fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn count(pool: &sqlx::PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows")
}

async fn create_payments_deployment(
    app: &axum::Router,
    service_id: Uuid,
    version: &str,
) -> Value {
    let body = multipart_body(
        &[
            ("serviceId", &service_id.to_string()),
            ("version", version),
            ("changes", "initial release"),
        ],
        Some(("release.pdf", &[0u8; 5000])),
    );
    let resp = app
        .clone()
        .oneshot(multipart_request("/deployments", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    json_body(resp).await
}

#[tokio::test]
#[serial]
async fn create_deployment_end_to_end() {
    let Some((state, store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;

    let body = create_payments_deployment(&app, service_id, "2.3.1").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["deployment"]["version"], "2.3.1");
    assert_eq!(body["deployment"]["service_name"], "payments");
    assert_eq!(body["file"]["storage_key"], "/payments/2.3.1/release.pdf");
    assert_eq!(body["file"]["size_bytes"], 5000);
    assert!(store.contains(TEST_BUCKET, "/payments/2.3.1/release.pdf").await);
    assert_eq!(count(&pool, "deployments").await, 1);
    assert_eq!(count(&pool, "deployment_files").await, 1);
}

#[tokio::test]
#[serial]
async fn duplicate_version_is_conflict_with_no_side_effects() {
    let Some((state, store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;
    create_payments_deployment(&app, service_id, "1.0.0").await;

    let body = multipart_body(
        &[("serviceId", &service_id.to_string()), ("version", "1.0.0")],
        Some(("again.pdf", b"dup")),
    );
    let resp = app
        .clone()
        .oneshot(multipart_request("/deployments", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(count(&pool, "deployments").await, 1);
    assert_eq!(count(&pool, "deployment_files").await, 1);
    assert_eq!(store.object_count().await, 1);
}

#[tokio::test]
#[serial]
async fn create_without_file_is_bad_request() {
    let Some((state, store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;

    let body = multipart_body(
        &[("serviceId", &service_id.to_string()), ("version", "1.0.0")],
        None,
    );
    let resp = app
        .oneshot(multipart_request("/deployments", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(count(&pool, "deployments").await, 0);
    assert_eq!(store.object_count().await, 0);
}

#[tokio::test]
#[serial]
async fn create_with_unknown_service_is_bad_request() {
    let Some((state, _store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);

    let body = multipart_body(
        &[("serviceId", &Uuid::new_v4().to_string()), ("version", "1.0.0")],
        Some(("release.pdf", b"x")),
    );
    let resp = app
        .oneshot(multipart_request("/deployments", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(count(&pool, "deployments").await, 0);
}

#[tokio::test]
#[serial]
async fn get_deployment_returns_detail_or_404() {
    let Some((state, _store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;
    let created = create_payments_deployment(&app, service_id, "1.2.0").await;
    let id = created["deployment"]["id"].as_str().unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/deployments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["deployment"]["version"], "1.2.0");
    assert_eq!(body["files"].as_array().unwrap().len(), 1);

    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/deployments/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn list_by_service_filters_rows() {
    let Some((state, _store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let payments = insert_service(&pool, "payments", "billing").await;
    let ledger = insert_service(&pool, "ledger", "billing").await;
    create_payments_deployment(&app, payments, "1.0.0").await;
    create_payments_deployment(&app, payments, "1.1.0").await;
    create_payments_deployment(&app, ledger, "0.9.0").await;

    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/services/{payments}/deployments"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let versions: Vec<&str> = body["deployments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["version"].as_str().unwrap())
        .collect();
    // Newest first.
    assert_eq!(versions, ["1.1.0", "1.0.0"]);
}

#[tokio::test]
#[serial]
async fn delete_deployment_cascades_file_rows() {
    let Some((state, _store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;
    let created = create_payments_deployment(&app, service_id, "1.0.0").await;
    let id = created["deployment"]["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/deployments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(count(&pool, "deployments").await, 0);
    assert_eq!(count(&pool, "deployment_files").await, 0);

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/deployments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn download_redirects_to_signed_url() {
    let Some((state, _store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;
    let created = create_payments_deployment(&app, service_id, "1.0.0").await;
    let file_id = created["file"]["id"].as_str().unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/deployments/{file_id}/file"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = resp
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .expect("location header");
    assert!(location.contains("/payments/1.0.0/release.pdf"));
    assert!(location.contains("X-Amz-Expires=3600"));

    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/deployments/{}/file", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn attach_file_to_existing_deployment() {
    let Some((state, store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;
    let created = create_payments_deployment(&app, service_id, "1.0.0").await;
    let id = created["deployment"]["id"].as_str().unwrap();

    let body = multipart_body(&[], Some(("notes.docx", b"minutes")));
    let resp = app
        .clone()
        .oneshot(multipart_request(&format!("/deployments/{id}/files"), body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["file"]["storage_key"], "/payments/1.0.0/notes.docx");
    assert!(store.contains(TEST_BUCKET, "/payments/1.0.0/notes.docx").await);
    assert_eq!(count(&pool, "deployment_files").await, 2);

    // The detail view lists files most recent first.
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/deployments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(resp).await;
    let files = body["files"].as_array().unwrap();
    assert_eq!(files[0]["original_name"], "notes.docx");
    assert_eq!(files[1]["original_name"], "release.pdf");

    let body = multipart_body(&[], Some(("more.pdf", b"x")));
    let resp = app
        .oneshot(multipart_request(
            &format!("/deployments/{}/files", Uuid::new_v4()),
            body,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn unsupported_extension_is_rejected() {
    let Some((state, store)) = try_test_state().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pool = state.db.clone();
    let app = build_router(state);
    let service_id = insert_service(&pool, "payments", "billing").await;

    let body = multipart_body(
        &[("serviceId", &service_id.to_string()), ("version", "1.0.0")],
        Some(("tool.exe", b"MZ")),
    );
    let resp = app
        .oneshot(multipart_request("/deployments", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(count(&pool, "deployments").await, 0);
    assert_eq!(store.object_count().await, 0);
}
