//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the database and the scratch directory

use crate::services::intake_service::IntakeService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness check; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness check that:
/// 1. Runs `SELECT 1` against the installation store.
/// 2. Writes, reads back and removes a sentinel file in the scratch directory
///    PDFs are spooled to.
///
/// HTTP 200 when both checks pass, 503 otherwise.
pub async fn readyz(State(service): State<IntakeService>) -> impl IntoResponse {
    let sqlite_check = match service.store.ping().await {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let sentinel = service
        .settings
        .scratch_dir
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let scratch_check = match fs::write(&sentinel, b"readyz").await {
        Ok(()) => {
            let read_back = fs::read(&sentinel).await;
            let removed = fs::remove_file(&sentinel).await;
            match (read_back, removed) {
                (Ok(bytes), Ok(())) if bytes == b"readyz" => (true, None),
                (Ok(bytes), Err(e)) if bytes == b"readyz" => {
                    (true, Some(format!("could not remove sentinel file: {}", e)))
                }
                (Ok(_), _) => (false, Some("sentinel file content mismatch".to_string())),
                (Err(e), _) => (false, Some(format!("could not read sentinel file: {}", e))),
            }
        }
        Err(e) => (false, Some(format!("could not write sentinel file: {}", e))),
    };

    let overall_ok = sqlite_check.0 && scratch_check.0;
    let checks = HashMap::from([
        (
            "sqlite",
            CheckStatus {
                ok: sqlite_check.0,
                error: sqlite_check.1,
            },
        ),
        (
            "scratch",
            CheckStatus {
                ok: scratch_check.0,
                error: scratch_check.1,
            },
        ),
    ]);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
