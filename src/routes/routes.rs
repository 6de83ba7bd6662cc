//! Defines the HTTP surface of the intake service.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`: liveness
//!   - `GET  /readyz`: database and scratch directory checks
//!
//! - **Provider callbacks**
//!   - `POST /webhook`: Drive watch-channel notifications
//!
//! - **Administration** (API key required)
//!   - `GET|POST /installations`: list / create installations
//!   - `GET  /installations/{id}`: one installation (by id or root folder id)
//!   - `DELETE /installations/{id}`: tear down and forget an installation
//!   - `POST /installations/{id}/terminate`: mark for termination
//!   - `POST /installations/{id}/maintain`: run a maintenance pass now
//!   - `GET|POST /installations/{id}/buckets`: list / create buckets
//!   - `POST /installations/{id}/pattern`: create a set of buckets

use crate::{
    handlers::{
        admin_auth::{AdminAuth, require_admin_key},
        health_handlers::{healthz, readyz},
        installation_handlers::{
            apply_pattern, create_bucket, create_installation, get_installation, list_buckets,
            list_installations, maintain_installation, mark_for_termination,
            teardown_installation,
        },
        webhook_handlers::receive_notification,
    },
    services::intake_service::IntakeService,
};
use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Build the router; handlers share the `IntakeService` state and the
/// administrative routes sit behind `admin`.
pub fn routes(admin: AdminAuth) -> Router<IntakeService> {
    let administration = Router::new()
        .route(
            "/installations",
            get(list_installations).post(create_installation),
        )
        .route(
            "/installations/{id}",
            get(get_installation).delete(teardown_installation),
        )
        .route("/installations/{id}/terminate", post(mark_for_termination))
        .route("/installations/{id}/maintain", post(maintain_installation))
        .route(
            "/installations/{id}/buckets",
            get(list_buckets).post(create_bucket),
        )
        .route("/installations/{id}/pattern", post(apply_pattern))
        .route_layer(middleware::from_fn_with_state(admin, require_admin_key));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/webhook", post(receive_notification))
        .merge(administration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::webhook_handlers::{CHANNEL_ID_HEADER, RESOURCE_ID_HEADER, RESOURCE_STATE_HEADER},
        services::test_support::{Harness, ROOT},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "test-admin-key";

    fn app(h: &Harness) -> Router {
        routes(AdminAuth::new(Some(ADMIN_KEY.into()))).with_state(h.service.clone())
    }

    fn admin(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.header(header::AUTHORIZATION, format!("Bearer {ADMIN_KEY}"))
    }

    async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(h).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn notification(channel_id: Option<&str>, state: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(RESOURCE_ID_HEADER, "res-1");
        if let Some(channel_id) = channel_id {
            builder = builder.header(CHANNEL_ID_HEADER, channel_id);
        }
        if let Some(state) = state {
            builder = builder.header(RESOURCE_STATE_HEADER, state);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn get_admin(uri: &str) -> Request<Body> {
        admin(Request::get(uri)).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        admin(Request::builder())
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_report_ok() {
        let h = Harness::new().await;
        let (status, _) = send(&h, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&h, Request::get("/readyz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], json!(true));
        assert_eq!(body["checks"]["scratch"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn webhook_rejects_missing_and_malformed_channel_ids() {
        let h = Harness::new().await;
        let (status, body) = send(&h, notification(None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], json!(400));

        let (status, _) = send(&h, notification(Some("dof1-abc-inbox"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_rejects_unknown_and_idle_installations() {
        let h = Harness::new().await;
        let (status, _) = send(&h, notification(Some("dof1-77-inbox"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let inst = h.in_service().await;
        let channel = format!("dof1-{}-inbox", inst.id);
        h.service.mark_for_termination(inst.id).await.unwrap();
        let (status, _) = send(&h, notification(Some(&channel), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn webhook_accepts_known_channels() {
        let h = Harness::new().await;
        let inst = h.in_service().await;
        let channel = format!("dof1-{}-inbox", inst.id);

        let (status, body) = send(&h, notification(Some(&channel), Some("sync"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], json!("sync"));

        let (status, body) = send(&h, notification(Some(&channel), Some("update"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], json!("dispatched"));
    }

    #[tokio::test]
    async fn installation_admin_round_trip() {
        let h = Harness::new().await;
        let (status, created) = send(
            &h,
            post_json(
                "/installations",
                json!({
                    "creator": "owner@example.com",
                    "root_folder_id": ROOT,
                    "credentials": "token"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], json!("READY"));
        assert!(created.get("credentials").is_none());
        let id = created["id"].as_i64().unwrap();

        let (status, _) = send(
            &h,
            post_json(
                "/installations",
                json!({
                    "creator": "owner@example.com",
                    "root_folder_id": ROOT,
                    "credentials": "token"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, outcome) =
            send(&h, post_json(&format!("/installations/{id}/maintain"), Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["kind"], json!("activated"));

        let (status, buckets) = send(
            &h,
            get_admin(&format!("/installations/{id}/buckets")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(buckets.as_array().unwrap().len(), 3);

        let (status, _) = send(
            &h,
            post_json(
                &format!("/installations/{id}/buckets"),
                json!({ "name": "Scans", "action": "sort" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, found) = send(
            &h,
            get_admin(&format!("/installations/{ROOT}")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["id"], json!(id));

        let (status, marked) =
            send(&h, post_json(&format!("/installations/{id}/terminate"), Value::Null)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(marked["installation"]["status"], json!("MARKED_FOR_TERMINATION"));

        let (status, _) = send(
            &h,
            get_admin("/installations/999"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, torn_down) = send(
            &h,
            admin(Request::delete(format!("/installations/{id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(torn_down["installation_id"], json!(id));
        assert_eq!(send(&h, get_admin(&format!("/installations/{id}"))).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn administration_requires_api_key() {
        let h = Harness::new().await;

        let (status, body) = send(&h, Request::get("/installations").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], json!(401));

        let wrong = Request::get("/installations")
            .header(header::AUTHORIZATION, "Bearer not-the-key")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h, wrong).await.0, StatusCode::UNAUTHORIZED);

        let unauthenticated_create = Request::post("/installations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"creator": "a@example.com", "root_folder_id": ROOT, "credentials": "t"})
                    .to_string(),
            ))
            .unwrap();
        assert_eq!(send(&h, unauthenticated_create).await.0, StatusCode::UNAUTHORIZED);
        assert!(h.store.list(true).await.unwrap().is_empty());

        assert_eq!(send(&h, get_admin("/installations")).await.0, StatusCode::OK);
        let api_key = Request::get("/installations")
            .header("API-Key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h, api_key).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn administration_is_closed_without_configured_key() {
        let h = Harness::new().await;
        let app = routes(AdminAuth::new(None)).with_state(h.service.clone());
        let response = app
            .oneshot(
                Request::get("/installations")
                    .header(header::AUTHORIZATION, "Bearer ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pattern_endpoint_creates_buckets() {
        let h = Harness::new().await;
        let inst = h.installation().await;
        let (status, buckets) = send(
            &h,
            post_json(
                &format!("/installations/{}/pattern", inst.id),
                json!([{ "name": "Minutes" }, { "name": "Dues", "action": "classify" }]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(buckets.as_array().unwrap().len(), 2);

        let (status, _) = send(
            &h,
            post_json(&format!("/installations/{}/pattern", inst.id), json!([])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
