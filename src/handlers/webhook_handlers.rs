//! Inbound change notifications from Drive watch channels.
//!
//! Drive identifies the channel and watched resource in headers; the body is
//! empty. The channel id is decoded to recover the installation and folder,
//! and processing is handed to a background task so the provider gets its
//! acknowledgement quickly.

use crate::{errors::AppError, models::channel::ChannelId, services::intake_service::IntakeService};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use tracing::debug;

pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `POST /webhook`
pub async fn receive_notification(
    State(service): State<IntakeService>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let raw_channel = header(&headers, CHANNEL_ID_HEADER)
        .ok_or_else(|| AppError::bad_request("missing X-Goog-Channel-ID header"))?;
    let resource_id = header(&headers, RESOURCE_ID_HEADER)
        .ok_or_else(|| AppError::bad_request("missing X-Goog-Resource-ID header"))?;
    let resource_state = header(&headers, RESOURCE_STATE_HEADER);

    let channel = ChannelId::decode(raw_channel)?;
    debug!(
        installation_id = channel.installation_id,
        folder_id = %channel.folder_id,
        resource_id,
        resource_state,
        "notification received"
    );

    let ack = service
        .accept_notification(&channel, resource_state)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": ack }))))
}
