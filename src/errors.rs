use crate::{
    connectors::ProviderError,
    models::{bucket::BucketError, channel::ChannelIdError, pattern::PatternError},
    services::{
        buckets::BucketOpError,
        installation_store::StoreError,
        intake_service::{AdminError, NotificationError},
        lifecycle::LifecycleError,
    },
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by HTTP handlers; rendered as `{"error", "status"}` JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::RootFolderTaken(_) | StoreError::VersionConflict(_) => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        let status = match &err {
            ProviderError::Authorization(_) => StatusCode::FORBIDDEN,
            ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
            ProviderError::Application(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProviderError::Transport(_) | ProviderError::Timeout(_) => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<BucketOpError> for AppError {
    fn from(err: BucketOpError) -> Self {
        match err {
            BucketOpError::Provider(err) => err.into(),
            BucketOpError::Invalid(err) => err.into(),
            BucketOpError::NameTaken(_) | BucketOpError::Ambiguous(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            BucketOpError::NotABucket(_) | BucketOpError::NoSuchBucket(_) => {
                AppError::not_found(err.to_string())
            }
        }
    }
}

impl From<AdminError> for AppError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Store(err) => err.into(),
            AdminError::Bucket(err) => err.into(),
            AdminError::Provider(err) => err.into(),
            AdminError::Pattern(err) => AppError::bad_request(err.to_string()),
            AdminError::InvalidRoot(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Store(err) => err.into(),
            LifecycleError::Provider(err) => err.into(),
            LifecycleError::InvalidTransition { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
        }
    }
}

impl From<BucketError> for AppError {
    fn from(err: BucketError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<ChannelIdError> for AppError {
    fn from(err: ChannelIdError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::UnknownInstallation(_) | NotificationError::UnknownChannel(_) => {
                AppError::not_found(err.to_string())
            }
            NotificationError::NotServiceable { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            NotificationError::Store(err) => err.into(),
        }
    }
}
