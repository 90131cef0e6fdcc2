// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::attendance_book::BookError;
use crate::backend_client::BackendError;
use crate::bulk_import::ImportError;
use crate::calendar::CalendarError;
use crate::snapshot::SnapshotError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Book(#[from] BookError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("Import failed: {0}")]
    Import(#[from] ImportError),
    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Backend failed: {0}")]
    Backend(#[from] BackendError),
    #[error("Missing or invalid actor: {0}")]
    Unauthenticated(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Book(e) => match e {
                BookError::MemberNotFound(_) | BookError::ReportNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                BookError::Forbidden { .. } => StatusCode::FORBIDDEN,
                BookError::WeekFinalized { .. } | BookError::AlreadyFinalized { .. } => {
                    StatusCode::CONFLICT
                }
                BookError::InvalidMember(_) => StatusCode::BAD_REQUEST,
            },
            AppError::Calendar(_) | AppError::Import(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }

        let message = match &self {
            // Internal details stay in the log.
            AppError::Snapshot(_) => "Internal server error (snapshot). Check logs.".to_string(),
            AppError::Backend(_) => "Backend request failed. Check logs.".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
