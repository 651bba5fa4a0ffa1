use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::entry::EntryId;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Malformed multipart body: {0}")]
    Multipart(String),
    #[error("Transfer incomplete: {delivered} of {expected} bytes delivered")]
    TransferIncomplete { delivered: u64, expected: u64 },
    #[error("Downstream failure: {0}")]
    DownstreamFailure(String),
    #[error("No downloader arrived within {0:?}")]
    NoDownloader(Duration),
    #[error("Entry {0} is already on the shelf")]
    DuplicateId(EntryId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn multipart(reason: impl Into<String>) -> Self {
        Self::Multipart(reason.into())
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {}", self);
        } else {
            log::debug!("request rejected with {}: {}", status, self);
        }
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
