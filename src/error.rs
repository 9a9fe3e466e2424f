use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Request-scoped failures. Every variant maps onto exactly one HTTP status;
/// handlers return these and never panic the connection.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("tile not present")]
    NoContent,
    #[error("{0}")]
    Upstream(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
    #[error("worker pool is shut down")]
    PoolDisposed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NoContent => StatusCode::NO_CONTENT,
            ServiceError::Upstream(_)
            | ServiceError::Render(_)
            | ServiceError::WorkerPanic(_)
            | ServiceError::PoolDisposed
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::NO_CONTENT {
            return status.into_response();
        }
        (status, self.to_string()).into_response()
    }
}
