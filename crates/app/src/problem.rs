use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

/// Error response rendered as `{"errors":[{"code": ..., "message": ...}]}`.
pub struct ProblemResponse {
    status: StatusCode,
    body: ErrorBody,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, code: &'static str, message: S) -> Self {
        Self {
            status,
            body: ErrorBody {
                errors: vec![ErrorEntry {
                    code,
                    message: message.into(),
                }],
            },
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response
    }
}
