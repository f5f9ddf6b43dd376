//! HTTP error mapping. Every non-2xx body is `{status, code, message}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use compute_common::ComputeError;
use serde::Serialize;
use tracing::error;

use crate::auth::AuthError;

pub const INTERNAL_MESSAGE: &str = "An internal server error occurred";

const REDACTED: &str = "[REDACTED]";
const SECRET_KEYS: [&str; 4] = ["key=", "secret=", "password=", "token="];

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: u16,
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

/// The single `ComputeError -> (status, code)` table.
pub fn classify(err: &ComputeError) -> (StatusCode, &'static str) {
    match err {
        ComputeError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        ComputeError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        ComputeError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        ComputeError::QuotaExceeded(_) => (StatusCode::FORBIDDEN, "QUOTA_EXCEEDED"),
        ComputeError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        ComputeError::AlreadyExists(_)
        | ComputeError::InvalidState(_)
        | ComputeError::Canceled => (StatusCode::CONFLICT, "RESOURCE_CONFLICT"),
        ComputeError::Unsupported(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_FORMAT"),
        ComputeError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "INTERNAL_SERVER_ERROR"),
        ComputeError::Io(_) | ComputeError::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR")
        }
    }
}

impl From<ComputeError> for ApiError {
    fn from(err: ComputeError) -> Self {
        let (status, code) = classify(&err);
        Self::new(status, code, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::KeyGeneration | AuthError::InvalidLifetime(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                err.to_string(),
            ),
            _ => Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() {
            error!(status = self.status.as_u16(), code = self.code, error = %scrub(&self.message), "Request failed");
            INTERNAL_MESSAGE.to_string()
        } else {
            scrub(&self.message)
        };
        let body = ErrorBody {
            status: self.status.as_u16(),
            code: self.code,
            message: &message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Redact bearer tokens, credential-looking `k=v` values and absolute paths.
pub fn scrub(message: &str) -> String {
    let mut out = Vec::new();
    let mut redact_next = false;
    for word in message.split(' ') {
        if redact_next && !word.is_empty() {
            out.push(REDACTED.to_string());
            redact_next = false;
            continue;
        }
        if word.eq_ignore_ascii_case("bearer") {
            redact_next = true;
            out.push(word.to_string());
            continue;
        }
        out.push(scrub_word(word));
    }
    out.join(" ")
}

fn scrub_word(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if let Some(pos) = SECRET_KEYS
        .iter()
        .filter_map(|k| lower.find(k).map(|i| i + k.len()))
        .min()
    {
        let rest = &word[pos..];
        let end = rest.find(['&', ',', ';', '"', '\'']).unwrap_or(rest.len());
        return format!("{}{REDACTED}{}", &word[..pos], scrub_word(&rest[end..]));
    }

    let lead = word
        .find(|c: char| !matches!(c, '(' | '[' | '"' | '\'' | '`'))
        .unwrap_or(word.len());
    let body = &word[lead..];
    if body.starts_with('/') && body.len() > 1 {
        let trail = body
            .rfind(|c: char| !matches!(c, ')' | ']' | '"' | '\'' | '`' | ',' | '.' | ':' | ';'))
            .map(|i| i + 1)
            .unwrap_or(body.len());
        return format!("{}[PATH]{}", &word[..lead], &body[trail..]);
    }
    word.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_table() {
        let cases = [
            (ComputeError::InvalidInput("x".into()), 400, "INVALID_INPUT"),
            (ComputeError::Unauthorized("x".into()), 401, "UNAUTHORIZED"),
            (ComputeError::Forbidden("x".into()), 403, "FORBIDDEN"),
            (ComputeError::QuotaExceeded("x".into()), 403, "QUOTA_EXCEEDED"),
            (ComputeError::NotFound("x".into()), 404, "NOT_FOUND"),
            (ComputeError::AlreadyExists("x".into()), 409, "RESOURCE_CONFLICT"),
            (ComputeError::InvalidState("x".into()), 409, "RESOURCE_CONFLICT"),
            (ComputeError::Unsupported("x".into()), 400, "UNSUPPORTED_FORMAT"),
            (ComputeError::Unavailable("x".into()), 503, "INTERNAL_SERVER_ERROR"),
            (ComputeError::Internal("x".into()), 500, "INTERNAL_SERVER_ERROR"),
        ];
        for (err, status, code) in cases {
            let (s, c) = classify(&err);
            assert_eq!(s.as_u16(), status, "{err}");
            assert_eq!(c, code);
        }
    }

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let response =
            ApiError::from(ComputeError::Internal("virsh at /usr/bin/virsh crashed".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 500);
        assert_eq!(json["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(json["message"], INTERNAL_MESSAGE);
    }

    #[test]
    fn test_scrub() {
        assert_eq!(
            scrub("Authorization: Bearer abc.def failed"),
            "Authorization: Bearer [REDACTED] failed"
        );
        assert_eq!(
            scrub("dial tcp://host?token=s3cr3t&x=1 refused"),
            "dial tcp://host?token=[REDACTED]&x=1 refused"
        );
        assert_eq!(scrub("password=hunter2"), "password=[REDACTED]");
        assert_eq!(
            scrub("cannot open /var/lib/compute/exports/a.qcow2: denied"),
            "cannot open [PATH]: denied"
        );
        assert_eq!(scrub("image (/srv/img.raw) missing"), "image ([PATH]) missing");
        assert_eq!(scrub("instance web not found"), "instance web not found");
    }
}
