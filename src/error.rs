//! Centralized error handling: one structured error type that knows whether
//! it is a bug, an expected failure, or an operational hiccup, and reports
//! itself to Sentry accordingly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable anonymized token for user-identifying values in logs.
pub fn hash_pii(data: &str) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Error category determines whether an error should be reported to Sentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Actual bugs that need investigation - ALWAYS report to Sentry
    Bug,
    /// Expected failures (auth, validation, not found) - never report to Sentry
    Expected,
    /// Operational issues (store outages, timeouts) - report as warnings
    Operational,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// User-facing message (sanitized)
    pub message: String,
    /// Internal detail for logging, never exposed to users
    pub internal_message: Option<String>,
    pub operation: &'static str,
    pub category: ErrorCategory,
    pub context: Vec<(&'static str, String)>,
}

impl AppError {
    pub fn bug(operation: &'static str, internal_msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error. Please try again or contact support.".to_string(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Bug,
            context: Vec::new(),
        }
    }

    pub fn expected(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: None,
            operation,
            category: ErrorCategory::Expected,
            context: Vec::new(),
        }
    }

    pub fn operational(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
        internal_msg: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: user_msg.into(),
            internal_message: Some(internal_msg.into()),
            operation,
            category: ErrorCategory::Operational,
            context: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Report this error to Sentry if appropriate for its category.
    pub fn report_to_sentry(&self) {
        match self.category {
            ErrorCategory::Bug => self.capture(sentry::Level::Error, "bug"),
            ErrorCategory::Operational => self.capture(sentry::Level::Warning, "operational"),
            ErrorCategory::Expected => self.add_sentry_breadcrumb(),
        }
    }

    fn capture(&self, level: sentry::Level, category_tag: &str) {
        sentry::with_scope(
            |scope| {
                scope.set_fingerprint(Some(&[self.operation, self.status.as_str()]));
                for (key, value) in &self.context {
                    scope.set_extra(key, value.clone().into());
                }
                scope.set_tag("operation", self.operation);
                scope.set_tag("status_code", self.status.as_str());
                scope.set_tag("error_category", category_tag);
            },
            || {
                let msg = format!(
                    "[{}] {} - {}",
                    self.operation,
                    self.status,
                    self.internal_message.as_deref().unwrap_or(&self.message)
                );
                sentry::capture_message(&msg, level);
            },
        );
    }

    fn add_sentry_breadcrumb(&self) {
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("expected_error".into()),
            message: Some(format!(
                "[{}] {} - {}",
                self.operation, self.status, self.message
            )),
            level: sentry::Level::Info,
            data: self
                .context
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone().into()))
                .collect(),
            ..Default::default()
        });
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.operation, self.status, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.report_to_sentry();

        let body = Json(ErrorResponse {
            error: self.message.clone(),
            code: Some(self.operation.to_string()),
        });

        (self.status, body).into_response()
    }
}

// Convenience constructors for the failure modes this service actually hits.
impl AppError {
    pub fn bad_request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::BAD_REQUEST, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::NOT_FOUND, operation, message)
    }

    pub fn unauthorized(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::UNAUTHORIZED, operation, message)
    }

    /// Database connection failure (bug - infrastructure issue)
    pub fn db_connection(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::bug(operation, format!("Database connection failed: {err}"))
    }

    /// Database query failure (bug - likely a code issue)
    pub fn db_query(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::bug(operation, format!("Database query failed: {err}"))
    }

    /// Object-store failure (operational - external service issue)
    pub fn storage(
        operation: &'static str,
        err: impl fmt::Display,
        user_message: impl Into<String>,
    ) -> Self {
        Self::operational(
            StatusCode::SERVICE_UNAVAILABLE,
            operation,
            user_message,
            format!("Storage error: {err}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_error_has_correct_status() {
        let err = AppError::bug("reconcile", "lifecycle transition failed");
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.category, ErrorCategory::Bug);
    }

    #[test]
    fn expected_error_has_correct_category() {
        let err = AppError::bad_request("upload_signature", "unsupported content type");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.category, ErrorCategory::Expected);
    }

    #[test]
    fn context_chaining() {
        let err = AppError::bug("sweep", "store delete failed")
            .with_context("dream_id", "3f2e")
            .with_context("user_hash", hash_pii("42"));
        assert_eq!(err.context.len(), 2);
    }
}
