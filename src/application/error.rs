use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    cache::{ManagerError, RuleFileError, UnknownDriver},
    infra::error::InfraError,
};

/// Diagnostic chain attached to failing responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<UnknownDriver> for HttpError {
    fn from(error: UnknownDriver) -> Self {
        HttpError::from_error(
            "infra::http::unknown_driver",
            StatusCode::NOT_FOUND,
            "Unknown cache driver",
            &error,
        )
    }
}

impl From<ManagerError> for HttpError {
    fn from(error: ManagerError) -> Self {
        let source = "infra::http::manager_error_to_http_error";
        match error {
            ManagerError::NotRegistered(_) => HttpError::from_error(
                source,
                StatusCode::NOT_FOUND,
                "Cache driver not registered",
                &error,
            ),
            ManagerError::Inert(_) => HttpError::from_error(
                source,
                StatusCode::CONFLICT,
                "Cache driver unavailable",
                &error,
            ),
            ManagerError::Driver(ref err) => HttpError::from_error(
                source,
                StatusCode::BAD_GATEWAY,
                "Cache driver failed",
                err,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Rules(#[from] RuleFileError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Infra(InfraError::Database { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Infra(InfraError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(InfraError::Telemetry(_)) | AppError::Infra(InfraError::Io(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Rules(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Request could not be processed",
            AppError::Infra(InfraError::Database { .. }) => "Service temporarily unavailable",
            AppError::Infra(InfraError::Upstream { .. }) => "Upstream renderer unavailable",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Rules(_) => "Rewrite rules could not be updated",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
