use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use school_fees_blob::BlobError;
use school_fees_core::SubmissionError;
use school_fees_storage::{ActivityLogError, FeeError, PaymentError, ReportError};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn unauthorized<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    pub fn forbidden<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn bad_request<S: Into<String>>(problem_type: &'static str, detail: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, problem_type, detail)
    }

    /// Logs the underlying failure and hides it from the caller.
    pub fn internal(stage: &'static str, err: &dyn std::error::Error) -> Self {
        error!(stage, error = %err, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "the request could not be completed",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn problem_type(&self) -> &'static str {
        self.body.problem_type
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<SubmissionError> for ProblemResponse {
    fn from(err: SubmissionError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.code(), err.to_string())
    }
}

impl From<PaymentError> for ProblemResponse {
    fn from(err: PaymentError) -> Self {
        match &err {
            PaymentError::FeeNotFound(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "fee_not_found", err.to_string())
            }
            PaymentError::FeeNotOutstanding { .. } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "fee_not_outstanding",
                err.to_string(),
            ),
            PaymentError::StudentMismatch { .. } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "student_mismatch",
                err.to_string(),
            ),
            PaymentError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "payment_not_found", err.to_string())
            }
            PaymentError::Transition(_) => Self::new(
                StatusCode::CONFLICT,
                "payment_already_finalized",
                err.to_string(),
            ),
            PaymentError::FeeAlreadyPaid => {
                Self::new(StatusCode::CONFLICT, "fee_already_paid", err.to_string())
            }
            PaymentError::Decode(_) | PaymentError::Activity(_) | PaymentError::Database(_) => {
                Self::internal("storage", &err)
            }
        }
    }
}

impl From<FeeError> for ProblemResponse {
    fn from(err: FeeError) -> Self {
        match err {
            FeeError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "fee_not_found", "fee not found")
            }
            FeeError::Payments(inner) => Self::from(*inner),
            other => Self::internal("storage", &other),
        }
    }
}

impl From<ReportError> for ProblemResponse {
    fn from(err: ReportError) -> Self {
        Self::internal("storage", &err)
    }
}

impl From<ActivityLogError> for ProblemResponse {
    fn from(err: ActivityLogError) -> Self {
        Self::internal("events", &err)
    }
}

impl From<BlobError> for ProblemResponse {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::InvalidPathname(_) => {
                Self::bad_request("invalid_pathname", err.to_string())
            }
            BlobError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "blob_not_found", err.to_string())
            }
            _ => {
                error!(stage = "upload", error = %err, "blob storage failed");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "blob_storage_unavailable",
                    "receipt storage is unavailable",
                )
            }
        }
    }
}
