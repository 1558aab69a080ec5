use chrono::NaiveDate;
use reqwest::{multipart, Client, Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use school_fees_core::{
    check_submission, validate_receipt_file, DashboardStatus, Fee, FeeDetail, FeeId,
    FeeStatusFilter, NewPayment, Payment, PaymentFilter, PaymentId, PaymentMethod,
    StudentId, SubmissionError, VerificationRequest, MAX_RECEIPT_BYTES,
};

/// Typed client for the fee ledger HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: String,
    max_receipt_bytes: u64,
}

impl ApiClient {
    pub fn new(base_url: Url, token: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
            max_receipt_bytes: MAX_RECEIPT_BYTES,
        }
    }

    /// Overrides the receipt ceiling checked before uploading.
    pub fn with_max_receipt_bytes(mut self, max_receipt_bytes: u64) -> Self {
        self.max_receipt_bytes = max_receipt_bytes;
        self
    }

    pub async fn list_fees(
        &self,
        student_id: Option<StudentId>,
        status: FeeStatusFilter,
    ) -> Result<Vec<Fee>, ClientError> {
        let mut url = self.base_url.join("fees")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(student_id) = student_id {
                query.append_pair("studentId", &student_id.to_string());
            }
            query.append_pair("status", status.as_str());
        }

        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    pub async fn get_fee(&self, fee_id: FeeId) -> Result<FeeDetail, ClientError> {
        let url = self.base_url.join(&format!("fees/{fee_id}"))?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    pub async fn list_payments(&self, filter: &PaymentFilter) -> Result<Vec<Payment>, ClientError> {
        let mut url = self.base_url.join("payments")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(status) = filter.status {
                query.append_pair("status", status.as_str());
            }
            if let Some(student_id) = filter.student_id {
                query.append_pair("studentId", &student_id.to_string());
            }
            if let Some(fee_id) = filter.fee_id {
                query.append_pair("feeId", &fee_id.to_string());
            }
        }

        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    pub async fn get_payment(&self, payment_id: PaymentId) -> Result<Payment, ClientError> {
        let url = self.base_url.join(&format!("payments/{payment_id}"))?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    /// Validates the form, uploads the receipt if any, then records the payment.
    ///
    /// Validation failures return before any request is sent.
    pub async fn submit_payment(&self, form: &PaymentForm) -> Result<Payment, ClientError> {
        check_submission(
            form.amount_paid,
            form.payment_method,
            form.reference_number.as_deref(),
            form.receipt.is_some(),
        )?;
        if let Some(receipt) = &form.receipt {
            validate_receipt_file(
                &receipt.content_type,
                receipt.bytes.len() as u64,
                self.max_receipt_bytes,
            )?;
        }

        let receipt_url = match &form.receipt {
            Some(receipt) => Some(self.upload_receipt(receipt).await?.url),
            None => None,
        };

        let body = NewPayment {
            fee_id: form.fee_id,
            student_id: form.student_id,
            amount_paid: form.amount_paid,
            payment_method: form.payment_method,
            payment_date: form.payment_date,
            reference_number: form.reference_number.clone(),
            receipt_url,
            notes: form.notes.clone(),
        };

        let url = self.base_url.join("payments")?;
        let response = self
            .authorized_request(Method::POST, url)
            .json(&body)
            .send()
            .await?;
        let payment: Payment = parse_json(response).await?;
        tracing::debug!(
            stage = "submission",
            payment_id = payment.id,
            fee_id = payment.fee_id,
            "payment submitted"
        );
        Ok(payment)
    }

    pub async fn upload_receipt(&self, receipt: &ReceiptFile) -> Result<UploadedReceipt, ClientError> {
        let part = multipart::Part::bytes(receipt.bytes.clone())
            .file_name(receipt.file_name.clone())
            .mime_str(&receipt.content_type)?;
        let form = multipart::Form::new().part("file", part);

        let url = self.base_url.join("uploads")?;
        let response = self
            .authorized_request(Method::POST, url)
            .multipart(form)
            .send()
            .await?;
        parse_json(response).await
    }

    pub async fn verify_payment(
        &self,
        payment_id: PaymentId,
        request: &VerificationRequest,
    ) -> Result<Payment, ClientError> {
        let url = self
            .base_url
            .join(&format!("payments/{payment_id}/verify"))?;
        let response = self
            .authorized_request(Method::PATCH, url)
            .json(request)
            .send()
            .await?;
        parse_json(response).await
    }

    pub async fn dashboard_status(&self) -> Result<DashboardStatus, ClientError> {
        let url = self.base_url.join("dashboard/status")?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }
}

/// Payment form as filled in by a student.
#[derive(Debug, Clone)]
pub struct PaymentForm {
    pub fee_id: FeeId,
    pub student_id: StudentId,
    pub amount_paid: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_date: Option<NaiveDate>,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub receipt: Option<ReceiptFile>,
}

/// A receipt image picked by the user.
#[derive(Debug, Clone)]
pub struct ReceiptFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedReceipt {
    pub url: String,
    pub pathname: String,
    pub content_type: String,
    pub size: u64,
}

/// `application/problem+json` body returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] SubmissionError),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: StatusCode,
        problem: Option<Problem>,
        body: String,
    },
}

impl ClientError {
    /// The single message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(err) => err.to_string(),
            Self::Url(_) | Self::Http(_) => {
                "Could not reach the server. Please try again.".to_string()
            }
            Self::Status {
                status,
                problem,
                body,
            } => problem
                .as_ref()
                .map(|problem| problem.detail.clone().unwrap_or_else(|| problem.title.clone()))
                .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("Request failed")
                        .to_string()
                }),
        }
    }

    /// The problem `type` reported by the server, if any.
    pub fn problem_type(&self) -> Option<&str> {
        match self {
            Self::Validation(err) => Some(err.code()),
            Self::Status {
                problem: Some(problem),
                ..
            } => Some(problem.kind.as_str()),
            _ => None,
        }
    }
}

async fn parse_json<T>(response: Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        let problem = serde_json::from_str::<Problem>(&body).ok();
        return Err(ClientError::Status {
            status,
            problem,
            body,
        });
    }

    Ok(response.json().await?)
}
