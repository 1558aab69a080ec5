use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use metrics::counter;
use serde::Deserialize;
use tracing::{info, warn};

use school_fees_core::{
    FeeId, NewPayment, Payment, PaymentFilter, PaymentId, PaymentStatus, StudentId,
    VerificationRequest,
};
use school_fees_storage::{NewPaymentRecord, PaymentError, Verification};

use crate::auth::Actor;
use crate::problem::ProblemResponse;
use crate::router::AppState;

pub async fn submit(
    State(state): State<AppState>,
    actor: Actor,
    payload: Result<Json<NewPayment>, JsonRejection>,
) -> Result<(StatusCode, Json<Payment>), ProblemResponse> {
    let Json(payload) = payload.map_err(invalid_body)?;
    let payload = payload.normalized();

    if !actor.can_access(payload.student_id) {
        return Err(reject(ProblemResponse::forbidden(
            "students may only pay their own fees",
        )));
    }
    payload
        .validate()
        .map_err(|err| reject(ProblemResponse::from(err)))?;

    let payment_date = payload.payment_date.unwrap_or_else(|| state.today());
    let outcome = state
        .storage()
        .payments()
        .submit(&NewPaymentRecord {
            payment: &payload,
            payment_date,
            recorded_by: Some(actor.subject.as_str()),
            created_at: state.now(),
        })
        .await
        .map_err(|err| reject(ProblemResponse::from(err)))?;

    counter!(
        "payments_submitted_total",
        "method" => outcome.payment.payment_method.as_str()
    )
    .increment(1);
    info!(
        stage = "submission",
        payment_id = outcome.payment.id,
        fee_id = outcome.payment.fee_id,
        student_id = outcome.payment.student_id,
        method = outcome.payment.payment_method.as_str(),
        recorded_by = %actor.subject,
        version = outcome.event.version,
        "payment submitted"
    );
    state.changes().publish(outcome.event);

    Ok((StatusCode::CREATED, Json(outcome.payment)))
}

fn reject(problem: ProblemResponse) -> ProblemResponse {
    counter!(
        "payment_submissions_rejected_total",
        "reason" => problem.problem_type()
    )
    .increment(1);
    warn!(
        stage = "submission",
        reason = problem.problem_type(),
        "payment submission rejected"
    );
    problem
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentListQuery {
    #[serde(default)]
    status: Option<PaymentStatus>,
    #[serde(default)]
    student_id: Option<StudentId>,
    #[serde(default)]
    fee_id: Option<FeeId>,
}

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    query: Result<Query<PaymentListQuery>, QueryRejection>,
) -> Result<Json<Vec<Payment>>, ProblemResponse> {
    let Query(query) =
        query.map_err(|err| ProblemResponse::bad_request("invalid_query", err.body_text()))?;
    let filter = PaymentFilter {
        status: query.status,
        student_id: actor.scope_student(query.student_id)?,
        fee_id: query.fee_id,
    };

    let payments = state.storage().payments().list(&filter).await?;
    Ok(Json(payments))
}

pub async fn detail(
    State(state): State<AppState>,
    actor: Actor,
    Path(payment_id): Path<PaymentId>,
) -> Result<Json<Payment>, ProblemResponse> {
    let payment = state.storage().payments().fetch(payment_id).await?;
    if !actor.can_access(payment.student_id) {
        return Err(PaymentError::NotFound.into());
    }
    Ok(Json(payment))
}

pub async fn verify(
    State(state): State<AppState>,
    actor: Actor,
    Path(payment_id): Path<PaymentId>,
    payload: Result<Json<VerificationRequest>, JsonRejection>,
) -> Result<Json<Payment>, ProblemResponse> {
    actor.require_staff()?;
    let Json(request) = payload.map_err(invalid_body)?;
    let notes = request
        .notes
        .as_deref()
        .map(str::trim)
        .filter(|notes| !notes.is_empty());

    let result = state
        .storage()
        .payments()
        .verify(&Verification {
            payment_id,
            decision: request.status,
            verified_by: &actor.subject,
            notes,
            decided_at: state.now(),
        })
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            let problem = ProblemResponse::from(err);
            counter!(
                "payment_verifications_total",
                "result" => problem.problem_type()
            )
            .increment(1);
            warn!(
                stage = "verification",
                payment_id,
                decision = request.status.as_str(),
                reason = problem.problem_type(),
                "verification refused"
            );
            return Err(problem);
        }
    };

    counter!(
        "payment_verifications_total",
        "result" => request.status.as_str()
    )
    .increment(1);
    info!(
        stage = "verification",
        payment_id,
        fee_id = outcome.fee.id,
        decision = request.status.as_str(),
        fee_status = outcome.fee.status.as_str(),
        verified_by = %actor.subject,
        version = outcome.event.version,
        "payment verified"
    );
    state.changes().publish(outcome.event);

    Ok(Json(outcome.payment))
}

fn invalid_body(err: JsonRejection) -> ProblemResponse {
    ProblemResponse::new(err.status(), "invalid_body", err.body_text())
}
