use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::Deserialize;

use school_fees_core::{Fee, FeeDetail, FeeId, FeeStatusFilter, StudentId};
use school_fees_storage::FeeQuery;

use crate::auth::Actor;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeListQuery {
    #[serde(default)]
    student_id: Option<StudentId>,
    #[serde(default)]
    status: FeeStatusFilter,
}

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    query: Result<Query<FeeListQuery>, QueryRejection>,
) -> Result<Json<Vec<Fee>>, ProblemResponse> {
    let Query(query) =
        query.map_err(|err| ProblemResponse::bad_request("invalid_query", err.body_text()))?;
    let student_id = actor.scope_student(query.student_id)?;

    let fees = state
        .storage()
        .fees()
        .list(&FeeQuery {
            student_id,
            status: query.status.status(),
        })
        .await?;
    Ok(Json(fees))
}

pub async fn detail(
    State(state): State<AppState>,
    actor: Actor,
    Path(fee_id): Path<FeeId>,
) -> Result<Json<FeeDetail>, ProblemResponse> {
    let detail = state.storage().fees().fetch_detail(fee_id).await?;
    if !actor.can_access(detail.fee.student_id) {
        return Err(ProblemResponse::from(
            school_fees_storage::FeeError::NotFound,
        ));
    }
    Ok(Json(detail))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use rust_decimal::Decimal;
    use serde_json::json;

    use crate::auth::Role;
    use crate::router::test_support::*;

    #[tokio::test]
    async fn students_see_only_their_outstanding_fees() {
        let app = setup().await;
        let (student_a, fee_a) = seed_fee(&app.state, "S-1", Decimal::new(50000, 2)).await;
        let (student_b, _) = seed_fee(&app.state, "S-2", Decimal::new(100, 0)).await;
        let token_a = token(Role::Student, Some(student_a));

        let (status, body) = send(&app.router, "GET", "/fees", Some(&token_a), None).await;
        assert_eq!(status, StatusCode::OK);
        let fees = body.as_array().expect("array");
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0]["id"], fee_a);
        assert_eq!(fees[0]["amount"], "500.00");
        assert_eq!(fees[0]["status"], "outstanding");

        let (status, body) = send(
            &app.router,
            "GET",
            &format!("/fees?studentId={student_b}"),
            Some(&token_a),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["type"], "forbidden");

        let (status, body) = send(&app.router, "GET", "/fees?status=all", Some(&staff()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().expect("array").len(), 2);
    }

    #[tokio::test]
    async fn detail_lists_payment_attempts() {
        let app = setup().await;
        let (student_id, fee_id) = seed_fee(&app.state, "S-1", Decimal::new(500, 0)).await;
        let student = token(Role::Student, Some(student_id));

        let (status, _) = send(
            &app.router,
            "POST",
            "/payments",
            Some(&student),
            Some(json!({
                "feeId": fee_id,
                "studentId": student_id,
                "amountPaid": "500",
                "paymentMethod": "cash"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) =
            send(&app.router, "GET", &format!("/fees/{fee_id}"), Some(&student), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], fee_id);
        assert_eq!(body["payments"].as_array().expect("payments").len(), 1);

        let (status, body) = send(&app.router, "GET", "/fees/999", Some(&staff()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "fee_not_found");
    }

    #[tokio::test]
    async fn unknown_status_filter_is_a_bad_request() {
        let app = setup().await;
        let (status, body) =
            send(&app.router, "GET", "/fees?status=overdue", Some(&staff()), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_query");
    }
}
