use axum::{extract::State, Json};

use school_fees_core::DashboardStatus;

use crate::auth::Actor;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// School-wide counts and totals; staff only.
pub async fn status(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<DashboardStatus>, ProblemResponse> {
    actor.require_staff()?;
    let status = state.storage().reports().dashboard_status().await?;
    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use rust_decimal::Decimal;
    use serde_json::json;

    use crate::auth::Role;
    use crate::router::test_support::*;

    #[tokio::test]
    async fn reports_ledger_totals_to_staff() {
        let app = setup().await;
        let (student_id, fee_id) = seed_fee(&app.state, "S-1", Decimal::new(125050, 2)).await;
        let student = token(Role::Student, Some(student_id));

        let (status, _) = send(
            &app.router,
            "POST",
            "/payments",
            Some(&student),
            Some(json!({
                "feeId": fee_id,
                "studentId": student_id,
                "amountPaid": "250.50",
                "paymentMethod": "promissory_note"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(&app.router, "GET", "/dashboard/status", Some(&student), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            send(&app.router, "GET", "/dashboard/status", Some(&staff()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outstandingFees"], 1);
        assert_eq!(body["outstandingAmount"], "1250.5");
        assert_eq!(body["pendingPayments"], 1);
        assert_eq!(body["pendingAmount"], "250.5");
        assert_eq!(body["latestVersion"], 1);
    }
}
