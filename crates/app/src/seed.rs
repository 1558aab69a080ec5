use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use school_fees_storage::{Database, FeeError, NewFee, NewStudent, StudentError};

struct DemoStudent {
    number: &'static str,
    name: &'static str,
    grade: &'static str,
    /// `(fee type, amount in cents, due month, due day)` within the seeding year.
    fees: &'static [(&'static str, i64, u32, u32)],
}

const DEMO_STUDENTS: &[DemoStudent] = &[
    DemoStudent {
        number: "2024-0001",
        name: "Ana Santos",
        grade: "Grade 4",
        fees: &[("tuition", 1_500_000, 7, 1), ("books", 250_000, 7, 15)],
    },
    DemoStudent {
        number: "2024-0002",
        name: "Ben Cruz",
        grade: "Grade 6",
        fees: &[("tuition", 1_750_000, 7, 1), ("field_trip", 80_000, 9, 30)],
    },
];

/// Seeds demo students and fees into an empty database. Returns `true` when data was written.
pub async fn seed_demo(database: &Database, now: DateTime<Utc>) -> Result<bool, SeedError> {
    if database.students().count().await? > 0 {
        return Ok(false);
    }

    let year = now.year();
    let mut fees = 0;
    for demo in DEMO_STUDENTS {
        let student = database
            .students()
            .insert(&NewStudent {
                student_number: demo.number,
                full_name: demo.name,
                grade_level: Some(demo.grade),
                created_at: now,
            })
            .await?;
        for &(fee_type, cents, month, day) in demo.fees {
            let due_date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or(SeedError::InvalidDate(month, day))?;
            database
                .fees()
                .insert(&NewFee {
                    student_id: student.id,
                    fee_type,
                    amount: Decimal::new(cents, 2),
                    due_date,
                    created_at: now,
                })
                .await?;
            fees += 1;
        }
    }

    info!(
        stage = "app",
        students = DEMO_STUDENTS.len(),
        fees,
        "seeded demo ledger"
    );
    Ok(true)
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to seed student: {0}")]
    Student(#[from] StudentError),
    #[error("failed to seed fee: {0}")]
    Fee(#[from] FeeError),
    #[error("invalid demo due date {0}-{1}")]
    InvalidDate(u32, u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::{fixed_now, setup};
    use school_fees_storage::FeeQuery;

    #[tokio::test]
    async fn seeds_once() {
        let app = setup().await;
        let database = app.state.storage();

        assert!(seed_demo(database, fixed_now()).await.expect("seed"));
        assert!(!seed_demo(database, fixed_now()).await.expect("second seed"));

        assert_eq!(database.students().count().await.expect("count"), 2);
        let fees = database
            .fees()
            .list(&FeeQuery::default())
            .await
            .expect("fees");
        assert_eq!(fees.len(), 4);
        assert_eq!(fees[0].due_date, NaiveDate::from_ymd_opt(2024, 7, 1).expect("date"));
    }
}
