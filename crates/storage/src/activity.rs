use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use school_fees_core::{ChangeEvent, ChangeKind, ChangeScope, StudentId};

use crate::{to_rfc3339, RowDecodeError};

/// Repository over the append-only activity log.
///
/// Each committed mutation appends one row; its autoincrement `version` is
/// the version of the change event broadcast to subscribers.
#[derive(Clone)]
pub struct ActivityLogRepository {
    pool: SqlitePool,
}

impl ActivityLogRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends a record inside the caller's transaction and returns its version.
    pub async fn append(
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewActivity<'_>,
    ) -> Result<u64, ActivityLogError> {
        let (version,): (i64,) = sqlx::query_as(
            "INSERT INTO activity_log (kind, payment_id, fee_id, student_id, actor, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING version",
        )
        .bind(record.kind.as_str())
        .bind(record.scope.payment_id)
        .bind(record.scope.fee_id)
        .bind(record.scope.student_id)
        .bind(record.actor)
        .bind(to_rfc3339(record.created_at))
        .fetch_one(&mut **tx)
        .await?;

        Ok(version as u64)
    }

    /// Returns changes newer than `version`, oldest first, optionally for one student.
    pub async fn list_since(
        &self,
        version: u64,
        student_id: Option<StudentId>,
        limit: i64,
    ) -> Result<Vec<ChangeEvent>, ActivityLogError> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT version, kind, payment_id, fee_id, student_id, created_at \
               FROM activity_log \
              WHERE version > ? AND (? IS NULL OR student_id = ?) \
              ORDER BY version ASC \
              LIMIT ?",
        )
        .bind(version as i64)
        .bind(student_id)
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(ActivityLogError::from))
            .collect()
    }

    /// Returns the newest version, or 0 when nothing has been recorded yet.
    pub async fn latest_version(&self) -> Result<u64, ActivityLogError> {
        let (version,): (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM activity_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0) as u64)
    }
}

/// Payload required to append an activity record.
pub struct NewActivity<'a> {
    pub kind: ChangeKind,
    pub scope: ChangeScope,
    pub actor: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ActivityRow {
    version: i64,
    kind: String,
    payment_id: i64,
    fee_id: i64,
    student_id: i64,
    created_at: DateTime<Utc>,
}

impl ActivityRow {
    fn into_domain(self) -> Result<ChangeEvent, RowDecodeError> {
        Ok(ChangeEvent {
            version: self.version as u64,
            kind: self.kind.parse()?,
            scope: ChangeScope {
                payment_id: self.payment_id,
                fee_id: self.fee_id,
                student_id: self.student_id,
            },
            at: self.created_at,
        })
    }
}

#[derive(Debug, Error)]
pub enum ActivityLogError {
    #[error("failed to decode activity row: {0}")]
    Decode(#[from] RowDecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, day, seed_fee, setup_db};
    use crate::NewPaymentRecord;
    use rust_decimal::Decimal;
    use school_fees_core::{NewPayment, PaymentMethod};

    #[tokio::test]
    async fn list_since_replays_in_version_order_per_student() {
        let db = setup_db().await;
        let (student_a, fee_a) = seed_fee(&db, "S-1", Decimal::ONE_HUNDRED).await;
        let (student_b, fee_b) = seed_fee(&db, "S-2", Decimal::ONE_HUNDRED).await;

        let mut versions = Vec::new();
        for (student_id, fee_id) in [(student_a, fee_a), (student_b, fee_b), (student_a, fee_a)] {
            let outcome = db
                .payments()
                .submit(&NewPaymentRecord {
                    payment: &NewPayment {
                        fee_id,
                        student_id,
                        amount_paid: Decimal::ONE,
                        payment_method: PaymentMethod::Cash,
                        payment_date: None,
                        reference_number: None,
                        receipt_url: None,
                        notes: None,
                    },
                    payment_date: day("2024-06-01"),
                    recorded_by: None,
                    created_at: at("2024-06-01T08:00:00Z"),
                })
                .await
                .expect("submit");
            versions.push(outcome.event.version);
        }

        let repo = db.activity_log();
        assert_eq!(repo.latest_version().await.expect("latest"), versions[2]);

        let all = repo.list_since(0, None, 100).await.expect("all");
        assert_eq!(
            all.iter().map(|event| event.version).collect::<Vec<_>>(),
            versions
        );

        let after_first = repo
            .list_since(versions[0], Some(student_a), 100)
            .await
            .expect("since");
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].version, versions[2]);
        assert_eq!(after_first[0].kind, ChangeKind::PaymentSubmitted);
        assert_eq!(after_first[0].scope.fee_id, fee_a);
    }

    #[tokio::test]
    async fn latest_version_starts_at_zero() {
        let db = setup_db().await;
        assert_eq!(db.activity_log().latest_version().await.expect("latest"), 0);
    }
}
