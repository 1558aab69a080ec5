use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use school_fees_core::Student;

use crate::{is_constraint, to_rfc3339, SQLITE_CONSTRAINT_UNIQUE};

/// Repository for the `students` table.
#[derive(Clone)]
pub struct StudentRepository {
    pool: SqlitePool,
}

impl StudentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a student, rejecting duplicate student numbers.
    pub async fn insert(&self, record: &NewStudent<'_>) -> Result<Student, StudentError> {
        let row = sqlx::query_as::<_, StudentRow>(
            "INSERT INTO students (student_number, full_name, grade_level, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, student_number, full_name, grade_level, created_at",
        )
        .bind(record.student_number)
        .bind(record.full_name)
        .bind(record.grade_level)
        .bind(to_rfc3339(record.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_constraint(&err, SQLITE_CONSTRAINT_UNIQUE) {
                StudentError::DuplicateNumber(record.student_number.to_string())
            } else {
                StudentError::Database(err)
            }
        })?;

        Ok(row.into())
    }

    pub async fn count(&self) -> Result<i64, StudentError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM students")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StudentRow {
    id: i64,
    student_number: String,
    full_name: String,
    grade_level: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<StudentRow> for Student {
    fn from(row: StudentRow) -> Self {
        Self {
            id: row.id,
            student_number: row.student_number,
            full_name: row.full_name,
            grade_level: row.grade_level,
            created_at: row.created_at,
        }
    }
}

/// Data required to register a student.
pub struct NewStudent<'a> {
    pub student_number: &'a str,
    pub full_name: &'a str,
    pub grade_level: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StudentError {
    #[error("student number {0} is already registered")]
    DuplicateNumber(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, setup_db};

    #[tokio::test]
    async fn insert_returns_the_stored_student() {
        let db = setup_db().await;
        let repo = db.students();
        let created = repo
            .insert(&NewStudent {
                student_number: "2024-0001",
                full_name: "Miguel Reyes",
                grade_level: None,
                created_at: at("2024-01-01T00:00:00Z"),
            })
            .await
            .expect("insert");

        assert_eq!(created.student_number, "2024-0001");
        assert_eq!(created.full_name, "Miguel Reyes");
        assert!(created.grade_level.is_none());
        assert_eq!(created.created_at, at("2024-01-01T00:00:00Z"));
        assert_eq!(repo.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn duplicate_student_number_is_reported() {
        let db = setup_db().await;
        let repo = db.students();
        let record = NewStudent {
            student_number: "2024-0002",
            full_name: "Liza Cruz",
            grade_level: Some("Grade 9"),
            created_at: at("2024-01-01T00:00:00Z"),
        };
        repo.insert(&record).await.expect("first insert");

        let err = repo.insert(&record).await.unwrap_err();
        assert!(matches!(err, StudentError::DuplicateNumber(number) if number == "2024-0002"));
    }
}
