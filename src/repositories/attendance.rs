use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;

use crate::{
    error::Result,
    models::attendance::{AttendanceRecord, InsertOutcome, PrincipalRole, SectionWindow, TokenIssue},
};

/// The persistence collaborator consulted by the verification chain.
///
/// Lookups answer `Ok(false)` for "does not exist"; `Err` is reserved for
/// data-access failures so an outage never reads as a rule violation.
#[async_trait]
pub trait AttendanceRepository: Send + Sync {
    /// Whether the teacher or student exists and is active.
    async fn find_active_principal(&self, role: PrincipalRole, id: &str) -> Result<bool>;

    /// Whether the class exists and is active.
    async fn find_active_class(&self, class_id: &str) -> Result<bool>;

    /// Whether the module exists.
    async fn find_module(&self, module_id: &str) -> Result<bool>;

    /// Whether the student is enrolled in the section.
    async fn is_enrolled(&self, student_id: &str, section_id: &str) -> Result<bool>;

    /// Whether attendance was already recorded for the student and section
    /// on `date` (UTC).
    async fn has_attendance_on(&self, student_id: &str, section_id: &str, date: NaiveDate) -> Result<bool>;

    /// Stores the record unless one exists for the same student, section
    /// and day. The check and the insert are a single atomic step.
    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome>;

    /// The section's records, optionally for one student, oldest first.
    async fn list_attendance(&self, section_id: &str, student_id: Option<&str>) -> Result<Vec<AttendanceRecord>>;

    /// Deletes the section's manual records and returns how many went.
    /// Scanned records are kept.
    async fn delete_manual_attendance(&self, section_id: &str) -> Result<u64>;

    /// The section's occurrences that can contain an instant on `date`:
    /// the ones starting the day before, the same day and the day after.
    /// Empty when the section has no schedule.
    async fn get_section_windows(&self, section_id: &str, date: NaiveDate) -> Result<Vec<SectionWindow>>;

    /// Appends a mint to the token issue log.
    async fn record_token_issue(&self, issue: &TokenIssue) -> Result<()>;

    /// Whether a class other than `other_than_class` minted a token for the
    /// same teacher and module after `since`.
    async fn has_recent_token_issue(
        &self,
        teacher_id: &str,
        module_id: &str,
        other_than_class: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Combines a section's time-of-day schedule with a calendar date. Sections
/// ending at or before their start time run past midnight.
pub fn window_on(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> SectionWindow {
    let start_at = date.and_time(start).and_utc();
    let end_date = if end <= start {
        date.checked_add_days(Days::new(1)).unwrap_or(date)
    } else {
        date
    };

    SectionWindow {
        start: start_at,
        end: end_date.and_time(end).and_utc(),
    }
}

/// The occurrences of a daily schedule anchored on the day before, the day
/// of, and the day after `date`. Overnight sections started the previous
/// evening and early entry before a section starting after midnight both
/// fall in a neighbouring day's occurrence.
pub fn windows_around(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Vec<SectionWindow> {
    [date.pred_opt(), Some(date), date.succ_opt()]
        .into_iter()
        .flatten()
        .map(|day| window_on(day, start, end))
        .collect()
}

/// A PostgreSQL-backed repository (schema in `migrations/`).
#[derive(Clone)]
pub struct PgAttendanceRepository {
    pool: Pool,
}

impl PgAttendanceRepository {
    /// Creates a new `PgAttendanceRepository`.
    ///
    /// # Arguments
    ///
    /// * `pool` - The database connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Runs a `SELECT EXISTS(..)` query.
    async fn query_exists(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client.query_one(query, params).await?;
        Ok(row.try_get::<_, bool>(0)?)
    }
}

#[async_trait]
impl AttendanceRepository for PgAttendanceRepository {
    async fn find_active_principal(&self, role: PrincipalRole, id: &str) -> Result<bool> {
        let query = match role {
            PrincipalRole::Teacher => {
                "SELECT EXISTS(SELECT 1 FROM teachers WHERE id = $1 AND is_active = true)"
            }
            PrincipalRole::Student => {
                "SELECT EXISTS(SELECT 1 FROM students WHERE id = $1 AND is_active = true)"
            }
        };
        self.query_exists(query, &[&id]).await
    }

    async fn find_active_class(&self, class_id: &str) -> Result<bool> {
        self.query_exists(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM classes c
                JOIN sections s ON s.id = c.section_id
                WHERE c.id = $1 AND c.is_active = true AND s.is_active = true
            )
            "#,
            &[&class_id],
        )
        .await
    }

    async fn find_module(&self, module_id: &str) -> Result<bool> {
        self.query_exists("SELECT EXISTS(SELECT 1 FROM modules WHERE id = $1)", &[&module_id])
            .await
    }

    async fn is_enrolled(&self, student_id: &str, section_id: &str) -> Result<bool> {
        self.query_exists(
            "SELECT EXISTS(SELECT 1 FROM enrollments WHERE student_id = $1 AND section_id = $2)",
            &[&student_id, &section_id],
        )
        .await
    }

    async fn has_attendance_on(&self, student_id: &str, section_id: &str, date: NaiveDate) -> Result<bool> {
        self.query_exists(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM attendance
                WHERE student_id = $1 AND section_id = $2 AND attendance_date = $3
            )
            "#,
            &[&student_id, &section_id, &date],
        )
        .await
    }

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome> {
        let client = self.pool.get().await?;
        let attendance_date = record.recorded_at.date_naive();
        let inserted = client
            .execute(
                r#"
                INSERT INTO attendance (student_id, section_id, module_id, recorded_at, attendance_date, manual)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (student_id, section_id, attendance_date) DO NOTHING
                "#,
                &[
                    &record.student_id,
                    &record.section_id,
                    &record.module_id,
                    &record.recorded_at,
                    &attendance_date,
                    &record.manual,
                ],
            )
            .await?;

        Ok(if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn list_attendance(&self, section_id: &str, student_id: Option<&str>) -> Result<Vec<AttendanceRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT student_id, section_id, module_id, recorded_at, manual
                FROM attendance
                WHERE section_id = $1 AND ($2::TEXT IS NULL OR student_id = $2)
                ORDER BY recorded_at, student_id
                "#,
                &[&section_id, &student_id],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(AttendanceRecord {
                    student_id: row.try_get("student_id")?,
                    section_id: row.try_get("section_id")?,
                    module_id: row.try_get("module_id")?,
                    recorded_at: row.try_get("recorded_at")?,
                    manual: row.try_get("manual")?,
                })
            })
            .collect()
    }

    async fn delete_manual_attendance(&self, section_id: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM attendance WHERE section_id = $1 AND manual = true",
                &[&section_id],
            )
            .await?;
        Ok(deleted)
    }

    async fn get_section_windows(&self, section_id: &str, date: NaiveDate) -> Result<Vec<SectionWindow>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT start_time, end_time FROM sections WHERE id = $1",
                &[&section_id],
            )
            .await?;

        match row {
            Some(r) => {
                let start: NaiveTime = r.try_get("start_time")?;
                let end: NaiveTime = r.try_get("end_time")?;
                Ok(windows_around(date, start, end))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn record_token_issue(&self, issue: &TokenIssue) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO token_issues (teacher_id, module_id, class_id, issued_at)
                VALUES ($1, $2, $3, $4)
                "#,
                &[&issue.teacher_id, &issue.module_id, &issue.class_id, &issue.issued_at],
            )
            .await?;
        Ok(())
    }

    async fn has_recent_token_issue(
        &self,
        teacher_id: &str,
        module_id: &str,
        other_than_class: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        self.query_exists(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM token_issues
                WHERE teacher_id = $1 AND module_id = $2 AND class_id <> $3 AND issued_at > $4
            )
            "#,
            &[&teacher_id, &module_id, &other_than_class, &since],
        )
        .await
    }
}
