use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::attendance::{AttendanceRecord, InsertOutcome};
use crate::models::events::validate_id;
use crate::repositories::attendance::AttendanceRepository;
use crate::services::verification::{VerificationChain, VerificationContext};

/// Stores a record, reporting a lost insert race as `AlreadyRecorded`.
pub async fn commit(repo: &dyn AttendanceRepository, record: AttendanceRecord) -> Result<AttendanceRecord> {
    match repo.insert_attendance(&record).await? {
        InsertOutcome::Inserted => Ok(record),
        InsertOutcome::Duplicate => Err(AppError::AlreadyRecorded {
            student_id: record.student_id,
            section_id: record.section_id,
        }),
    }
}

/// A teacher's request to mark a student present without a scan.
#[derive(Debug, Clone)]
pub struct ManualEntry {
    pub teacher_id: String,
    pub student_id: String,
    pub class_id: String,
    pub section_id: String,
    pub module_id: String,
}

/// Registers attendance by hand.
///
/// The teacher, class, module and enrollment are checked like a scan, but
/// there is no token and no time window.
///
/// # Arguments
///
/// * `repo` - The attendance repository.
/// * `entry` - Who is registering whom, and where.
/// * `at` - The instant the attendance counts for.
pub async fn record_manual(
    repo: &dyn AttendanceRepository,
    entry: &ManualEntry,
    at: DateTime<Utc>,
) -> Result<AttendanceRecord> {
    validate_id("teacher_id", &entry.teacher_id)?;
    validate_id("student_id", &entry.student_id)?;
    validate_id("class_id", &entry.class_id)?;
    validate_id("section_id", &entry.section_id)?;
    validate_id("module_id", &entry.module_id)?;

    let ctx = VerificationContext::for_manual(
        &entry.teacher_id,
        &entry.student_id,
        &entry.class_id,
        &entry.section_id,
        &entry.module_id,
        at,
    );
    VerificationChain::manual().verify(repo, &ctx).await?;

    let record = commit(
        repo,
        AttendanceRecord {
            student_id: entry.student_id.clone(),
            section_id: entry.section_id.clone(),
            module_id: entry.module_id.clone(),
            recorded_at: at,
            manual: true,
        },
    )
    .await?;

    tracing::info!(
        "✍️  Manual attendance recorded: student={}, section={}, by teacher={}",
        record.student_id,
        record.section_id,
        entry.teacher_id
    );
    Ok(record)
}

/// The section's attendance, optionally narrowed to one student.
pub async fn list(
    repo: &dyn AttendanceRepository,
    section_id: &str,
    student_id: Option<&str>,
) -> Result<Vec<AttendanceRecord>> {
    validate_id("section_id", section_id)?;
    if let Some(student_id) = student_id {
        validate_id("student_id", student_id)?;
    }
    repo.list_attendance(section_id, student_id).await
}

/// Removes every manual record of a section. Scanned records stay.
///
/// # Returns
///
/// How many records were removed.
pub async fn delete_manual(repo: &dyn AttendanceRepository, section_id: &str) -> Result<u64> {
    validate_id("section_id", section_id)?;
    let deleted = repo.delete_manual_attendance(section_id).await?;
    tracing::info!("🗑️  Deleted {} manual attendance record(s) for section {}", deleted, section_id);
    Ok(deleted)
}
