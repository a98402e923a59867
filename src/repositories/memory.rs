use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    error::{AppError, Result},
    models::attendance::{AttendanceRecord, InsertOutcome, PrincipalRole, SectionWindow, TokenIssue},
    repositories::attendance::AttendanceRepository,
};

#[derive(Default)]
struct Tables {
    teachers: HashSet<String>,
    students: HashSet<String>,
    classes: HashSet<String>,
    modules: HashSet<String>,
    enrollments: HashSet<(String, String)>,
    windows: HashMap<String, SectionWindow>,
    attendance: Vec<AttendanceRecord>,
    token_issues: Vec<TokenIssue>,
}

/// An in-memory repository for tests and local runs.
///
/// Section windows are fixed instants rather than a daily schedule: the
/// configured window is returned for any date.
///
/// The token issue log only keeps entries younger than the retention
/// (the default cooldown unless set otherwise) relative to the newest issue.
#[derive(Clone)]
pub struct MemoryAttendanceRepository {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
    issue_retention: TimeDelta,
}

impl Default for MemoryAttendanceRepository {
    fn default() -> Self {
        Self {
            tables: Arc::default(),
            unavailable: Arc::default(),
            issue_retention: TimeDelta::seconds(30),
        }
    }
}

impl MemoryAttendanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps token issues for `retention` instead of the default 30s. Must
    /// be at least the cooldown the repository is checked against.
    pub fn with_issue_retention(mut self, retention: TimeDelta) -> Self {
        self.issue_retention = retention;
        self
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("database unavailable".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| AppError::Persistence("repository lock poisoned".to_string()))
    }

    fn seed(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_teacher(&self, id: &str) -> &Self {
        self.seed().teachers.insert(id.to_string());
        self
    }

    pub fn add_student(&self, id: &str) -> &Self {
        self.seed().students.insert(id.to_string());
        self
    }

    pub fn add_class(&self, id: &str) -> &Self {
        self.seed().classes.insert(id.to_string());
        self
    }

    pub fn remove_class(&self, id: &str) -> &Self {
        self.seed().classes.remove(id);
        self
    }

    pub fn add_module(&self, id: &str) -> &Self {
        self.seed().modules.insert(id.to_string());
        self
    }

    pub fn enroll(&self, student_id: &str, section_id: &str) -> &Self {
        self.seed()
            .enrollments
            .insert((student_id.to_string(), section_id.to_string()));
        self
    }

    pub fn set_section_window(&self, section_id: &str, window: SectionWindow) -> &Self {
        self.seed().windows.insert(section_id.to_string(), window);
        self
    }

    /// Makes every call fail with `Persistence`, as during an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// A snapshot of the stored attendance records.
    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        self.seed().attendance.clone()
    }

    /// A snapshot of the token issue log.
    pub fn token_issues(&self) -> Vec<TokenIssue> {
        self.seed().token_issues.clone()
    }
}

#[async_trait]
impl AttendanceRepository for MemoryAttendanceRepository {
    async fn find_active_principal(&self, role: PrincipalRole, id: &str) -> Result<bool> {
        let tables = self.tables()?;
        Ok(match role {
            PrincipalRole::Teacher => tables.teachers.contains(id),
            PrincipalRole::Student => tables.students.contains(id),
        })
    }

    async fn find_active_class(&self, class_id: &str) -> Result<bool> {
        Ok(self.tables()?.classes.contains(class_id))
    }

    async fn find_module(&self, module_id: &str) -> Result<bool> {
        Ok(self.tables()?.modules.contains(module_id))
    }

    async fn is_enrolled(&self, student_id: &str, section_id: &str) -> Result<bool> {
        Ok(self
            .tables()?
            .enrollments
            .contains(&(student_id.to_string(), section_id.to_string())))
    }

    async fn has_attendance_on(&self, student_id: &str, section_id: &str, date: NaiveDate) -> Result<bool> {
        Ok(self.tables()?.attendance.iter().any(|r| {
            r.student_id == student_id && r.section_id == section_id && r.recorded_at.date_naive() == date
        }))
    }

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome> {
        let mut tables = self.tables()?;
        let date = record.recorded_at.date_naive();
        let duplicate = tables.attendance.iter().any(|r| {
            r.student_id == record.student_id
                && r.section_id == record.section_id
                && r.recorded_at.date_naive() == date
        });

        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }

        tables.attendance.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list_attendance(&self, section_id: &str, student_id: Option<&str>) -> Result<Vec<AttendanceRecord>> {
        let mut records: Vec<AttendanceRecord> = self
            .tables()?
            .attendance
            .iter()
            .filter(|r| r.section_id == section_id && student_id.is_none_or(|id| r.student_id == id))
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.recorded_at, &a.student_id).cmp(&(b.recorded_at, &b.student_id)));
        Ok(records)
    }

    async fn delete_manual_attendance(&self, section_id: &str) -> Result<u64> {
        let mut tables = self.tables()?;
        let before = tables.attendance.len();
        tables.attendance.retain(|r| !(r.section_id == section_id && r.manual));
        Ok((before - tables.attendance.len()) as u64)
    }

    async fn get_section_windows(&self, section_id: &str, _date: NaiveDate) -> Result<Vec<SectionWindow>> {
        Ok(self.tables()?.windows.get(section_id).copied().into_iter().collect())
    }

    async fn record_token_issue(&self, issue: &TokenIssue) -> Result<()> {
        let mut tables = self.tables()?;
        let horizon = issue.issued_at - self.issue_retention;
        tables.token_issues.retain(|logged| logged.issued_at > horizon);
        tables.token_issues.push(issue.clone());
        Ok(())
    }

    async fn has_recent_token_issue(
        &self,
        teacher_id: &str,
        module_id: &str,
        other_than_class: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.tables()?.token_issues.iter().any(|issue| {
            issue.teacher_id == teacher_id
                && issue.module_id == module_id
                && issue.class_id != other_than_class
                && issue.issued_at > since
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issue(class_id: &str, issued_at: DateTime<Utc>) -> TokenIssue {
        TokenIssue {
            teacher_id: "T1".into(),
            module_id: "M1".into(),
            class_id: class_id.into(),
            issued_at,
        }
    }

    #[tokio::test]
    async fn token_issue_log_is_pruned_past_retention() {
        let repo = MemoryAttendanceRepository::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();

        for minute in 0..10 {
            repo.record_token_issue(&issue("C1", t0 + TimeDelta::minutes(minute)))
                .await
                .unwrap();
        }

        assert_eq!(repo.token_issues().len(), 1);
        assert!(repo
            .has_recent_token_issue("T1", "M1", "C2", t0 + TimeDelta::minutes(9) - TimeDelta::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn issues_inside_retention_are_kept() {
        let repo = MemoryAttendanceRepository::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();

        repo.record_token_issue(&issue("C1", t0)).await.unwrap();
        repo.record_token_issue(&issue("C2", t0 + TimeDelta::seconds(20)))
            .await
            .unwrap();

        assert_eq!(repo.token_issues().len(), 2);
    }

    #[tokio::test]
    async fn deleting_manual_records_keeps_scans() {
        let repo = MemoryAttendanceRepository::new();
        let now = Utc::now();
        for (student_id, manual) in [("St1", false), ("St2", true), ("St3", true)] {
            repo.insert_attendance(&AttendanceRecord {
                student_id: student_id.into(),
                section_id: "S1".into(),
                module_id: "M1".into(),
                recorded_at: now,
                manual,
            })
            .await
            .unwrap();
        }

        assert_eq!(repo.delete_manual_attendance("S1").await.unwrap(), 2);
        let left = repo.list_attendance("S1", None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].student_id, "St1");
        assert!(repo.list_attendance("S1", Some("St2")).await.unwrap().is_empty());
    }
}
