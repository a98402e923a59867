use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An attendance entry for one student in one section.
///
/// QR scans and manual registrations share this schema; `manual` tells them
/// apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub section_id: String,
    pub module_id: String,
    /// The timestamp the attendance counts for.
    pub recorded_at: DateTime<Utc>,
    /// Whether a teacher registered the attendance by hand.
    pub manual: bool,
}

/// The result of a conditional attendance insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored.
    Inserted,
    /// A record for the same student, section and day already existed.
    Duplicate,
}

/// The time span during which a section accepts attendance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SectionWindow {
    /// Whether `at` falls in `[start - early_entry, end)`.
    pub fn admits(&self, at: DateTime<Utc>, early_entry: chrono::Duration) -> bool {
        at >= self.start - early_entry && at < self.end
    }
}

/// The kind of principal a verification step looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalRole {
    Teacher,
    Student,
}

impl std::fmt::Display for PrincipalRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalRole::Teacher => f.write_str("teacher"),
            PrincipalRole::Student => f.write_str("student"),
        }
    }
}

/// One entry of the token issue log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIssue {
    pub teacher_id: String,
    pub module_id: String,
    pub class_id: String,
    pub issued_at: DateTime<Utc>,
}
