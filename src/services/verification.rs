use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::QrSettings;
use crate::error::{AppError, Result};
use crate::models::attendance::PrincipalRole;
use crate::models::events::StartCommand;
use crate::models::token::Token;
use crate::repositories::attendance::AttendanceRepository;

/// The facts a verification step looks at.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    /// Whose existence the principal step checks.
    pub role: PrincipalRole,
    pub principal_id: String,
    pub teacher_id: Option<String>,
    pub student_id: Option<String>,
    pub class_id: String,
    pub section_id: String,
    pub module_id: String,
    /// The instant being verified: mint time or scan time.
    pub at: DateTime<Utc>,
}

impl VerificationContext {
    /// Context for starting or continuing a generation session.
    pub fn for_generation(command: &StartCommand, at: DateTime<Utc>) -> Self {
        Self {
            role: PrincipalRole::Teacher,
            principal_id: command.teacher_id.clone(),
            teacher_id: Some(command.teacher_id.clone()),
            student_id: None,
            class_id: command.class_id.clone(),
            section_id: command.section_id.clone(),
            module_id: command.module_id.clone(),
            at,
        }
    }

    /// Context for a student scanning `token` at `at`.
    pub fn for_scan(student_id: &str, token: &Token, at: DateTime<Utc>) -> Self {
        Self {
            role: PrincipalRole::Student,
            principal_id: student_id.to_string(),
            teacher_id: Some(token.teacher_id.clone()),
            student_id: Some(student_id.to_string()),
            class_id: token.class_id.clone(),
            section_id: token.section_id.clone(),
            module_id: token.module_id.clone(),
            at,
        }
    }

    /// Context for a teacher registering a student by hand.
    pub fn for_manual(
        teacher_id: &str,
        student_id: &str,
        class_id: &str,
        section_id: &str,
        module_id: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            role: PrincipalRole::Teacher,
            principal_id: teacher_id.to_string(),
            teacher_id: Some(teacher_id.to_string()),
            student_id: Some(student_id.to_string()),
            class_id: class_id.to_string(),
            section_id: section_id.to_string(),
            module_id: module_id.to_string(),
            at,
        }
    }

    fn student(&self) -> Result<&str> {
        self.student_id
            .as_deref()
            .ok_or_else(|| AppError::Internal("check requires a student".to_string()))
    }

    fn teacher(&self) -> Result<&str> {
        self.teacher_id
            .as_deref()
            .ok_or_else(|| AppError::Internal("check requires a teacher".to_string()))
    }
}

fn to_delta(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| AppError::Internal(format!("duration out of range: {}", e)))
}

/// One business rule. Each check only reads, so any subset can be run
/// again at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    PrincipalActive,
    ClassActive,
    ModuleExists,
    Enrollment,
    NoDuplicateAttendance,
    /// `at` must fall in `[start - early_entry, end)`.
    SchedulingWindow { early_entry: Duration },
    /// No other class of the same teacher and module minted within `window`.
    TokenCooldown { window: Duration },
}

impl Check {
    pub fn name(&self) -> &'static str {
        match self {
            Check::PrincipalActive => "principal_active",
            Check::ClassActive => "class_active",
            Check::ModuleExists => "module_exists",
            Check::Enrollment => "enrollment",
            Check::NoDuplicateAttendance => "no_duplicate_attendance",
            Check::SchedulingWindow { .. } => "scheduling_window",
            Check::TokenCooldown { .. } => "token_cooldown",
        }
    }

    /// Runs the check against the persistence collaborator.
    ///
    /// # Returns
    ///
    /// `Ok(())` when the rule holds, the rule's error when it does not, or
    /// `Persistence` when the data could not be read.
    pub async fn verify(&self, repo: &dyn AttendanceRepository, ctx: &VerificationContext) -> Result<()> {
        match *self {
            Check::PrincipalActive => {
                if !repo.find_active_principal(ctx.role, &ctx.principal_id).await? {
                    return Err(AppError::PrincipalNotFound(format!("{} {}", ctx.role, ctx.principal_id)));
                }
            }

            Check::ClassActive => {
                if !repo.find_active_class(&ctx.class_id).await? {
                    return Err(AppError::ClassNotFound(ctx.class_id.clone()));
                }
            }

            Check::ModuleExists => {
                if !repo.find_module(&ctx.module_id).await? {
                    return Err(AppError::ModuleNotFound(ctx.module_id.clone()));
                }
            }

            Check::Enrollment => {
                let student_id = ctx.student()?;
                if !repo.is_enrolled(student_id, &ctx.section_id).await? {
                    return Err(AppError::NotEnrolled {
                        student_id: student_id.to_string(),
                        section_id: ctx.section_id.clone(),
                    });
                }
            }

            Check::NoDuplicateAttendance => {
                let student_id = ctx.student()?;
                if repo
                    .has_attendance_on(student_id, &ctx.section_id, ctx.at.date_naive())
                    .await?
                {
                    return Err(AppError::AlreadyRecorded {
                        student_id: student_id.to_string(),
                        section_id: ctx.section_id.clone(),
                    });
                }
            }

            Check::SchedulingWindow { early_entry } => {
                let early_entry = to_delta(early_entry)?;
                let windows = repo
                    .get_section_windows(&ctx.section_id, ctx.at.date_naive())
                    .await?;

                if !windows.iter().any(|window| window.admits(ctx.at, early_entry)) {
                    return Err(AppError::OutsideWindow(ctx.section_id.clone()));
                }
            }

            Check::TokenCooldown { window } => {
                let teacher_id = ctx.teacher()?;
                let since = ctx.at - to_delta(window)?;
                if repo
                    .has_recent_token_issue(teacher_id, &ctx.module_id, &ctx.class_id, since)
                    .await?
                {
                    return Err(AppError::ActiveTokenExists {
                        teacher_id: teacher_id.to_string(),
                        module_id: ctx.module_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// An ordered list of checks evaluated until the first failure.
#[derive(Debug, Clone)]
pub struct VerificationChain {
    checks: Vec<Check>,
}

impl VerificationChain {
    pub fn new(checks: Vec<Check>) -> Self {
        Self { checks }
    }

    /// Teacher active, class active, module exists, cooldown.
    pub fn generation(settings: &QrSettings) -> Self {
        Self::new(vec![
            Check::PrincipalActive,
            Check::ClassActive,
            Check::ModuleExists,
            Check::TokenCooldown {
                window: settings.cooldown,
            },
        ])
    }

    /// Student active, class active, enrolled, not yet recorded, in window.
    pub fn scan(settings: &QrSettings) -> Self {
        Self::new(vec![
            Check::PrincipalActive,
            Check::ClassActive,
            Check::Enrollment,
            Check::NoDuplicateAttendance,
            Check::SchedulingWindow {
                early_entry: settings.early_entry,
            },
        ])
    }

    /// Teacher active, class active, module exists, enrolled, not yet recorded.
    pub fn manual() -> Self {
        Self::new(vec![
            Check::PrincipalActive,
            Check::ClassActive,
            Check::ModuleExists,
            Check::Enrollment,
            Check::NoDuplicateAttendance,
        ])
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// Runs every check in order, stopping at the first failure.
    pub async fn verify(&self, repo: &dyn AttendanceRepository, ctx: &VerificationContext) -> Result<()> {
        for check in &self.checks {
            if let Err(e) = check.verify(repo, ctx).await {
                tracing::debug!(
                    check = check.name(),
                    class_id = %ctx.class_id,
                    principal_id = %ctx.principal_id,
                    "Verification failed: {}",
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }
}
