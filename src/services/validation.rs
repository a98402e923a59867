use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::QrSettings;
use crate::crypto::token::TokenCodec;
use crate::error::{AppError, Result};
use crate::events::bus::{run_subscriber, EventBus};
use crate::models::attendance::AttendanceRecord;
use crate::models::events::{ScanValidation, Topic};
use crate::repositories::attendance::AttendanceRepository;
use crate::services::attendance;
use crate::services::verification::{VerificationChain, VerificationContext};
use crate::storage::token_store::TokenStore;

/// Consumes `scan-validation` messages and turns accepted scans into
/// attendance records.
#[derive(Clone)]
pub struct ValidationListener {
    codec: Arc<TokenCodec>,
    store: Arc<dyn TokenStore>,
    repo: Arc<dyn AttendanceRepository>,
    settings: QrSettings,
    chain: VerificationChain,
}

impl ValidationListener {
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<dyn TokenStore>,
        repo: Arc<dyn AttendanceRepository>,
        settings: QrSettings,
    ) -> Self {
        let chain = VerificationChain::scan(&settings);
        Self {
            codec,
            store,
            repo,
            settings,
            chain,
        }
    }

    /// Subscribes to `scan-validation` until `shutdown` fires. Each message
    /// is validated on its own task.
    pub async fn run(&self, bus: Arc<dyn EventBus>, shutdown: CancellationToken) {
        let backoff = self.settings.reconnect_backoff;
        run_subscriber(bus, Topic::ScanValidation, backoff, shutdown, |payload| {
            let listener = self.clone();
            async move {
                tokio::spawn(async move {
                    let _ = listener.handle_message(&payload).await;
                });
            }
        })
        .await;
    }

    /// Decodes and validates one message, logging the outcome.
    pub async fn handle_message(&self, payload: &str) -> Result<AttendanceRecord> {
        let request = match ScanValidation::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("⚠️  Discarding scan message: {}", e);
                return Err(e);
            }
        };

        let span = tracing::info_span!(
            "scan",
            token_id = %request.token_id,
            class_id = %request.class_id,
            student_id = %request.student_id
        );

        let outcome = self.validate(&request).instrument(span.clone()).await;
        let _entered = span.enter();
        match &outcome {
            Ok(record) => tracing::info!("✅ Attendance recorded for section {}", record.section_id),
            Err(e) if e.is_rule_violation() => tracing::info!("🚫 Scan rejected: {}", e),
            Err(e) => tracing::error!("❌ Scan validation failed: {}", e),
        }
        outcome
    }

    /// Runs every scan check and records attendance if all pass.
    ///
    /// The token must still be live in the store, decrypt under the current
    /// key, match the message's id and class, and have been issued no later
    /// than the scan and less than the TTL before it. The persistence checks then run in order.
    pub async fn validate(&self, request: &ScanValidation) -> Result<AttendanceRecord> {
        let scanned_at = request.scanned_at()?;

        if !self.store.exists(&request.class_id, &request.token_id).await? {
            return Err(AppError::TokenExpiredOrUnknown);
        }

        let ciphertext = match self.store.get(&request.class_id, &request.token_id).await {
            Ok(ciphertext) => ciphertext,
            // expired between EXISTS and GET
            Err(AppError::NotFound) => return Err(AppError::TokenExpiredOrUnknown),
            Err(e) => return Err(e),
        };
        let token = self.codec.decrypt(&ciphertext)?;

        let same_id: bool = token.id.as_bytes().ct_eq(request.token_id.as_bytes()).into();
        if !same_id || token.class_id != request.class_id {
            return Err(AppError::TokenExpiredOrUnknown);
        }

        let ttl = chrono::Duration::from_std(self.settings.token_ttl)
            .map_err(|e| AppError::Internal(format!("token TTL out of range: {}", e)))?;
        if scanned_at >= token.issued_at + ttl {
            return Err(AppError::TokenExpiredOrUnknown);
        }
        // scan times carry whole seconds only
        if scanned_at.timestamp() < token.issued_at.timestamp() {
            return Err(AppError::TokenExpiredOrUnknown);
        }

        let ctx = VerificationContext::for_scan(&request.student_id, &token, scanned_at);
        self.chain.verify(self.repo.as_ref(), &ctx).await?;

        attendance::commit(
            self.repo.as_ref(),
            AttendanceRecord {
                student_id: request.student_id.clone(),
                section_id: token.section_id.clone(),
                module_id: token.module_id.clone(),
                recorded_at: scanned_at,
                manual: false,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes;
    use crate::models::attendance::SectionWindow;
    use crate::models::events::StartCommand;
    use crate::models::token::Token;
    use crate::repositories::memory::MemoryAttendanceRepository;
    use crate::storage::memory::MemoryTokenStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    struct Fixture {
        listener: ValidationListener,
        codec: Arc<TokenCodec>,
        store: MemoryTokenStore,
        repo: MemoryAttendanceRepository,
    }

    fn fixture() -> Fixture {
        let codec = Arc::new(TokenCodec::new(aes::generate_key()));
        let store = MemoryTokenStore::new();
        let repo = MemoryAttendanceRepository::new();
        let now = Utc::now();
        repo.add_teacher("T1")
            .add_student("St1")
            .add_class("C1")
            .add_module("M1")
            .enroll("St1", "S1")
            .set_section_window(
                "S1",
                SectionWindow {
                    start: now - ChronoDuration::minutes(10),
                    end: now + ChronoDuration::hours(1),
                },
            );

        let listener = ValidationListener::new(
            codec.clone(),
            Arc::new(store.clone()),
            Arc::new(repo.clone()),
            QrSettings::default(),
        );
        Fixture {
            listener,
            codec,
            store,
            repo,
        }
    }

    async fn issue(f: &Fixture) -> Token {
        let token = Token::mint(&StartCommand {
            class_id: "C1".into(),
            teacher_id: "T1".into(),
            section_id: "S1".into(),
            module_id: "M1".into(),
        });
        let ciphertext = f.codec.encrypt(&token).unwrap();
        f.store
            .put("C1", &token.id, &ciphertext, Duration::from_secs(60))
            .await
            .unwrap();
        token
    }

    fn message(token: &Token, student_id: &str) -> String {
        ScanValidation::new(&token.id, &token.class_id, student_id, Utc::now())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn valid_scan_records_attendance() {
        let f = fixture();
        let token = issue(&f).await;

        let record = f.listener.handle_message(&message(&token, "St1")).await.unwrap();
        assert_eq!(record.section_id, "S1");
        assert!(!record.manual);
        assert_eq!(f.repo.attendance().len(), 1);
    }

    #[tokio::test]
    async fn second_scan_same_day_is_rejected() {
        let f = fixture();
        let token = issue(&f).await;
        f.listener.handle_message(&message(&token, "St1")).await.unwrap();

        let again = issue(&f).await;
        let err = f.listener.handle_message(&message(&again, "St1")).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRecorded { .. }));
        assert_eq!(f.repo.attendance().len(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let f = fixture();
        let token = Token::mint(&StartCommand {
            class_id: "C1".into(),
            teacher_id: "T1".into(),
            section_id: "S1".into(),
            module_id: "M1".into(),
        });

        let err = f.listener.handle_message(&message(&token, "St1")).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpiredOrUnknown));
        assert!(f.repo.attendance().is_empty());
    }

    #[tokio::test]
    async fn token_from_other_class_key_is_rejected() {
        let f = fixture();
        let token = issue(&f).await;
        let forged = ScanValidation::new(&token.id, "C2", "St1", Utc::now()).encode().unwrap();

        let err = f.listener.handle_message(&forged).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpiredOrUnknown));
    }

    #[tokio::test]
    async fn scan_after_ttl_is_rejected() {
        let f = fixture();
        let token = issue(&f).await;
        let late = ScanValidation::new(&token.id, "C1", "St1", token.issued_at + ChronoDuration::seconds(61))
            .encode()
            .unwrap();

        let err = f.listener.handle_message(&late).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpiredOrUnknown));
    }

    #[tokio::test]
    async fn scan_before_issue_is_rejected() {
        let f = fixture();
        let token = issue(&f).await;
        let early = ScanValidation::new(&token.id, "C1", "St1", token.issued_at - ChronoDuration::seconds(60))
            .encode()
            .unwrap();

        let err = f.listener.handle_message(&early).await.unwrap_err();
        assert!(matches!(err, AppError::TokenExpiredOrUnknown));
        assert!(f.repo.attendance().is_empty());
    }

    #[tokio::test]
    async fn tampered_store_entry_fails_closed() {
        let f = fixture();
        let token = issue(&f).await;
        f.store
            .put("C1", &token.id, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", Duration::from_secs(60))
            .await
            .unwrap();

        let err = f.listener.handle_message(&message(&token, "St1")).await.unwrap_err();
        assert!(matches!(err, AppError::Decryption | AppError::MalformedInput(_)));
        assert!(f.repo.attendance().is_empty());
    }

    #[tokio::test]
    async fn unenrolled_student_is_rejected() {
        let f = fixture();
        f.repo.add_student("St2");
        let token = issue(&f).await;

        let err = f.listener.handle_message(&message(&token, "St2")).await.unwrap_err();
        assert!(matches!(err, AppError::NotEnrolled { .. }));
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let f = fixture();
        let err = f.listener.handle_message("{not json").await.unwrap_err();
        assert!(matches!(err, AppError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn concurrent_scans_record_once() {
        let f = fixture();
        let token = issue(&f).await;
        let payload = message(&token, "St1");

        let (a, b) = tokio::join!(
            f.listener.handle_message(&payload),
            f.listener.handle_message(&payload)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(f.repo.attendance().len(), 1);
    }
}
