use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// セキュリティイベント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
    MfaEnabled,
    MfaDisabled,
    BackupCodeUsed,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MfaEnabled => "mfa_enabled",
            Self::MfaDisabled => "mfa_disabled",
            Self::BackupCodeUsed => "mfa_backup_code_used",
        }
    }
}

/// 監査ログに追記されるイベント
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub user_id: Uuid,
    pub kind: SecurityEventKind,
    pub details: Value,
    pub occurred_at: OffsetDateTime,
}
