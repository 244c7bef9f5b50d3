use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ユーザーの二要素認証（TOTP）資格情報
///
/// - シークレットは AES-256-GCM で暗号化されて保存される
/// - バックアップコードは大文字化した値の SHA-256 ダイジェストのみ保存する
/// - `is_enabled = true` なら `verified_at` は必ず設定済み
#[derive(Debug, Clone, FromRow)]
pub struct MfaCredential {
    pub user_id: Uuid,
    pub secret_encrypted: Vec<u8>,
    pub backup_code_hashes: Vec<String>,
    pub is_enabled: bool,
    pub created_at: OffsetDateTime,
    pub verified_at: Option<OffsetDateTime>,
}
