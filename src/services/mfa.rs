use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{MfaCredential, SecurityEvent, SecurityEventKind};
use crate::repositories::{CredentialStore, SecurityEventLog};
use crate::services::cipher::{SecretCipher, sha256_hex};
use crate::services::clock::Clock;
use crate::services::totp::{self, TotpEngine};

/// セットアップ結果（シークレット平文を返すのはここだけ）
#[derive(Debug, Clone)]
pub struct MfaSetup {
    pub secret: String,
    pub otpauth_uri: String,
    pub backup_codes: Vec<String>,
}

/// 二要素認証の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaStatus {
    pub enabled: bool,
    pub setup_at: Option<OffsetDateTime>,
    pub verified_at: Option<OffsetDateTime>,
}

/// バックアップコード検証結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCodeCheck {
    pub valid: bool,
    pub remaining: Option<usize>,
}

/// 二要素認証（TOTP）の登録ライフサイクル
///
/// 状態遷移:
/// - 未設定 → `setup` → 検証待ち
/// - 検証待ち → `setup` → 検証待ち（シークレット再生成）
/// - 検証待ち → `enable` → 有効
/// - 検証待ち / 有効 → `disable` → 未設定
///
/// # Security
/// - シークレット・提出コード・バックアップコードはログに出力しない
#[derive(Clone)]
pub struct MfaService {
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn SecurityEventLog>,
    cipher: SecretCipher,
    engine: TotpEngine,
    clock: Arc<dyn Clock>,
    issuer: String,
}

impl MfaService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        events: Arc<dyn SecurityEventLog>,
        cipher: SecretCipher,
        clock: Arc<dyn Clock>,
        issuer: String,
        window: u32,
    ) -> Self {
        Self {
            store,
            events,
            cipher,
            engine: TotpEngine::new(clock.clone(), window),
            clock,
            issuer,
        }
    }

    /// TOTP エンジン
    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    /// 新しいシークレットとバックアップコードを発行
    ///
    /// 既存の資格情報（有効化済みを含む）は置き換えられ、再検証が必要になる。
    pub async fn setup(&self, user_id: Uuid, account: &str) -> Result<MfaSetup, AppError> {
        let secret = totp::generate_secret()?;
        let backup_codes = totp::generate_backup_codes()?;

        let encrypted = self.cipher.encrypt(&secret)?;
        let hashes: Vec<String> = backup_codes.iter().map(|c| hash_backup_code(c)).collect();

        self.store
            .upsert(user_id, &encrypted, &hashes, self.clock.now())
            .await?;

        tracing::info!(user_id = %user_id, "2FA設定開始");

        Ok(MfaSetup {
            otpauth_uri: totp::otpauth_uri(&self.issuer, account, &secret),
            secret,
            backup_codes,
        })
    }

    /// 保存済みシークレットに対してコードを検証（状態は変更しない）
    pub async fn verify(&self, user_id: Uuid, code: &str) -> Result<bool, AppError> {
        validate_totp_code(code)?;

        let credential = self.load(user_id).await?;
        let valid = self.check_code(&credential, code)?;

        tracing::info!(user_id = %user_id, valid, "TOTPコード検証");

        Ok(valid)
    }

    /// 初回コード検証で有効化
    pub async fn enable(&self, user_id: Uuid, code: &str) -> Result<(), AppError> {
        validate_totp_code(code)?;

        let credential = self.load(user_id).await?;
        if credential.is_enabled {
            return Err(AppError::TotpAlreadyEnabled);
        }

        if !self.check_code(&credential, code)? {
            tracing::warn!(user_id = %user_id, "2FA有効化失敗: コード不一致");
            return Err(AppError::TotpInvalid);
        }

        let verified_at = self.clock.now();
        if !self
            .store
            .mark_enabled(user_id, &credential.secret_encrypted, verified_at)
            .await?
        {
            // 検証中に setup / disable が割り込んだ
            tracing::warn!(user_id = %user_id, "2FA有効化失敗: シークレットが更新された");
            return Err(AppError::TotpInvalid);
        }

        tracing::info!(user_id = %user_id, "2FA有効化完了");
        self.emit(user_id, SecurityEventKind::MfaEnabled, json!({}))
            .await;

        Ok(())
    }

    /// コード検証のうえ資格情報を削除
    pub async fn disable(&self, user_id: Uuid, code: &str) -> Result<(), AppError> {
        validate_totp_code(code)?;

        let credential = self.load(user_id).await?;

        if !self.check_code(&credential, code)? {
            tracing::warn!(user_id = %user_id, "2FA無効化失敗: コード不一致");
            return Err(AppError::TotpInvalid);
        }

        if !self
            .store
            .delete(user_id, &credential.secret_encrypted)
            .await?
        {
            tracing::warn!(user_id = %user_id, "2FA無効化失敗: シークレットが更新された");
            return Err(AppError::TotpInvalid);
        }

        tracing::info!(user_id = %user_id, "2FA無効化完了");
        self.emit(
            user_id,
            SecurityEventKind::MfaDisabled,
            json!({ "was_enabled": credential.is_enabled }),
        )
        .await;

        Ok(())
    }

    /// 現在の状態（シークレットは返さない）
    pub async fn status(&self, user_id: Uuid) -> Result<MfaStatus, AppError> {
        let status = match self.store.find(user_id).await? {
            Some(credential) => MfaStatus {
                enabled: credential.is_enabled,
                setup_at: Some(credential.created_at),
                verified_at: credential.verified_at,
            },
            None => MfaStatus {
                enabled: false,
                setup_at: None,
                verified_at: None,
            },
        };
        Ok(status)
    }

    /// バックアップコードを検証し、一致すれば消費する（大文字小文字を区別しない）
    pub async fn verify_backup(&self, user_id: Uuid, code: &str) -> Result<BackupCodeCheck, AppError> {
        validate_backup_code(code)?;

        let credential = self
            .store
            .find(user_id)
            .await?
            .ok_or(AppError::NoBackupCodes)?;
        if credential.backup_code_hashes.is_empty() {
            return Err(AppError::NoBackupCodes);
        }

        let Some(remaining) = self
            .store
            .consume_backup_code(user_id, &hash_backup_code(code))
            .await?
        else {
            tracing::warn!(user_id = %user_id, "バックアップコード不一致");
            return Ok(BackupCodeCheck {
                valid: false,
                remaining: None,
            });
        };

        tracing::info!(user_id = %user_id, remaining, "バックアップコード使用");
        self.emit(
            user_id,
            SecurityEventKind::BackupCodeUsed,
            json!({ "remaining_codes": remaining }),
        )
        .await;

        Ok(BackupCodeCheck {
            valid: true,
            remaining: Some(remaining),
        })
    }

    async fn load(&self, user_id: Uuid) -> Result<MfaCredential, AppError> {
        self.store
            .find(user_id)
            .await?
            .ok_or(AppError::MfaNotSetUp)
    }

    fn check_code(&self, credential: &MfaCredential, code: &str) -> Result<bool, AppError> {
        let secret = self.cipher.decrypt(&credential.secret_encrypted)?;
        Ok(self.engine.verify_code(&secret, code))
    }

    /// イベントログへの記録（失敗しても処理結果には影響させない）
    async fn emit(&self, user_id: Uuid, kind: SecurityEventKind, details: serde_json::Value) {
        let event = SecurityEvent {
            user_id,
            kind,
            details,
            occurred_at: self.clock.now(),
        };
        if let Err(e) = self.events.record(&event).await {
            tracing::warn!(error = ?e, user_id = %user_id, event = kind.as_str(), "セキュリティイベント記録失敗");
        }
    }
}

/// バックアップコードの保存用ダイジェスト
fn hash_backup_code(code: &str) -> String {
    sha256_hex(&code.to_ascii_uppercase())
}

/// TOTPコードバリデーション
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if !totp::is_totp_code_format(code) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// バックアップコードバリデーション
fn validate_backup_code(code: &str) -> Result<(), AppError> {
    if !totp::is_backup_code_format(code) {
        return Err(AppError::Validation(
            "バックアップコードは8文字で入力してください".to_string(),
        ));
    }
    Ok(())
}
