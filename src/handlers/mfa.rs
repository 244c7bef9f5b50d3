use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::handlers::auth::AuthenticatedUser;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaAction {
    Setup,
    Verify,
    Enable,
    Disable,
    Status,
    VerifyBackup,
}

impl MfaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Verify => "verify",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Status => "status",
            Self::VerifyBackup => "verify_backup",
        }
    }

    /// コードを総当たりされ得るアクションか
    fn is_rate_limited(&self) -> bool {
        !matches!(self, Self::Setup | Self::Status)
    }
}

#[derive(Debug, Deserialize)]
pub struct MfaRequest {
    pub action: MfaAction,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub secret: String,
    pub otpauth_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub mfa_enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub setup_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct ChangeResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_codes: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MfaResponse {
    Setup(SetupResponse),
    Status(StatusResponse),
    Verify(VerifyResponse),
    Change(ChangeResponse),
    Backup(BackupResponse),
}

/// POST /api/mfa
///
/// `action` で操作を切り替える二要素認証エンドポイント
///
/// # Security
/// - 対象ユーザーはセッションから決定（ボディの値は使わない）
/// - シークレット平文を返すのは setup のみ
/// - コード検証系アクションはユーザー×アクション単位でレート制限
pub async fn mfa(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<MfaRequest>, JsonRejection>,
) -> Result<Json<MfaResponse>, AppError> {
    let Json(request) = payload?;
    let action = request.action;

    if action.is_rate_limited() {
        enforce_rate_limit(&state, &user, action).await?;
    }

    let service = &state.mfa_service;
    let response = match action {
        MfaAction::Setup => {
            let setup = service.setup(user.user_id, &user.email).await?;
            MfaResponse::Setup(SetupResponse {
                secret: setup.secret,
                otpauth_uri: setup.otpauth_uri,
                backup_codes: setup.backup_codes,
            })
        }
        MfaAction::Status => {
            let status = service.status(user.user_id).await?;
            MfaResponse::Status(StatusResponse {
                mfa_enabled: status.enabled,
                setup_at: status.setup_at,
                verified_at: status.verified_at,
            })
        }
        MfaAction::Verify => {
            let valid = service.verify(user.user_id, required_code(&request)?).await?;
            MfaResponse::Verify(VerifyResponse { valid })
        }
        MfaAction::Enable => {
            service.enable(user.user_id, required_code(&request)?).await?;
            MfaResponse::Change(ChangeResponse {
                success: true,
                message: "二要素認証を有効化しました".to_string(),
            })
        }
        MfaAction::Disable => {
            service.disable(user.user_id, required_code(&request)?).await?;
            MfaResponse::Change(ChangeResponse {
                success: true,
                message: "二要素認証を無効化しました".to_string(),
            })
        }
        MfaAction::VerifyBackup => {
            let check = service
                .verify_backup(user.user_id, required_code(&request)?)
                .await?;
            MfaResponse::Backup(BackupResponse {
                valid: check.valid,
                remaining_codes: check.remaining,
            })
        }
    };

    Ok(Json(response))
}

/// 呼び出し元ユーザー×アクションのレート制限を適用
async fn enforce_rate_limit(
    state: &AppState,
    user: &AuthenticatedUser,
    action: MfaAction,
) -> Result<(), AppError> {
    let key = format!("mfa:{}:{}", user.user_id, action.as_str());
    let decision = state
        .rate_limiter
        .check(
            &key,
            state.rate_limit.max_attempts,
            state.rate_limit.window,
        )
        .await?;

    if !decision.allowed {
        // 残り時間はリミッター側の時刻源で算出済み
        let retry_after_secs = decision.retry_after.whole_seconds();
        tracing::warn!(
            user_id = %user.user_id,
            action = action.as_str(),
            "レート制限超過"
        );
        return Err(AppError::RateLimited { retry_after_secs });
    }

    Ok(())
}

/// code フィールド必須チェック
fn required_code(request: &MfaRequest) -> Result<&str, AppError> {
    match request.code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(AppError::Validation("code は必須です".to_string())),
    }
}
