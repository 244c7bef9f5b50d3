use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use time::Duration;

use crate::config::{Config, MAX_MFA_RATE_LIMIT_WINDOW_SECS};
use crate::error::AppError;
use crate::repositories::{
    PgCredentialStore, PgRateLimiter, PgSecurityEventLog, PgSessionStore, RateLimiter,
    SessionStore,
};
use crate::services::{Clock, MfaService, SecretCipher, SystemClock};

/// MFA系アクションのレート制限ポリシー
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    /// 設定値からポリシーを作成（範囲外のウィンドウは拒否）
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let secs = i64::try_from(config.mfa_rate_limit_window_secs)
            .ok()
            .filter(|secs| (1..=MAX_MFA_RATE_LIMIT_WINDOW_SECS as i64).contains(secs))
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "rate limit window out of range: {}",
                    config.mfa_rate_limit_window_secs
                ))
            })?;

        Ok(Self {
            max_attempts: config.mfa_rate_limit_max,
            window: Duration::seconds(secs),
        })
    }
}

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// 二要素認証サービス
    pub mfa_service: MfaService,
    /// セッション参照（呼び出し元の特定）
    pub sessions: Arc<dyn SessionStore>,
    /// レート制限
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub rate_limit: RateLimitPolicy,
}

impl AppState {
    /// PostgreSQL をバックエンドとする AppState を作成
    pub fn new(db_pool: PgPool, config: &Config) -> Result<Self, AppError> {
        config.validate().map_err(|e| AppError::Internal(e.into()))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cipher = SecretCipher::from_base64(config.encryption_key.expose_secret())?;

        let mfa_service = MfaService::new(
            Arc::new(PgCredentialStore::new(db_pool.clone())),
            Arc::new(PgSecurityEventLog::new(db_pool.clone())),
            cipher,
            clock,
            config.totp_issuer.clone(),
            config.totp_window,
        );

        let rate_limit = RateLimitPolicy::from_config(config)?;

        Ok(Self::from_parts(
            mfa_service,
            Arc::new(PgSessionStore::new(db_pool.clone())),
            Arc::new(PgRateLimiter::new(db_pool)),
            rate_limit,
        ))
    }

    /// 任意の実装から AppState を組み立てる
    pub fn from_parts(
        mfa_service: MfaService,
        sessions: Arc<dyn SessionStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        rate_limit: RateLimitPolicy,
    ) -> Self {
        Self {
            mfa_service,
            sessions,
            rate_limiter,
            rate_limit,
        }
    }
}
