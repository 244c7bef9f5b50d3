use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    /// 起動時にマイグレーションを適用するか
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    /// 許容する前後ステップ数
    #[serde(default = "default_totp_window")]
    pub totp_window: u32,

    // レート制限（verify / enable / disable / verify_backup）
    #[serde(default = "default_mfa_rate_limit_max")]
    pub mfa_rate_limit_max: u32,
    #[serde(default = "default_mfa_rate_limit_window_secs")]
    pub mfa_rate_limit_window_secs: u64,

    /// ポータルUIのオリジン（未設定ならCORSヘッダーを付与しない）
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_TOTP_WINDOW: u32 = 1;
const DEFAULT_MFA_RATE_LIMIT_MAX: u32 = 5;
const DEFAULT_MFA_RATE_LIMIT_WINDOW_SECS: u64 = 900;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_run_migrations() -> bool {
    true
}

fn default_totp_window() -> u32 {
    DEFAULT_TOTP_WINDOW
}

fn default_mfa_rate_limit_max() -> u32 {
    DEFAULT_MFA_RATE_LIMIT_MAX
}

fn default_mfa_rate_limit_window_secs() -> u64 {
    DEFAULT_MFA_RATE_LIMIT_WINDOW_SECS
}

/// 許容ウィンドウの上限
pub const MAX_TOTP_WINDOW: u32 = crate::services::totp::MAX_WINDOW;
/// レート制限ウィンドウの上限（1日）
pub const MAX_MFA_RATE_LIMIT_WINDOW_SECS: u64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("環境変数の読み込みエラー: {0}")]
    Env(#[from] envy::Error),

    #[error("設定値が不正です: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.totp_window > MAX_TOTP_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "TOTP_WINDOW は {MAX_TOTP_WINDOW} 以下で指定してください"
            )));
        }
        if self.mfa_rate_limit_max == 0 {
            return Err(ConfigError::Invalid(
                "MFA_RATE_LIMIT_MAX は1以上で指定してください".to_string(),
            ));
        }
        if !(1..=MAX_MFA_RATE_LIMIT_WINDOW_SECS).contains(&self.mfa_rate_limit_window_secs) {
            return Err(ConfigError::Invalid(format!(
                "MFA_RATE_LIMIT_WINDOW_SECS は1〜{MAX_MFA_RATE_LIMIT_WINDOW_SECS}で指定してください"
            )));
        }
        Ok(())
    }
}
