use std::sync::Arc;

use data_encoding::{BASE32_NOPAD, HEXUPPER};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;

use crate::error::AppError;
use crate::services::clock::Clock;

/// シークレット長（160ビット）
pub const SECRET_LEN: usize = 20;
/// 時間ステップ（秒）
pub const TIME_STEP_SECS: u64 = 30;
/// TOTPコードの桁数
pub const CODE_DIGITS: usize = 6;
/// 1回のセットアップで発行するバックアップコード数
pub const BACKUP_CODE_COUNT: usize = 10;
/// バックアップコードの文字数
pub const BACKUP_CODE_LEN: usize = 8;
/// 既定の許容ウィンドウ（前後1ステップ）
pub const DEFAULT_WINDOW: u32 = 1;
/// 許容ウィンドウの上限（前後10ステップ = ±5分）
pub const MAX_WINDOW: u32 = 10;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const CODE_MODULUS: u32 = 1_000_000;

/// 20バイトの暗号論的乱数シークレットを生成し、Base32（パディングなし）でエンコード
///
/// # Errors
/// OS の乱数源が利用できない場合は `AppError::Internal`
pub fn generate_secret() -> Result<String, AppError> {
    let mut bytes = [0u8; SECRET_LEN];
    fill_random(&mut bytes)?;
    Ok(BASE32_NOPAD.encode(&bytes))
}

/// バックアップコードを10個生成
///
/// 各コードは4バイトの乱数を大文字16進で表した8文字。
/// 同一バッチ内で重複しないことを保証する。
pub fn generate_backup_codes() -> Result<Vec<String>, AppError> {
    let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
    while codes.len() < BACKUP_CODE_COUNT {
        let mut bytes = [0u8; 4];
        fill_random(&mut bytes)?;
        let mut code = HEXUPPER.encode(&bytes);
        code.truncate(BACKUP_CODE_LEN);
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

fn fill_random(buf: &mut [u8]) -> Result<(), AppError> {
    OsRng.try_fill_bytes(buf).map_err(|e| {
        tracing::error!(error = %e, "乱数生成エラー");
        AppError::Internal(anyhow::anyhow!("entropy source unavailable"))
    })
}

/// Base32 シークレットをデコード
///
/// 小文字は大文字として扱い、アルファベット外の文字（空白、`=`、`-` など）は無視する。
/// 末尾の余りビットは捨てる。
pub fn decode_secret(secret: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(secret.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in secret.bytes().map(|b| b.to_ascii_uppercase()) {
        let Some(value) = BASE32_ALPHABET.iter().position(|&a| a == c) else {
            continue;
        };
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    out
}

/// 指定時刻・ステップオフセットにおける6桁コードを算出（RFC 4226 / RFC 6238, HMAC-SHA1）
pub fn compute_code_at(
    secret: &str,
    unix_time: u64,
    time_step_secs: u64,
    step_offset: i64,
) -> String {
    let key = decode_secret(secret);
    let counter = (unix_time / time_step_secs.max(1)).saturating_add_signed(step_offset);

    let mut mac =
        Hmac::<Sha1>::new_from_slice(&key).expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation
    let offset = (digest[19] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    format!("{:0width$}", binary % CODE_MODULUS, width = CODE_DIGITS)
}

/// 指定時刻で提出コードを検証
///
/// `-window..=window` の各ステップで期待値を算出し、最初に一致した時点で true。
/// `window` は `MAX_WINDOW` で頭打ちにする。
/// 6桁の ASCII 数字でない入力は暗号処理をせずに false を返す。
pub fn verify_code_at(secret: &str, submitted: &str, unix_time: u64, window: u32) -> bool {
    if !is_totp_code_format(submitted) {
        return false;
    }

    let window = i64::from(window.min(MAX_WINDOW));
    (-window..=window)
        .any(|offset| compute_code_at(secret, unix_time, TIME_STEP_SECS, offset) == submitted)
}

/// 6桁の ASCII 数字か
pub fn is_totp_code_format(code: &str) -> bool {
    code.len() == CODE_DIGITS && code.bytes().all(|b| b.is_ascii_digit())
}

/// バックアップコードとして妥当な長さ（8文字）か
pub fn is_backup_code_format(code: &str) -> bool {
    code.chars().count() == BACKUP_CODE_LEN
}

/// 認証アプリ登録用の otpauth URI を構築
pub fn otpauth_uri(issuer: &str, account: &str, secret: &str) -> String {
    let issuer = urlencoding::encode(issuer);
    let account = urlencoding::encode(account);
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={CODE_DIGITS}&period={TIME_STEP_SECS}"
    )
}

/// 現在時刻に基づく TOTP 算出・検証
///
/// 時刻源は `Clock` から注入される。状態は持たない。
#[derive(Clone)]
pub struct TotpEngine {
    clock: Arc<dyn Clock>,
    window: u32,
}

impl TotpEngine {
    pub fn new(clock: Arc<dyn Clock>, window: u32) -> Self {
        Self { clock, window }
    }

    /// 現在のUNIX時刻（秒）
    fn unix_now(&self) -> u64 {
        u64::try_from(self.clock.now().unix_timestamp()).unwrap_or(0)
    }

    /// 現在時刻から `step_offset` ステップずらしたコード
    pub fn compute_code(&self, secret: &str, step_offset: i64) -> String {
        compute_code_at(secret, self.unix_now(), TIME_STEP_SECS, step_offset)
    }

    /// 設定された許容ウィンドウでコードを検証
    pub fn verify_code(&self, secret: &str, submitted: &str) -> bool {
        verify_code_at(secret, submitted, self.unix_now(), self.window)
    }

    /// 任意の許容ウィンドウでコードを検証
    pub fn verify_code_with_window(&self, secret: &str, submitted: &str, window: u32) -> bool {
        verify_code_at(secret, submitted, self.unix_now(), window)
    }
}
