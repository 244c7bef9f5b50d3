use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

/// レート制限の判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    /// 判定時点からウィンドウ終了までの残り時間
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// 固定ウィンドウ内の試行回数から判定を組み立てる
    ///
    /// `now` は `window_start` と同じ時刻源から取ること。
    pub fn from_count(
        count: u32,
        max: u32,
        window_start: OffsetDateTime,
        window: Duration,
        now: OffsetDateTime,
    ) -> Self {
        let reset_at = window_start + window;
        Self {
            allowed: count <= max,
            remaining: max.saturating_sub(count),
            reset_at,
            retry_after: (reset_at - now).max(Duration::ZERO),
        }
    }
}

/// キー単位の固定ウィンドウ・レート制限
///
/// `check` は呼び出し自体を1回の試行として数える。
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, sqlx::Error>;

    /// ウィンドウが終了したカウンタを削除し、削除件数を返す
    async fn purge_expired(&self, window: Duration) -> Result<u64, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgRateLimiter {
    pool: PgPool,
}

impl PgRateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn check(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, sqlx::Error> {
        // ウィンドウ経過後はカウンタをリセットする（単一文で原子的に更新）
        let (count, window_start, now) = sqlx::query_as::<_, (i32, OffsetDateTime, OffsetDateTime)>(
            r#"
            INSERT INTO rate_limits (key, count, window_start)
            VALUES ($1, 1, NOW())
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN rate_limits.window_start + make_interval(secs => $2) <= NOW() THEN 1
                    ELSE rate_limits.count + 1
                END,
                window_start = CASE
                    WHEN rate_limits.window_start + make_interval(secs => $2) <= NOW() THEN NOW()
                    ELSE rate_limits.window_start
                END
            RETURNING count, window_start, NOW()
            "#,
        )
        .bind(key)
        .bind(window.as_seconds_f64())
        .fetch_one(&self.pool)
        .await?;

        let count = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(RateLimitDecision::from_count(
            count,
            max,
            window_start,
            window,
            now,
        ))
    }

    async fn purge_expired(&self, window: Duration) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM rate_limits
            WHERE window_start + make_interval(secs => $1) <= NOW()
            "#,
        )
        .bind(window.as_seconds_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
