use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::SecurityEvent;

/// 追記専用のセキュリティイベントログ
#[async_trait]
pub trait SecurityEventLog: Send + Sync {
    async fn record(&self, event: &SecurityEvent) -> Result<(), sqlx::Error>;
}

#[derive(Clone)]
pub struct PgSecurityEventLog {
    pool: PgPool,
}

impl PgSecurityEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecurityEventLog for PgSecurityEventLog {
    async fn record(&self, event: &SecurityEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO security_events (id, user_id, event_type, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.kind.as_str())
        .bind(&event.details)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
