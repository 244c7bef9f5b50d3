use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::SessionUser;

/// ログインセッションの参照
///
/// トークンそのものではなく SHA-256 ダイジェストで検索する。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 有効期限内のセッションに紐づくユーザーを返す
    async fn find_user(&self, token_hash: &str) -> Result<Option<SessionUser>, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_user(&self, token_hash: &str) -> Result<Option<SessionUser>, sqlx::Error> {
        sqlx::query_as::<_, SessionUser>(
            r#"
            SELECT s.user_id, u.email
            FROM user_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1 AND s.expires_at > NOW()
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
    }
}
