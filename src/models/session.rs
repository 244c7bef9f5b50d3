use sqlx::FromRow;
use uuid::Uuid;

/// セッションから解決された呼び出し元ユーザー
#[derive(Debug, Clone, FromRow)]
pub struct SessionUser {
    pub user_id: Uuid,
    pub email: String,
}
