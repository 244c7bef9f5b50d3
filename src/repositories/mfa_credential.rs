use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::MfaCredential;

/// MFA資格情報の永続化
///
/// `mark_enabled` と `delete` は呼び出し元が検証に用いた暗号化シークレットを
/// スナップショットとして受け取り、一致する場合のみ更新する（compare-and-set）。
/// 並行する setup でシークレットが差し替わっていれば false を返す。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// ユーザーIDで資格情報を検索
    async fn find(&self, user_id: Uuid) -> Result<Option<MfaCredential>, sqlx::Error>;

    /// 資格情報を作成、または既存を置き換える（is_enabled = false, verified_at = NULL）
    async fn upsert(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
        created_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// 未有効の資格情報を有効化
    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_snapshot: &[u8],
        verified_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error>;

    /// 資格情報を削除
    async fn delete(&self, user_id: Uuid, secret_snapshot: &[u8]) -> Result<bool, sqlx::Error>;

    /// バックアップコードを1件消費し、残数を返す
    ///
    /// 該当コードが存在しない（既に消費済みを含む）場合は None
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find(&self, user_id: Uuid) -> Result<Option<MfaCredential>, sqlx::Error> {
        sqlx::query_as::<_, MfaCredential>(
            r#"
            SELECT user_id, secret_encrypted, backup_code_hashes, is_enabled, created_at, verified_at
            FROM mfa_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
        created_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO mfa_credentials
                (user_id, secret_encrypted, backup_code_hashes, is_enabled, created_at, verified_at)
            VALUES ($1, $2, $3, false, $4, NULL)
            ON CONFLICT (user_id) DO UPDATE SET
                secret_encrypted = EXCLUDED.secret_encrypted,
                backup_code_hashes = EXCLUDED.backup_code_hashes,
                is_enabled = false,
                created_at = EXCLUDED.created_at,
                verified_at = NULL
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .bind(backup_code_hashes)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_snapshot: &[u8],
        verified_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE mfa_credentials
            SET is_enabled = true, verified_at = $3
            WHERE user_id = $1 AND secret_encrypted = $2 AND is_enabled = false
            "#,
        )
        .bind(user_id)
        .bind(secret_snapshot)
        .bind(verified_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, user_id: Uuid, secret_snapshot: &[u8]) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM mfa_credentials
            WHERE user_id = $1 AND secret_encrypted = $2
            "#,
        )
        .bind(user_id)
        .bind(secret_snapshot)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error> {
        // 行ロックにより同一コードの同時消費は先着1件のみ成功する
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE mfa_credentials
            SET backup_code_hashes = array_remove(backup_code_hashes, $2)
            WHERE user_id = $1 AND $2 = ANY(backup_code_hashes)
            RETURNING cardinality(backup_code_hashes)
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remaining.map(|n| usize::try_from(n).unwrap_or(0)))
    }
}
