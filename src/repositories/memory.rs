//! プロセス内メモリ実装（テスト・ローカル検証用）
//!
//! すべて単一の `tokio::sync::Mutex` で直列化されるため、
//! ユーザー単位の更新は Postgres 実装と同じく原子的に振る舞う。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{MfaCredential, SecurityEvent, SessionUser};
use crate::repositories::{
    CredentialStore, RateLimitDecision, RateLimiter, SecurityEventLog, SessionStore,
};
use crate::services::clock::Clock;

#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<Uuid, MfaCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(&self, user_id: Uuid) -> Result<Option<MfaCredential>, sqlx::Error> {
        Ok(self.records.lock().await.get(&user_id).cloned())
    }

    async fn upsert(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
        created_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.records.lock().await.insert(
            user_id,
            MfaCredential {
                user_id,
                secret_encrypted: secret_encrypted.to_vec(),
                backup_code_hashes: backup_code_hashes.to_vec(),
                is_enabled: false,
                created_at,
                verified_at: None,
            },
        );
        Ok(())
    }

    async fn mark_enabled(
        &self,
        user_id: Uuid,
        secret_snapshot: &[u8],
        verified_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let mut records = self.records.lock().await;
        match records.get_mut(&user_id) {
            Some(record) if record.secret_encrypted == secret_snapshot && !record.is_enabled => {
                record.is_enabled = true;
                record.verified_at = Some(verified_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, user_id: Uuid, secret_snapshot: &[u8]) -> Result<bool, sqlx::Error> {
        let mut records = self.records.lock().await;
        let matches = records
            .get(&user_id)
            .is_some_and(|record| record.secret_encrypted == secret_snapshot);
        if matches {
            records.remove(&user_id);
        }
        Ok(matches)
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&user_id) else {
            return Ok(None);
        };
        let Some(index) = record.backup_code_hashes.iter().position(|h| h == code_hash) else {
            return Ok(None);
        };
        record.backup_code_hashes.remove(index);
        Ok(Some(record.backup_code_hashes.len()))
    }
}

#[derive(Default)]
pub struct MemorySecurityEventLog {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySecurityEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録済みイベントのスナップショット
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl SecurityEventLog for MemorySecurityEventLog {
    async fn record(&self, event: &SecurityEvent) -> Result<(), sqlx::Error> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct MemorySession {
    user: SessionUser,
    expires_at: OffsetDateTime,
}

pub struct MemorySessionStore {
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, MemorySession>>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// トークンダイジェストでセッションを登録
    pub async fn insert(&self, token_hash: String, user: SessionUser, expires_at: OffsetDateTime) {
        self.sessions
            .lock()
            .await
            .insert(token_hash, MemorySession { user, expires_at });
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_user(&self, token_hash: &str) -> Result<Option<SessionUser>, sqlx::Error> {
        let now = self.clock.now();
        Ok(self
            .sessions
            .lock()
            .await
            .get(token_hash)
            .filter(|session| session.expires_at > now)
            .map(|session| session.user.clone()))
    }
}

pub struct MemoryRateLimiter {
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, (u32, OffsetDateTime)>>,
}

impl MemoryRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// 保持中のカウンタ数
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, sqlx::Error> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, (_, start)| *start + window > now);
        let bucket = buckets.entry(key.to_string()).or_insert((0, now));
        bucket.0 = bucket.0.saturating_add(1);
        Ok(RateLimitDecision::from_count(
            bucket.0, max, bucket.1, window, now,
        ))
    }

    async fn purge_expired(&self, window: Duration) -> Result<u64, sqlx::Error> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, (_, start)| *start + window > now);
        Ok((before - buckets.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    #[tokio::test]
    async fn test_rate_limiter_resets_after_window() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let limiter = MemoryRateLimiter::new(clock.clone());
        let window = Duration::seconds(60);

        for expected_remaining in [1, 0] {
            let decision = limiter.check("k", 2, window).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        assert!(!limiter.check("k", 2, window).await.unwrap().allowed);
        // 別キーは独立
        assert!(limiter.check("other", 2, window).await.unwrap().allowed);

        clock.advance(Duration::seconds(60));
        let decision = limiter.check("k", 2, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reset_at.unix_timestamp(), 1_120);
        assert_eq!(decision.retry_after, Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_rate_limiter_retry_after_uses_injected_clock() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let limiter = MemoryRateLimiter::new(clock.clone());
        let window = Duration::minutes(15);

        limiter.check("k", 1, window).await.unwrap();
        clock.advance(Duration::seconds(100));
        let decision = limiter.check("k", 1, window).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::seconds(800));
    }

    #[tokio::test]
    async fn test_rate_limiter_drops_expired_buckets() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let limiter = MemoryRateLimiter::new(clock.clone());
        let window = Duration::seconds(60);

        for key in ["a", "b", "c"] {
            limiter.check(key, 5, window).await.unwrap();
        }
        assert_eq!(limiter.len().await, 3);

        clock.advance(Duration::seconds(30));
        limiter.check("d", 5, window).await.unwrap();
        assert_eq!(limiter.purge_expired(window).await.unwrap(), 0);

        clock.advance(Duration::seconds(30));
        assert_eq!(limiter.purge_expired(window).await.unwrap(), 3);
        assert_eq!(limiter.len().await, 1);

        // check 自体も期限切れのカウンタを掃除する
        clock.advance(Duration::seconds(60));
        limiter.check("e", 5, window).await.unwrap();
        assert_eq!(limiter.len().await, 1);
    }

    #[tokio::test]
    async fn test_session_store_rejects_expired() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let store = MemorySessionStore::new(clock.clone());
        let user = SessionUser {
            user_id: Uuid::new_v4(),
            email: "staff@example.com".to_string(),
        };
        store
            .insert("hash".to_string(), user, clock.now() + Duration::seconds(10))
            .await;

        assert!(store.find_user("hash").await.unwrap().is_some());
        assert!(store.find_user("missing").await.unwrap().is_none());

        clock.advance(Duration::seconds(10));
        assert!(store.find_user("hash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credential_store_compare_and_set() {
        let store = MemoryCredentialStore::new();
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::UNIX_EPOCH;
        store.upsert(user_id, b"old", &[], now).await.unwrap();
        store.upsert(user_id, b"new", &[], now).await.unwrap();

        assert!(!store.mark_enabled(user_id, b"old", now).await.unwrap());
        assert!(store.mark_enabled(user_id, b"new", now).await.unwrap());
        // 既に有効化済み
        assert!(!store.mark_enabled(user_id, b"new", now).await.unwrap());

        assert!(!store.delete(user_id, b"old").await.unwrap());
        assert!(store.delete(user_id, b"new").await.unwrap());
        assert!(store.find(user_id).await.unwrap().is_none());
    }
}
