pub mod memory;
pub mod mfa_credential;
pub mod rate_limit;
pub mod security_event;
pub mod session;

pub use mfa_credential::{CredentialStore, PgCredentialStore};
pub use rate_limit::{PgRateLimiter, RateLimitDecision, RateLimiter};
pub use security_event::{PgSecurityEventLog, SecurityEventLog};
pub use session::{PgSessionStore, SessionStore};
