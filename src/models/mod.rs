pub mod mfa_credential;
pub mod security_event;
pub mod session;

pub use mfa_credential::MfaCredential;
pub use security_event::{SecurityEvent, SecurityEventKind};
pub use session::SessionUser;
