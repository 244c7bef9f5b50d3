pub mod cipher;
pub mod clock;
pub mod mfa;
pub mod totp;

pub use cipher::SecretCipher;
pub use clock::{Clock, SystemClock};
pub use mfa::MfaService;
pub use totp::TotpEngine;
