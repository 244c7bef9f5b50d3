pub mod auth;
pub mod health;
pub mod mfa;

pub use auth::AuthenticatedUser;
pub use health::health_check;
pub use mfa::mfa;
