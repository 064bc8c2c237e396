//! Authentication module for the console session.
//!
//! This module provides:
//! - `TokenManager`: login, scheduled renewal, revocation and expiry
//! - `AuthMethod` / `PendingAuthRequest`: login methods and gathered credentials
//! - `CredentialStore`: OS keychain access for the session key
//! - `SessionFile`: the encrypted on-disk copy of the session
//!
//! Renewal fires at half the token TTL and never replaces the token itself.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod method;
pub mod persist;

pub use credentials::CredentialStore;
pub use error::{AuthError, AuthErrorKind};
pub use manager::{LifecycleState, RenewOutcome, TokenManager};
pub use method::{
    discover_methods, fallback_methods, format_method_value, login_options, parse_method_value,
    AuthField, AuthMethod, LoginOption, PendingAuthRequest, LOGIN_METHODS,
};
pub use persist::{SessionCipher, SessionFile};
