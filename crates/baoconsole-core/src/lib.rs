//! Session core for an OpenBao administrative console.
//!
//! This crate owns everything between the login form and the REST API:
//! - `api`: the `ClientFactory` and immutable, (token, namespace)-bound clients
//! - `session`: the observable `SessionStore`
//! - `auth`: login, token renewal and revocation, session persistence
//! - `namespace`: namespace switching and listing
//! - `routing`: the route guard
//! - `health`: the seal status poller
//! - `console`: all of the above wired together

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod console;
pub mod health;
pub mod namespace;
pub mod notify;
pub mod routing;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ApiClient, ApiError, ClientFactory};
pub use auth::{AuthError, AuthMethod, LifecycleState, PendingAuthRequest, TokenManager};
pub use config::{ConsoleConfig, PreferenceStore, Preferences};
pub use console::{Console, ConsoleBuilder};
pub use routing::{Location, Navigator, RouteGuard};
pub use session::{Session, SessionStore, TokenMeta};
