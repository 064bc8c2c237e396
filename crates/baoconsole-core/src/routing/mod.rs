//! Navigation and route gating.
//!
//! `Navigator` is the seam to whatever shell displays routes; `RouteGuard`
//! decides which routes may render for the current session.

pub mod guard;
pub mod navigator;

pub use guard::{is_safe_redirect, GuardDecision, RouteGuard, RouteTable};
pub use navigator::{strip_query, HistoryNavigator, Location, Navigator, REDIRECT_PARAM};
