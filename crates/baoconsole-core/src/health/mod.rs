//! Server health monitoring.
//!
//! This module provides the `SealPoller`, which checks seal status every
//! 10 seconds and sends the console to the unseal flow while sealed.

pub mod poller;

pub use poller::{PollOutcome, PollerHandle, SealPoller, DEFAULT_POLL_INTERVAL};
