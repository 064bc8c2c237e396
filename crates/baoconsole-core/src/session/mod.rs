//! Session state for the console.
//!
//! This module provides:
//! - `Session`: token, token metadata and selected namespace
//! - `SessionStore`: the single observable owner of the current `Session`
//! - Namespace helpers treating `None`, `""` and `"/"` as root

pub mod model;
pub mod store;

pub use model::{
    canonical_namespace, is_root_namespace, same_namespace, Session, TokenMeta, TokenMetaUpdate,
    ROOT_NAMESPACE,
};
pub use store::{NamespacePolicy, SessionStore, SubscriptionId, DEFAULT_EXPIRY_BUFFER};
