//! Namespace selection and browsing.
//!
//! This module provides:
//! - `NamespaceSwitcher`: the single writer of the selected namespace
//! - `list_namespaces` / `filter_namespaces`: the namespace picker's data
//! - `create_namespace` / `delete_namespace`: namespace administration

pub mod listing;
pub mod switcher;

pub use listing::{create_namespace, delete_namespace, filter_namespaces, list_namespaces, Namespace};
pub use switcher::NamespaceSwitcher;
