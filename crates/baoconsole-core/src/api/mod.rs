//! REST API client module for OpenBao.
//!
//! This module provides the `ClientFactory` and the immutable `ApiClient`
//! it builds, the `Transport` seam the client talks through, and the wire
//! types for the endpoints the console consumes.
//!
//! Requests authenticate with the `X-Vault-Token` header and are scoped by
//! the `X-Vault-Namespace` header, which is omitted for the root namespace.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::{ApiClient, ClientFactory, NAMESPACE_HEADER, TOKEN_HEADER};
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
pub use types::{AuthBlock, EnabledAuthMethod, ListResponse, NamespaceDetail, SealStatus, TokenLookup};
