//! Rust client for IG's streaming price API and the REST session endpoints
//! it depends on.
//!
//! The crate is organized by transport surface:
//! - `rest_api`: HTTP client for login, session details and stream credentials.
//! - `stream`: Lightstreamer-style text stream client with delta decoding,
//!   rebind and reconnect handling.
//! - `retry`: shared retry and timeout utilities.

/// REST session client and credential source.
pub mod rest_api;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Streaming session client, protocol helpers and subscription state.
pub mod stream;
