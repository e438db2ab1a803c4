//! Streaming session modules.
//!
//! - `proto`: request paths and bodies, line tokens and frame classification.
//! - `delta`: field-level delta decoding of data lines.
//! - `reader`: incremental line reader over a chunked response body.
//! - `registry`: subscription configurations and the per-item value cache.
//! - `client`: HTTP transport for connect, bind and control requests.
//! - `session`: the session controller and its read loop.

/// HTTP transport, stream options and the stream error type.
pub mod client;
/// Delta decoding of data update lines.
pub mod delta;
/// Stream protocol tokens, frames and request bodies.
pub mod proto;
/// Line reader over a streaming response.
pub mod reader;
/// Subscription registry and decoded updates.
pub mod registry;
/// Session controller state machine.
pub mod session;

pub use client::{StreamError, StreamOptions};
pub use proto::SubscriptionMode;
pub use registry::{SubscriptionConfig, SubscriptionId, Update};
pub use session::{ConnectionState, StreamController, SubscriptionEvent};
