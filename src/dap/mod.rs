//! Debug Adapter Protocol (DAP) client plumbing
//!
//! Layered leaf-first: [`codec`] frames bytes, [`transport`] owns the channel
//! to the adapter, [`engine`] correlates requests with responses and routes
//! events. Message shapes live in [`types`].

pub mod codec;
pub mod engine;
pub mod transport;
pub mod types;

pub use engine::{Closure, EventSubscription, PendingResponse, ProtocolEngine, Started};
pub use transport::{AdapterProcess, Endpoint, Transport};
pub use types::*;
