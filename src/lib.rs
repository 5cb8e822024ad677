//! # guestlink - Host/Guest RPC Bridge
//!
//! A bidirectional request/response bridge between a privileged host and a
//! sandboxed guest that share no memory and talk only through serializable
//! messages.
//!
//! ## Architecture
//!
//! The crate is organized into the following core modules:
//!
//! - **transport**: the duplex message channel seam, with in-process and
//!   byte-stream implementations
//! - **bridge**: envelopes, request sender/receiver, handler tables,
//!   observable values and the bootstrap loop
//! - **host**: the host endpoint, its lifecycle handlers and request metrics
//! - **guest**: the guest endpoint and its mirrored state store
//! - **utils**: shared error types

pub mod bridge;
pub mod guest;
pub mod host;
pub mod transport;
pub mod utils;

// Re-export main types for convenience
pub use bridge::{BridgeConfig, EndpointId, Envelope, HandlerError, HandlerTable, ObservableValue};
pub use guest::{GuestEndpoint, WebClient};
pub use host::{HostDelegate, HostEmbedder, HostEndpoint};
pub use transport::{MemoryTransport, MessageTransport, StreamTransport};
pub use utils::error::{BridgeError, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "guestlink";
