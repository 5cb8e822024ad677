//! Request/response bridge primitives
//!
//! Building blocks shared by both sides of the bridge:
//! - Envelope: the wire unit, plus the reserved request types
//! - Sender: issues requests and correlates responses by request id
//! - Receiver: dispatches inbound requests to handlers and answers them
//! - Observable: single-value publish/subscribe for pushed state
//! - Bootstrap: periodic readiness announcement from the host

mod bootstrap;
mod config;
mod envelope;
mod handlers;
mod identity;
mod observable;
mod receiver;
mod sender;

pub use bootstrap::BootstrapLoop;
pub use config::{BridgeConfig, DEFAULT_BOOTSTRAP_INTERVAL};
pub use envelope::{
    BOOTSTRAP_MESSAGE_TYPE, CreatedResponse, Envelope, ErrorEnvelope, GuestSize, InitializationReport,
    RESERVED_REQUEST_TYPES, RESIZE_WINDOW, ResizeOptions, ResizeRequest, STATE_CHANGED, StateChange,
    WEB_CLIENT_CREATED, WEB_CLIENT_INITIALIZED, is_reserved,
};
pub use handlers::{
    Handler, HandlerError, HandlerFuture, HandlerResult, HandlerTable, HandlerTableBuilder, RequestHandler,
    ResponseExtras,
};
pub use identity::EndpointId;
pub use observable::{ObservableValue, Subscription, ValueState};
pub use receiver::{ReceiverState, RequestReceiver};
pub use sender::{PendingResponse, RequestSender};
