//! Message transports connecting two isolated endpoints
//!
//! A transport is a point-to-point duplex channel:
//! - `send` posts an envelope (plus optional transfer hints) to the peer
//! - listeners registered with `add_listener` receive inbound messages
//!
//! Delivery is FIFO per direction, but nothing guarantees the peer is
//! listening yet; messages posted before that are lost.
//!
//! Once a transport can no longer deliver (peer gone, I/O failure, explicit
//! close) it fires its close listeners exactly once.

mod memory;
mod origin;
mod stream;
mod transfer;

pub use memory::{MemoryTransport, TransportStats};
pub use origin::{OriginFilter, normalize_origin};
pub use stream::StreamTransport;
pub use transfer::{Buffer, TransferList};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::bridge::Envelope;
use crate::utils::Result;

/// A message as seen by the receiving side
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Origin of the context that posted the message
    pub origin: String,
    pub envelope: Envelope,
    pub transfers: TransferList,
}

/// Callback invoked for every inbound message
pub type MessageListener = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Callback invoked once when the transport stops delivering, with the reason
pub type CloseListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by `add_listener` and `add_close_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Duplex channel primitive the bridge is layered on.
///
/// Listeners may be invoked from any thread, inside or outside a Tokio
/// runtime. The bridge spawns handler work on the runtime that was current
/// when its receiver started listening, never on the caller's context.
pub trait MessageTransport: Send + Sync {
    /// Post an envelope to the peer
    fn send(&self, envelope: Envelope, transfers: TransferList) -> Result<()>;

    /// Register a receive callback
    fn add_listener(&self, listener: MessageListener) -> ListenerId;

    /// Remove a previously registered callback
    fn remove_listener(&self, id: ListenerId);

    /// Register a callback for when the transport closes. If it already has,
    /// the callback runs immediately.
    fn add_close_listener(&self, listener: CloseListener) -> ListenerId;

    /// Remove a previously registered close callback
    fn remove_close_listener(&self, id: ListenerId);
}

/// Listener registry shared by the bundled transports
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Deliver to a snapshot of the current listeners, returning how many saw it
    pub(crate) fn dispatch(&self, message: InboundMessage) -> usize {
        let snapshot: Vec<MessageListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in &snapshot {
            listener(message.clone());
        }
        snapshot.len()
    }
}

/// One-shot closed flag plus its listeners, shared by the bundled transports
#[derive(Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, CloseListener)>>,
}

impl CloseSignal {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn add(&self, listener: CloseListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            // `fire` flips the flag under this lock.
            if !self.is_closed() {
                listeners.push((id, listener));
                return id;
            }
        }
        listener("transport already closed");
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Mark closed and notify every listener. Only the first call notifies.
    pub(crate) fn fire(&self, reason: &str) -> bool {
        let listeners: Vec<(ListenerId, CloseListener)> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
            std::mem::take(&mut *listeners)
        };

        log::debug!("transport closed: {}", reason);
        for (_, listener) in &listeners {
            listener(reason);
        }
        true
    }
}
