//! In-process transport for tests and single-process embedders

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::{
    CloseListener, CloseSignal, InboundMessage, ListenerId, ListenerSet, MessageListener, MessageTransport,
    TransferList,
};
use crate::bridge::Envelope;
use crate::utils::{BridgeError, Result};

/// Delivery counters for one side of a memory transport
#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    transferred_bytes: AtomicU64,
}

impl TransportStats {
    /// Messages accepted by `send`
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Messages that reached at least one peer listener
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Messages that arrived while the peer had no listener
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Bytes handed over by reference instead of copied
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::SeqCst)
    }
}

/// One end of an in-process duplex channel.
///
/// Messages are delivered asynchronously, in order, by a pump task per
/// direction. Like a freshly navigated frame, a side with no listener simply
/// loses whatever arrives. Closing either side, or dropping it, closes the
/// channel for both.
pub struct MemoryTransport {
    origin: String,
    sender: UnboundedSender<InboundMessage>,
    listeners: Arc<ListenerSet>,
    stats: Arc<TransportStats>,
    closed: Arc<CloseSignal>,
}

impl MemoryTransport {
    /// Create a connected transport pair.
    ///
    /// `origin_a` is the origin the first side's messages appear to come from,
    /// `origin_b` likewise for the second. Must be called inside a Tokio runtime.
    pub fn pair(origin_a: &str, origin_b: &str) -> (Self, Self) {
        let (tx_to_b, rx_at_b) = unbounded_channel();
        let (tx_to_a, rx_at_a) = unbounded_channel();

        let listeners_a = Arc::new(ListenerSet::default());
        let listeners_b = Arc::new(ListenerSet::default());
        let stats_a = Arc::new(TransportStats::default());
        let stats_b = Arc::new(TransportStats::default());
        let closed = Arc::new(CloseSignal::default());

        // Stats are attributed to the side that sent the message.
        spawn_pump(rx_at_b, Arc::clone(&listeners_b), Arc::clone(&stats_a), Arc::clone(&closed));
        spawn_pump(rx_at_a, Arc::clone(&listeners_a), Arc::clone(&stats_b), Arc::clone(&closed));

        let side_a = Self {
            origin: origin_a.to_string(),
            sender: tx_to_b,
            listeners: listeners_a,
            stats: stats_a,
            closed: Arc::clone(&closed),
        };

        let side_b = Self {
            origin: origin_b.to_string(),
            sender: tx_to_a,
            listeners: listeners_b,
            stats: stats_b,
            closed,
        };

        (side_a, side_b)
    }

    /// Origin stamped on messages sent from this side
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Tear the channel down for both sides; later sends fail and close
    /// listeners on both sides are notified
    pub fn close(&self) {
        self.closed.fire("channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Deliver a message to this side's listeners as if an arbitrary context
    /// had posted it. Returns how many listeners saw it.
    pub fn inject(&self, message: InboundMessage) -> usize {
        self.listeners.dispatch(message)
    }
}

fn spawn_pump(
    mut receiver: UnboundedReceiver<InboundMessage>,
    listeners: Arc<ListenerSet>,
    stats: Arc<TransportStats>,
    closed: Arc<CloseSignal>,
) {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if listeners.dispatch(message) > 0 {
                stats.delivered.fetch_add(1, Ordering::SeqCst);
            } else {
                stats.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
        // Every sender for this direction is gone: the peer side was dropped.
        closed.fire("peer transport dropped");
    });
}

impl MessageTransport for MemoryTransport {
    fn send(&self, envelope: Envelope, transfers: TransferList) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::TransportUnavailable("channel closed".to_string()));
        }

        let transferred = transfers.total_bytes() as u64;
        self.sender
            .send(InboundMessage {
                origin: self.origin.clone(),
                envelope,
                transfers,
            })
            .map_err(|e| BridgeError::TransportUnavailable(format!("failed to post message: {}", e)))?;

        self.stats.sent.fetch_add(1, Ordering::SeqCst);
        self.stats.transferred_bytes.fetch_add(transferred, Ordering::SeqCst);
        Ok(())
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn add_close_listener(&self, listener: CloseListener) -> ListenerId {
        self.closed.add(listener)
    }

    fn remove_close_listener(&self, id: ListenerId) {
        self.closed.remove(id);
    }
}
