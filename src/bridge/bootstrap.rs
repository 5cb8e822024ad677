//! Readiness announcements sent until the guest proves it is alive

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::envelope::Envelope;
use super::identity::EndpointId;
use crate::transport::{MessageTransport, TransferList};

struct PingState {
    transport: Arc<dyn MessageTransport>,
    sender_id: EndpointId,
    payload: Value,
    running: AtomicBool,
    pings_sent: AtomicU64,
}

impl PingState {
    fn ping(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let envelope = Envelope::bootstrap(self.sender_id.clone(), self.payload.clone());
        match self.transport.send(envelope, TransferList::new()) {
            Ok(()) => {
                self.pings_sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => log::debug!("BootstrapLoop: ping not sent: {}", e),
        }
    }
}

/// Periodic bootstrap broadcaster.
///
/// Pings once on start, then every `interval` until stopped.
pub struct BootstrapLoop {
    state: Arc<PingState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapLoop {
    /// Start pinging. Must be called inside a Tokio runtime.
    pub fn start(
        transport: Arc<dyn MessageTransport>,
        sender_id: EndpointId,
        payload: Value,
        interval: Duration,
    ) -> Self {
        let state = Arc::new(PingState {
            transport,
            sender_id,
            payload,
            running: AtomicBool::new(true),
            pings_sent: AtomicU64::new(0),
        });

        state.ping();

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !state.running.load(Ordering::SeqCst) {
                        break;
                    }
                    state.ping();
                }
            })
        };

        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Send one announcement now; no-op once stopped
    pub fn ping(&self) {
        self.state.ping();
    }

    /// The guest page finished loading: one last ping, then stop
    pub fn content_loaded(&self) {
        self.ping();
        self.stop();
    }

    /// Stop pinging. Idempotent.
    pub fn stop(&self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            log::debug!(
                "BootstrapLoop: stopped after {} pings",
                self.state.pings_sent.load(Ordering::SeqCst)
            );
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn pings_sent(&self) -> u64 {
        self.state.pings_sent.load(Ordering::SeqCst)
    }
}

impl Drop for BootstrapLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
