//! Inbound request dispatch

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use tokio::runtime::Handle;

use super::envelope::Envelope;
use super::handlers::{HandlerError, HandlerResult, RequestHandler, ResponseExtras};
use super::identity::EndpointId;
use crate::transport::{InboundMessage, ListenerId, MessageTransport, OriginFilter};
use crate::utils::{BridgeError, Result};

/// Receiver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Constructed, not yet attached to the transport
    Created,
    /// Dispatching inbound requests
    Listening,
    /// Detached; terminal
    Destroyed,
}

struct ReceiverCore {
    state: ReceiverState,
    pinned_sender: Option<EndpointId>,
    pin_on: Option<String>,
    listener: Option<ListenerId>,
    /// Runtime handler futures are spawned on, captured by `listen`
    runtime: Option<Handle>,
}

struct ReceiverShared {
    transport: Arc<dyn MessageTransport>,
    expected_origin: OriginFilter,
    handler: Arc<dyn RequestHandler>,
    core: Mutex<ReceiverCore>,
}

impl ReceiverShared {
    fn lock(&self) -> MutexGuard<'_, ReceiverCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_message(self: &Arc<Self>, message: InboundMessage) {
        if !self.expected_origin.matches(&message.origin) {
            log::debug!(
                "RequestReceiver: rejected message from unexpected origin {} (expected {})",
                message.origin,
                self.expected_origin.expected()
            );
            return;
        }

        let envelope = message.envelope;
        if envelope.is_response || envelope.is_bootstrap() {
            return;
        }

        let runtime = {
            let mut core = self.lock();
            if core.state != ReceiverState::Listening {
                return;
            }
            let Some(runtime) = core.runtime.clone() else {
                return;
            };
            if core.pin_on.as_deref() == Some(envelope.request_type.as_str()) {
                // A new session announces itself with this request and
                // supersedes whichever sender was pinned before.
                if core.pinned_sender.as_ref() != Some(&envelope.sender_id) {
                    log::debug!("RequestReceiver: pinned to sender {}", envelope.sender_id);
                    core.pinned_sender = Some(envelope.sender_id.clone());
                }
            } else if let Some(pinned) = &core.pinned_sender {
                if *pinned != envelope.sender_id {
                    log::debug!(
                        "RequestReceiver: dropping {} from superseded sender {}",
                        envelope.request_type,
                        envelope.sender_id
                    );
                    return;
                }
            }
            runtime
        };

        self.dispatch(envelope, &runtime);
    }

    fn dispatch(self: &Arc<Self>, mut request: Envelope, runtime: &Handle) {
        let request_type = request.request_type.clone();
        self.handler.on_request_received(&request_type);

        let extras = ResponseExtras::new();
        let payload = std::mem::take(&mut request.payload);
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle_request(&request_type, payload, extras.clone())
        }));

        let future = match invoked {
            Ok(Some(future)) => future,
            Ok(None) => {
                log::warn!("RequestReceiver: no handler for request type {}", request_type);
                return;
            }
            Err(panic) => {
                self.finish(&request, Err(HandlerError::panicked(panic_message(&*panic))), extras);
                return;
            }
        };

        let shared = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(HandlerError::panicked(panic_message(&*panic))),
            };
            shared.finish(&request, outcome, extras);
        });
    }

    fn finish(&self, request: &Envelope, outcome: HandlerResult, extras: ResponseExtras) {
        let response = match outcome {
            Ok(Some(payload)) => Some(Envelope::response(request, payload)),
            Ok(None) => None,
            Err(error) => {
                log::warn!(
                    "RequestReceiver: handler for {} failed: {}",
                    request.request_type,
                    error
                );
                self.handler.on_request_handler_exception(&request.request_type);
                Some(Envelope::failure(request, error.into()))
            }
        };

        if self.lock().state == ReceiverState::Destroyed {
            log::debug!(
                "RequestReceiver: discarding result of {} after destroy",
                request.request_type
            );
            return;
        }

        let failed = response.as_ref().is_some_and(|r| r.error.is_some());
        // Notifications run their handler but are never answered.
        let response = response.filter(|_| request.expects_response());
        if let Some(response) = response {
            if let Err(e) = self.transport.send(response, extras.take_transfers()) {
                log::warn!(
                    "RequestReceiver: could not answer {} #{}: {}",
                    request.request_type,
                    request.request_id,
                    e
                );
                return;
            }
        }
        if !failed {
            self.handler.on_request_completed(&request.request_type);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// Listens on a transport and answers requests through a [`RequestHandler`]
pub struct RequestReceiver {
    shared: Arc<ReceiverShared>,
}

impl RequestReceiver {
    /// Create a receiver accepting requests from `expected_origin` only.
    ///
    /// Nothing is dispatched until [`listen`](Self::listen) is called.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        expected_origin: OriginFilter,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(ReceiverShared {
                transport,
                expected_origin,
                handler,
                core: Mutex::new(ReceiverCore {
                    state: ReceiverState::Created,
                    pinned_sender: None,
                    pin_on: None,
                    listener: None,
                    runtime: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.lock().state
    }

    /// Attach to the transport and start dispatching.
    ///
    /// Must be called within a Tokio runtime; handler futures run on that
    /// runtime whichever thread the transport delivers messages on.
    pub fn listen(&self) -> Result<()> {
        let mut core = self.shared.lock();
        if core.state != ReceiverState::Created {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|e| BridgeError::RuntimeUnavailable(e.to_string()))?;

        let weak: Weak<ReceiverShared> = Arc::downgrade(&self.shared);
        let listener = self.shared.transport.add_listener(Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(message);
            }
        }));
        core.listener = Some(listener);
        core.runtime = Some(runtime);
        core.state = ReceiverState::Listening;
        Ok(())
    }

    /// Re-pin to the sender of every `request_type` request.
    ///
    /// Requests of that type always pass the identity check.
    pub fn pin_on_request(&self, request_type: &str) {
        self.shared.lock().pin_on = Some(request_type.to_string());
    }

    /// Accept requests only from `sender` from now on. Pinning again replaces
    /// the previous identity.
    pub fn pin_sender(&self, sender: EndpointId) {
        let mut core = self.shared.lock();
        if core.pinned_sender.as_ref() != Some(&sender) {
            log::debug!("RequestReceiver: pinned to sender {}", sender);
        }
        core.pinned_sender = Some(sender);
    }

    pub fn pinned_sender(&self) -> Option<EndpointId> {
        self.shared.lock().pinned_sender.clone()
    }

    /// Detach from the transport. Idempotent.
    pub fn destroy(&self) {
        let listener = {
            let mut core = self.shared.lock();
            if core.state == ReceiverState::Destroyed {
                return;
            }
            core.state = ReceiverState::Destroyed;
            core.listener.take()
        };
        if let Some(listener) = listener {
            self.shared.transport.remove_listener(listener);
        }
    }
}

impl Drop for RequestReceiver {
    fn drop(&mut self) {
        self.destroy();
    }
}
