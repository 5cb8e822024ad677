//! Outbound request issuing and response correlation

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::envelope::Envelope;
use super::identity::EndpointId;
use crate::transport::{InboundMessage, ListenerId, MessageTransport, OriginFilter, TransferList};
use crate::utils::{BridgeError, RemoteError, Result};

struct PendingRequest {
    request_type: String,
    completion: oneshot::Sender<Result<Value>>,
}

struct SenderState {
    next_request_id: u64,
    pending: HashMap<u64, PendingRequest>,
    destroyed: bool,
}

impl SenderState {
    /// Next id not currently outstanding. Zero marks notifications.
    fn allocate_request_id(&mut self) -> u64 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

struct SenderShared {
    id: EndpointId,
    transport: Arc<dyn MessageTransport>,
    remote_origin: OriginFilter,
    request_timeout: Option<Duration>,
    state: Mutex<SenderState>,
}

impl SenderShared {
    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_message(&self, message: InboundMessage) {
        let envelope = message.envelope;
        if !envelope.is_response {
            return;
        }
        if envelope.sender_id != self.id {
            log::debug!(
                "RequestSender: ignoring response for another sender ({})",
                envelope.sender_id
            );
            return;
        }
        if !self.remote_origin.matches(&message.origin) {
            log::debug!("RequestSender: dropping response from unexpected origin {}", message.origin);
            return;
        }

        let pending = self.lock().pending.remove(&envelope.request_id);
        let Some(pending) = pending else {
            log::debug!(
                "RequestSender: dropping stale response {} #{}",
                envelope.request_type,
                envelope.request_id
            );
            return;
        };

        let result = match envelope.error {
            Some(error) => Err(BridgeError::Remote(RemoteError::from_envelope(error))),
            None => Ok(envelope.payload),
        };
        if pending.completion.send(result).is_err() {
            log::debug!("RequestSender: caller for {} went away", pending.request_type);
        }
    }

    fn forget(&self, request_id: u64) {
        self.lock().pending.remove(&request_id);
    }

    /// Settle every outstanding request with an error built by `error`
    fn reject_all(&self, mut state: MutexGuard<'_, SenderState>, error: impl Fn() -> BridgeError) {
        let drained: Vec<PendingRequest> = state.pending.drain().map(|(_, pending)| pending).collect();
        drop(state);

        if !drained.is_empty() {
            log::debug!("RequestSender: rejecting {} outstanding requests", drained.len());
        }
        for pending in drained {
            let _ = pending.completion.send(Err(error()));
        }
    }

    fn on_transport_closed(&self, reason: &str) {
        let state = self.lock();
        if state.destroyed {
            return;
        }
        self.reject_all(state, || BridgeError::TransportUnavailable(reason.to_string()));
    }
}

/// Issues requests to the remote endpoint and matches their responses
pub struct RequestSender {
    shared: Arc<SenderShared>,
    listeners: Mutex<Option<(ListenerId, ListenerId)>>,
}

impl RequestSender {
    /// Attach a sender to `transport`.
    ///
    /// Only responses posted from `remote_origin` and addressed to `id` are
    /// accepted. When the transport closes, every outstanding request is
    /// rejected with [`BridgeError::TransportUnavailable`].
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        remote_origin: OriginFilter,
        id: EndpointId,
        request_timeout: Option<Duration>,
    ) -> Self {
        let shared = Arc::new(SenderShared {
            id,
            transport: Arc::clone(&transport),
            remote_origin,
            request_timeout,
            state: Mutex::new(SenderState {
                next_request_id: 1,
                pending: HashMap::new(),
                destroyed: false,
            }),
        });

        let weak: Weak<SenderShared> = Arc::downgrade(&shared);
        let message_listener = transport.add_listener(Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(message);
            }
        }));
        let weak: Weak<SenderShared> = Arc::downgrade(&shared);
        let close_listener = transport.add_close_listener(Arc::new(move |reason: &str| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_closed(reason);
            }
        }));

        Self {
            shared,
            listeners: Mutex::new(Some((message_listener, close_listener))),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.shared.id
    }

    /// Number of requests still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Fire-and-forget notification; no completion is observable and the
    /// remote side never answers it
    pub fn request_no_response(&self, request_type: &str, payload: Value, transfers: TransferList) -> Result<()> {
        if self.shared.lock().destroyed {
            return Err(BridgeError::SenderDestroyed);
        }

        let envelope = Envelope::notification(request_type, self.shared.id.clone(), payload);
        self.shared.transport.send(envelope, transfers)
    }

    /// Send a request and return a future for its response.
    ///
    /// The request is posted before this returns; awaiting only waits for the
    /// answer.
    pub fn request_with_response(&self, request_type: &str, payload: Value, transfers: TransferList) -> PendingResponse {
        let (completion, receiver) = oneshot::channel();
        let request_id = {
            let mut state = self.shared.lock();
            if state.destroyed {
                return PendingResponse::failed(request_type, BridgeError::SenderDestroyed);
            }
            let request_id = state.allocate_request_id();
            state.pending.insert(
                request_id,
                PendingRequest {
                    request_type: request_type.to_string(),
                    completion,
                },
            );
            request_id
        };

        let envelope = Envelope::request(request_type, request_id, self.shared.id.clone(), payload);
        if let Err(err) = self.shared.transport.send(envelope, transfers) {
            log::warn!("RequestSender: failed to send {}: {}", request_type, err);
            let pending = self.shared.lock().pending.remove(&request_id);
            if let Some(pending) = pending {
                let _ = pending.completion.send(Err(err));
            }
        }

        PendingResponse {
            request_type: request_type.to_string(),
            request_id,
            receiver: Some(receiver),
            immediate: None,
            deadline: self.shared.request_timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            shared: Arc::downgrade(&self.shared),
            settled: false,
        }
    }

    /// Typed request: serializes `request`, deserializes the response
    pub fn call<Req, Resp>(
        &self,
        request_type: &str,
        request: &Req,
    ) -> impl Future<Output = Result<Resp>> + Send + use<Req, Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let pending = serde_json::to_value(request)
            .map(|payload| self.request_with_response(request_type, payload, TransferList::new()));
        async move {
            let value = pending?.await?;
            let response: Resp = serde_json::from_value(value)?;
            Result::<Resp>::Ok(response)
        }
    }

    /// Typed fire-and-forget notification
    pub fn notify<Req>(&self, request_type: &str, request: &Req) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(request)?;
        self.request_no_response(request_type, payload, TransferList::new())
    }

    /// Reject everything outstanding and detach from the transport. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.shared.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        self.shared.reject_all(state, || BridgeError::SenderDestroyed);

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((message_listener, close_listener)) = listeners {
            self.shared.transport.remove_listener(message_listener);
            self.shared.transport.remove_close_listener(close_listener);
        }
    }
}

impl Drop for RequestSender {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Future for the response to one request
pub struct PendingResponse {
    request_type: String,
    request_id: u64,
    receiver: Option<oneshot::Receiver<Result<Value>>>,
    immediate: Option<BridgeError>,
    deadline: Option<Pin<Box<Sleep>>>,
    shared: Weak<SenderShared>,
    settled: bool,
}

impl PendingResponse {
    fn failed(request_type: &str, error: BridgeError) -> Self {
        Self {
            request_type: request_type.to_string(),
            request_id: 0,
            receiver: None,
            immediate: Some(error),
            deadline: None,
            shared: Weak::new(),
            settled: false,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(error) = this.immediate.take() {
            this.settled = true;
            return Poll::Ready(Err(error));
        }

        if let Some(receiver) = this.receiver.as_mut() {
            match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.settled = true;
                    this.receiver = None;
                    return Poll::Ready(result);
                }
                Poll::Ready(Err(_)) => {
                    this.settled = true;
                    this.receiver = None;
                    return Poll::Ready(Err(BridgeError::SenderDestroyed));
                }
                Poll::Pending => {}
            }
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.settled = true;
                this.receiver = None;
                if let Some(shared) = this.shared.upgrade() {
                    shared.forget(this.request_id);
                }
                return Poll::Ready(Err(BridgeError::Timeout {
                    request_type: this.request_type.clone(),
                    request_id: this.request_id,
                }));
            }
        }

        Poll::Pending
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(shared) = self.shared.upgrade() {
                shared.forget(self.request_id);
            }
        }
    }
}
