//! Guest side of the bridge
//!
//! The guest is the sandboxed context. It waits for the host's bootstrap
//! ping, asks for its initial state with the created call, mirrors pushed
//! state changes into a [`StateStore`], and reports how its own
//! initialization went.

mod state;

pub use state::StateStore;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::{
    BridgeConfig, CreatedResponse, EndpointId, GuestSize, HandlerError, HandlerTable, InitializationReport,
    ObservableValue, RESIZE_WINDOW, RequestReceiver, RequestSender, ResizeOptions, ResizeRequest,
    ResponseExtras, STATE_CHANGED, StateChange, WEB_CLIENT_CREATED, WEB_CLIENT_INITIALIZED,
};
use crate::transport::{ListenerId, MessageTransport, OriginFilter};
use crate::utils::Result;

/// Application code running inside the guest
#[async_trait]
pub trait WebClient: Send + Sync {
    /// Set up the client once the initial state has arrived
    async fn initialize(&self, endpoint: &GuestEndpoint) -> std::result::Result<(), HandlerError>;
}

fn state_handlers(state: Arc<StateStore>) -> Result<HandlerTable> {
    HandlerTable::builder()
        .on_reserved(STATE_CHANGED, move |payload: Value, _extras: ResponseExtras| {
            // Assigned before the future is returned so changes apply in
            // arrival order.
            let outcome = serde_json::from_value::<StateChange>(payload)
                .map(|change| {
                    state.assign(&change.name, change.value);
                    None
                })
                .map_err(HandlerError::from);
            future::ready(outcome)
        })
        .build()
}

/// The guest's end of the bridge
pub struct GuestEndpoint {
    id: EndpointId,
    transport: Arc<dyn MessageTransport>,
    sender: RequestSender,
    receiver: Arc<RequestReceiver>,
    state: Arc<StateStore>,
    bootstrap_payload: ObservableValue<Value>,
    bootstrap_listener: Mutex<Option<ListenerId>>,
}

impl GuestEndpoint {
    /// Attach to the host behind `transport`.
    ///
    /// `handlers` answers the host's business requests. Must be called inside
    /// a Tokio runtime.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        host_origin: &str,
        handlers: HandlerTable,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let id = EndpointId::new();
        let origin = OriginFilter::new(host_origin)?;
        let state = Arc::new(StateStore::new());
        let table = handlers.layered_over(state_handlers(Arc::clone(&state))?);

        let sender = RequestSender::new(
            Arc::clone(&transport),
            origin.clone(),
            id.clone(),
            config.request_timeout,
        );
        let receiver = Arc::new(RequestReceiver::new(Arc::clone(&transport), origin.clone(), Arc::new(table)));
        receiver.listen()?;

        let bootstrap_payload = ObservableValue::with_no_value();
        let listener = {
            let receiver: Weak<RequestReceiver> = Arc::downgrade(&receiver);
            let payload = bootstrap_payload.clone();
            transport.add_listener(Arc::new(move |message| {
                if !message.envelope.is_bootstrap() || !origin.matches(&message.origin) {
                    return;
                }
                if let Some(receiver) = receiver.upgrade() {
                    if receiver.pinned_sender().as_ref() != Some(&message.envelope.sender_id) {
                        log::debug!("GuestEndpoint: host session {}", message.envelope.sender_id);
                        receiver.pin_sender(message.envelope.sender_id.clone());
                    }
                }
                if payload.value().as_ref() != Some(&message.envelope.payload) {
                    payload.assign_and_signal(message.envelope.payload);
                }
            }))
        };

        log::info!("GuestEndpoint {} listening for host at {}", id, host_origin);

        Ok(Self {
            id,
            transport,
            sender,
            receiver,
            state,
            bootstrap_payload,
            bootstrap_listener: Mutex::new(Some(listener)),
        })
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Identity of the host, known once a bootstrap ping has arrived
    pub fn host_id(&self) -> Option<EndpointId> {
        self.receiver.pinned_sender()
    }

    /// Payload of the most recent bootstrap ping
    pub fn bootstrap_payload(&self) -> &ObservableValue<Value> {
        &self.bootstrap_payload
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Shorthand for `state().observe(name)`
    pub fn observe(&self, name: &str) -> ObservableValue<Value> {
        self.state.observe(name)
    }

    /// Announce this guest to the host and load the initial state.
    ///
    /// Every entry of the snapshot is assigned to the state store before this
    /// returns.
    pub async fn web_client_created(&self) -> Result<Map<String, Value>> {
        let response: CreatedResponse = self.sender.call(WEB_CLIENT_CREATED, &Value::Null).await?;
        self.state.apply_snapshot(response.initial_state.clone());
        Ok(response.initial_state)
    }

    /// Run the full client lifecycle: created, `initialize`, then report.
    ///
    /// Returns whether the client initialized successfully. Bridge failures
    /// before initialization are returned as errors.
    pub async fn register_web_client(&self, client: &dyn WebClient) -> Result<bool> {
        self.web_client_created().await?;

        let report = match client.initialize(self).await {
            Ok(()) => InitializationReport {
                success: true,
                exception: None,
            },
            Err(error) => {
                log::warn!("GuestEndpoint: client initialization failed: {}", error);
                InitializationReport {
                    success: false,
                    exception: Some(error.to_envelope()),
                }
            }
        };
        let success = report.success;
        self.sender.notify(WEB_CLIENT_INITIALIZED, &report)?;
        Ok(success)
    }

    /// Ask the host to resize the guest's container
    pub async fn request_resize(&self, size: GuestSize, duration: Option<Duration>) -> Result<()> {
        let request = ResizeRequest {
            size,
            options: ResizeOptions::with_duration(duration),
        };
        let _: Value = self.sender.call(RESIZE_WINDOW, &request).await?;
        Ok(())
    }

    /// Fire-and-forget call into the host
    pub fn notify<Req>(&self, request_type: &str, request: &Req) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        self.sender.notify(request_type, request)
    }

    /// Call into the host. The request is posted immediately; the returned
    /// future resolves with the host's answer.
    pub fn request<Req, Resp>(
        &self,
        request_type: &str,
        request: &Req,
    ) -> impl Future<Output = Result<Resp>> + Send + use<Req, Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.sender.call(request_type, request)
    }

    pub fn sender(&self) -> &RequestSender {
        &self.sender
    }

    /// Stop answering, reject outstanding calls, and drop all subscribers
    pub fn destroy(&self) {
        let listener = self
            .bootstrap_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return;
        };
        self.transport.remove_listener(listener);
        self.receiver.destroy();
        self.sender.destroy();
        self.state.clear_subscribers();
        self.bootstrap_payload.clear_subscribers();
        log::info!("GuestEndpoint {} destroyed", self.id);
    }
}

impl Drop for GuestEndpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Envelope;
    use crate::transport::{InboundMessage, MemoryTransport, TransferList};
    use serde_json::json;
    use tokio::sync::mpsc;

    const HOST: &str = "chrome://panel";
    const GUEST: &str = "https://guest.example.com";

    fn guest() -> (GuestEndpoint, Arc<MemoryTransport>, mpsc::UnboundedReceiver<Envelope>) {
        let (host_side, guest_side) = MemoryTransport::pair(HOST, GUEST);
        let host_side = Arc::new(host_side);
        let (tx, rx) = mpsc::unbounded_channel();
        host_side.add_listener(Arc::new(move |msg: InboundMessage| {
            let _ = tx.send(msg.envelope);
        }));
        let guest = GuestEndpoint::new(
            Arc::new(guest_side),
            HOST,
            HandlerTable::empty(),
            &BridgeConfig::default(),
        )
        .unwrap();
        (guest, host_side, rx)
    }

    fn state_change(host_id: &EndpointId, id: u64, name: &str, value: Value) -> Envelope {
        Envelope::request(
            STATE_CHANGED,
            id,
            host_id.clone(),
            serde_json::to_value(StateChange {
                name: name.to_string(),
                value,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_pins_host_and_exposes_payload() {
        let (guest, host, _rx) = guest();
        let host_id = EndpointId::new();
        host.send(
            Envelope::bootstrap(host_id.clone(), json!({"apiSource": "client.js"})),
            TransferList::new(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(guest.host_id(), Some(host_id));
        assert_eq!(guest.bootstrap_payload().value(), Some(json!({"apiSource": "client.js"})));
    }

    #[tokio::test]
    async fn test_state_changes_apply_in_order_and_ignore_stale_host() {
        let (guest, host, _rx) = guest();
        let host_id = EndpointId::new();
        host.send(Envelope::bootstrap(host_id.clone(), Value::Null), TransferList::new())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        guest
            .observe("panelState")
            .subscribe(move |v| sink.lock().unwrap().push(v.clone()));

        for (id, value) in [(1, "a"), (2, "b"), (3, "c")] {
            host.send(state_change(&host_id, id, "panelState", json!(value)), TransferList::new())
                .unwrap();
        }
        let stale = EndpointId::new();
        host.send(state_change(&stale, 4, "panelState", json!("stale")), TransferList::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_web_client_created_assigns_snapshot() {
        let (guest, host, mut rx) = guest();
        let answer = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.request_type, WEB_CLIENT_CREATED);
            host.send(
                Envelope::response(&request, json!({"initialState": {"panelState": "docked"}})),
                TransferList::new(),
            )
            .unwrap();
            host
        });

        let snapshot = guest.web_client_created().await.unwrap();
        assert_eq!(snapshot["panelState"], "docked");
        assert_eq!(guest.state().get("panelState"), Some(json!("docked")));
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_rejects_calls() {
        let (guest, _host, _rx) = guest();
        let pending = guest.request::<_, Value>("anything", &json!({}));
        guest.destroy();
        guest.destroy();
        assert!(pending.await.is_err());
        assert!(guest.notify("anything", &Value::Null).is_err());
    }
}
