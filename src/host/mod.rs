//! Host side of the bridge
//!
//! The host is the privileged context embedding the guest. It:
//! - announces readiness with bootstrap pings until the guest shows up
//! - answers the guest's lifecycle requests (created, initialized, resize)
//! - pushes named state changes to the guest
//! - counts every request it handles

mod metrics;

pub use metrics::{RequestCounts, RequestEvent, RequestTypeStats};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::{
    BootstrapLoop, BridgeConfig, CreatedResponse, EndpointId, ErrorEnvelope, GuestSize, HandlerError,
    HandlerFuture, HandlerResult, HandlerTable, InitializationReport, RESIZE_WINDOW, RequestHandler,
    RequestReceiver, RequestSender, ResizeRequest, ResponseExtras, STATE_CHANGED, StateChange,
    WEB_CLIENT_CREATED, WEB_CLIENT_INITIALIZED,
};
use crate::transport::{MessageTransport, OriginFilter};
use crate::utils::Result;

/// Lifecycle notifications for whatever embeds the guest
#[cfg_attr(test, mockall::automock)]
pub trait HostEmbedder: Send + Sync {
    /// The guest asked for its container to be resized
    fn on_guest_resize_request(&self, size: GuestSize);

    /// The guest finished initializing, successfully or not
    fn web_client_initialization_done(&self, success: bool, exception: Option<ErrorEnvelope>);

    /// The guest has received its initial state and is ready to be shown
    fn web_client_ready(&self);
}

/// Supplies host state to the guest and hears about its lifecycle
#[async_trait]
pub trait HostDelegate: Send + Sync {
    /// Produce the initial state snapshot for a newly created guest
    async fn web_client_created(&self) -> std::result::Result<Map<String, Value>, HandlerError>;

    async fn web_client_initialized(&self, _success: bool) {}

    /// Apply a resize the guest asked for
    async fn resize_widget(
        &self,
        _size: GuestSize,
        _duration: Option<Duration>,
    ) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

/// Dispatch wrapper that ends bootstrapping and records request counts
struct HostRequestHandler {
    table: HandlerTable,
    bootstrap: Arc<BootstrapLoop>,
    counts: Arc<RequestCounts>,
}

impl RequestHandler for HostRequestHandler {
    fn handle_request(&self, request_type: &str, payload: Value, extras: ResponseExtras) -> Option<HandlerFuture> {
        let future = self.table.invoke(request_type, payload, extras)?;
        // Any real request proves the guest is listening.
        self.bootstrap.stop();
        Some(future)
    }

    fn on_request_received(&self, request_type: &str) {
        self.counts.record(request_type, RequestEvent::Received);
    }

    fn on_request_handler_exception(&self, request_type: &str) {
        self.counts.record(request_type, RequestEvent::HandlerException);
    }

    fn on_request_completed(&self, request_type: &str) {
        self.counts.record(request_type, RequestEvent::ResponseSent);
    }
}

fn lifecycle_handlers(delegate: Arc<dyn HostDelegate>, embedder: Arc<dyn HostEmbedder>) -> Result<HandlerTable> {
    let created = {
        let delegate = Arc::clone(&delegate);
        let embedder = Arc::clone(&embedder);
        move |_payload: Value, _extras: ResponseExtras| {
            let delegate = Arc::clone(&delegate);
            let embedder = Arc::clone(&embedder);
            async move {
                let initial_state = delegate.web_client_created().await?;
                embedder.web_client_ready();
                let response = serde_json::to_value(CreatedResponse { initial_state })?;
                HandlerResult::Ok(Some(response))
            }
        }
    };

    let initialized = {
        let delegate = Arc::clone(&delegate);
        let embedder = Arc::clone(&embedder);
        move |payload: Value, _extras: ResponseExtras| {
            let delegate = Arc::clone(&delegate);
            let embedder = Arc::clone(&embedder);
            async move {
                let report: InitializationReport = serde_json::from_value(payload)?;
                if !report.success {
                    log::warn!(
                        "HostEndpoint: guest initialization failed: {}",
                        report
                            .exception
                            .as_ref()
                            .map(|e| e.message.as_str())
                            .unwrap_or("no details")
                    );
                }
                embedder.web_client_initialization_done(report.success, report.exception);
                delegate.web_client_initialized(report.success).await;
                HandlerResult::Ok(None)
            }
        }
    };

    let resize = move |payload: Value, _extras: ResponseExtras| {
        let delegate = Arc::clone(&delegate);
        let embedder = Arc::clone(&embedder);
        async move {
            let request: ResizeRequest = serde_json::from_value(payload)?;
            embedder.on_guest_resize_request(request.size);
            let duration = request.options.duration_ms.map(Duration::from_millis);
            delegate.resize_widget(request.size, duration).await?;
            HandlerResult::Ok(Some(Value::Object(Map::new())))
        }
    };

    HandlerTable::builder()
        .on_reserved(WEB_CLIENT_CREATED, created)
        .on_reserved(WEB_CLIENT_INITIALIZED, initialized)
        .on_reserved(RESIZE_WINDOW, resize)
        .build()
}

/// The host's end of the bridge
pub struct HostEndpoint {
    id: EndpointId,
    sender: RequestSender,
    receiver: RequestReceiver,
    bootstrap: Arc<BootstrapLoop>,
    counts: Arc<RequestCounts>,
}

impl HostEndpoint {
    /// Connect to the guest behind `transport` and start bootstrapping.
    ///
    /// `handlers` answers the guest's business requests. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        guest_origin: &str,
        handlers: HandlerTable,
        delegate: Arc<dyn HostDelegate>,
        embedder: Arc<dyn HostEmbedder>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let id = EndpointId::new();
        let origin = OriginFilter::new(guest_origin)?;
        let table = handlers.layered_over(lifecycle_handlers(delegate, embedder)?);

        let sender = RequestSender::new(
            Arc::clone(&transport),
            origin.clone(),
            id.clone(),
            config.request_timeout,
        );

        let bootstrap = Arc::new(BootstrapLoop::start(
            Arc::clone(&transport),
            id.clone(),
            config.bootstrap_payload.clone(),
            config.bootstrap_interval,
        ));
        let counts = Arc::new(RequestCounts::new());

        let receiver = RequestReceiver::new(
            transport,
            origin,
            Arc::new(HostRequestHandler {
                table,
                bootstrap: Arc::clone(&bootstrap),
                counts: Arc::clone(&counts),
            }),
        );
        receiver.pin_on_request(WEB_CLIENT_CREATED);
        receiver.listen()?;

        log::info!("HostEndpoint {} bootstrapping guest at {}", id, guest_origin);

        Ok(Self {
            id,
            sender,
            receiver,
            bootstrap,
            counts,
        })
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Identity of the current guest session, once it has said hello
    pub fn guest_id(&self) -> Option<EndpointId> {
        self.receiver.pinned_sender()
    }

    pub fn request_counts(&self) -> &RequestCounts {
        &self.counts
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrap.is_running()
    }

    /// The guest document finished loading
    pub fn content_loaded(&self) {
        self.bootstrap.content_loaded();
    }

    /// Broadcast a new value for the named state
    pub fn push_state(&self, name: &str, value: Value) -> Result<()> {
        self.sender.notify(
            STATE_CHANGED,
            &StateChange {
                name: name.to_string(),
                value,
            },
        )
    }

    /// Fire-and-forget call into the guest
    pub fn notify<Req>(&self, request_type: &str, request: &Req) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        self.sender.notify(request_type, request)
    }

    /// Call into the guest. The request is posted immediately; the returned
    /// future resolves with the guest's answer.
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

    /// Raw sender, for calls that carry transfers
    pub fn sender(&self) -> &RequestSender {
        &self.sender
    }

    /// Stop bootstrapping, stop answering, and reject outstanding calls
    pub fn destroy(&self) {
        self.bootstrap.stop();
        self.receiver.destroy();
        self.sender.destroy();
        log::info!("HostEndpoint {} destroyed", self.id);
    }
}

impl Drop for HostEndpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}
