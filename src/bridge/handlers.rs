//! Handler registration and dispatch seam

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::envelope::{ErrorEnvelope, is_reserved};
use crate::transport::{Buffer, TransferList};
use crate::utils::{BridgeError, Result};

/// `Ok(Some(_))` answers the caller, `Ok(None)` sends nothing back
pub type HandlerResult = std::result::Result<Option<Value>, HandlerError>;

pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A registered request handler
pub type Handler = Arc<dyn Fn(Value, ResponseExtras) -> HandlerFuture + Send + Sync>;

/// Failure raised by a handler, marshaled back to the caller as an error envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    kind: String,
    message: String,
    reason_code: Option<i64>,
}

impl HandlerError {
    /// Plain error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind("Error", message)
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            reason_code: None,
        }
    }

    /// Error carrying a numeric reason the caller can branch on
    pub fn with_reason(message: impl Into<String>, reason_code: i64) -> Self {
        Self {
            kind: "ErrorWithReason".to_string(),
            message: message.into(),
            reason_code: Some(reason_code),
        }
    }

    pub(crate) fn panicked(message: impl Into<String>) -> Self {
        Self::with_kind("Panic", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn reason_code(&self) -> Option<i64> {
        self.reason_code
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: self.kind.clone(),
            message: self.message.clone(),
            reason_code: self.reason_code,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_kind("InvalidPayload", err.to_string())
    }
}

impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Remote(remote) => Self {
                kind: remote.kind,
                message: remote.message,
                reason_code: remote.reason_code,
            },
            other => Self::new(other.to_string()),
        }
    }
}

impl From<HandlerError> for ErrorEnvelope {
    fn from(err: HandlerError) -> Self {
        ErrorEnvelope {
            kind: err.kind,
            message: err.message,
            reason_code: err.reason_code,
        }
    }
}

/// Lets a handler mark buffers in its response as transferable
#[derive(Debug, Clone, Default)]
pub struct ResponseExtras {
    transfers: Arc<Mutex<TransferList>>,
}

impl ResponseExtras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transfer(&self, buffer: Buffer) {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn take_transfers(&self) -> TransferList {
        std::mem::take(&mut *self.transfers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Dispatch target of a request receiver
pub trait RequestHandler: Send + Sync {
    /// Start handling a request. `None` means the type is unknown.
    ///
    /// Called synchronously, in arrival order; the returned future is driven
    /// separately.
    fn handle_request(
        &self,
        request_type: &str,
        payload: Value,
        extras: ResponseExtras,
    ) -> Option<HandlerFuture>;

    fn on_request_received(&self, _request_type: &str) {}

    fn on_request_handler_exception(&self, _request_type: &str) {}

    fn on_request_completed(&self, _request_type: &str) {}
}

/// Immutable map from request type to handler
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<HashMap<String, Handler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// A table with no handlers
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, request_type: &str) -> bool {
        self.handlers.contains_key(request_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn request_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Combine the bridge's own handlers with a business table.
    ///
    /// Business tables cannot hold reserved names, so the two never collide.
    pub(crate) fn layered_over(self, reserved: HandlerTable) -> HandlerTable {
        let mut handlers: HashMap<String, Handler> = (*reserved.handlers).clone();
        for (name, handler) in self.handlers.iter() {
            handlers.entry(name.clone()).or_insert_with(|| Arc::clone(handler));
        }
        HandlerTable {
            handlers: Arc::new(handlers),
        }
    }

    /// Invoke the handler for `request_type`, if any
    pub fn invoke(&self, request_type: &str, payload: Value, extras: ResponseExtras) -> Option<HandlerFuture> {
        self.handlers.get(request_type).map(|handler| handler(payload, extras))
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.request_types().collect();
        names.sort_unstable();
        f.debug_struct("HandlerTable").field("request_types", &names).finish()
    }
}

impl RequestHandler for HandlerTable {
    fn handle_request(
        &self,
        request_type: &str,
        payload: Value,
        extras: ResponseExtras,
    ) -> Option<HandlerFuture> {
        self.invoke(request_type, payload, extras)
    }
}

/// Collects handlers; registration errors surface from `build`
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<String, Handler>,
    error: Option<BridgeError>,
}

impl HandlerTableBuilder {
    /// Register a raw JSON handler
    pub fn on<F, Fut>(self, request_type: &str, handler: F) -> Self
    where
        F: Fn(Value, ResponseExtras) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(request_type, raw_handler(handler), false)
    }

    /// Register a typed request/response handler
    pub fn on_call<Req, Resp, F, Fut>(self, request_type: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, ResponseExtras) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        self.insert(request_type, typed_handler(handler), false)
    }

    /// Register a typed handler that never answers
    pub fn on_notification<Req, F, Fut>(self, request_type: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let wrapped = move |payload: Value, _extras: ResponseExtras| -> HandlerFuture {
            match serde_json::from_value::<Req>(payload) {
                Ok(request) => handler(request).map(|r| r.map(|()| None)).boxed(),
                Err(e) => future::ready(Err(HandlerError::from(e))).boxed(),
            }
        };
        self.insert(request_type, Arc::new(wrapped), false)
    }

    /// Register a handler under one of the bridge's own request types
    pub(crate) fn on_reserved<F, Fut>(self, request_type: &str, handler: F) -> Self
    where
        F: Fn(Value, ResponseExtras) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(request_type, raw_handler(handler), true)
    }

    pub fn build(self) -> Result<HandlerTable> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(HandlerTable {
                handlers: Arc::new(self.handlers),
            }),
        }
    }

    fn insert(mut self, request_type: &str, handler: Handler, allow_reserved: bool) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !allow_reserved && is_reserved(request_type) {
            self.error = Some(BridgeError::ReservedRequestType(request_type.to_string()));
        } else if self.handlers.contains_key(request_type) {
            self.error = Some(BridgeError::DuplicateHandler(request_type.to_string()));
        } else {
            self.handlers.insert(request_type.to_string(), handler);
        }
        self
    }
}

fn raw_handler<F, Fut>(handler: F) -> Handler
where
    F: Fn(Value, ResponseExtras) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |payload, extras| handler(payload, extras).boxed())
}

fn typed_handler<Req, Resp, F, Fut>(handler: F) -> Handler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req, ResponseExtras) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
{
    Arc::new(move |payload, extras| match serde_json::from_value::<Req>(payload) {
        Ok(request) => {
            let response = handler(request, extras);
            async move {
                let response = response.await?;
                let value = serde_json::to_value(response)?;
                HandlerResult::Ok(Some(value))
            }
            .boxed()
        }
        Err(e) => future::ready(Err(HandlerError::from(e))).boxed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::envelope::STATE_CHANGED;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_raw_handler_invocation() {
        let table = HandlerTable::builder()
            .on("echo", |payload, _extras| async move { Ok(Some(payload)) })
            .build()
            .unwrap();

        let fut = table.invoke("echo", json!({"msg": "hi"}), ResponseExtras::new()).unwrap();
        assert_eq!(fut.await.unwrap(), Some(json!({"msg": "hi"})));
        assert!(table.invoke("missing", Value::Null, ResponseExtras::new()).is_none());
    }

    #[tokio::test]
    async fn test_typed_call_handler() {
        let table = HandlerTable::builder()
            .on_call("add", |req: Add, _extras| async move { Ok(req.a + req.b) })
            .build()
            .unwrap();

        let result = table
            .invoke("add", json!({"a": 2, "b": 3}), ResponseExtras::new())
            .unwrap()
            .await;
        assert_eq!(result.unwrap(), Some(json!(5)));

        let bad = table
            .invoke("add", json!({"a": "x"}), ResponseExtras::new())
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(bad.kind(), "InvalidPayload");
    }

    #[tokio::test]
    async fn test_notification_handler_returns_nothing() {
        let table = HandlerTable::builder()
            .on_notification("ping", |_: ()| async { Ok(()) })
            .build()
            .unwrap();
        let result = table.invoke("ping", Value::Null, ResponseExtras::new()).unwrap().await;
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let err = HandlerTable::builder()
            .on(STATE_CHANGED, |_, _| async { Ok(None) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BridgeError::ReservedRequestType(name) if name == STATE_CHANGED));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = HandlerTable::builder()
            .on("echo", |_, _| async { Ok(None) })
            .on("echo", |_, _| async { Ok(None) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateHandler(_)));
    }

    #[test]
    fn test_layered_table_keeps_both() {
        let reserved = HandlerTable::builder()
            .on_reserved(STATE_CHANGED, |_, _| async { Ok(None) })
            .build()
            .unwrap();
        let business = HandlerTable::builder()
            .on("echo", |payload, _| async move { Ok(Some(payload)) })
            .build()
            .unwrap();
        let layered = business.layered_over(reserved);
        assert_eq!(layered.len(), 2);
        assert!(layered.contains(STATE_CHANGED));
        assert!(layered.contains("echo"));
    }

    #[test]
    fn test_response_extras_collects_transfers() {
        let extras = ResponseExtras::new();
        let clone = extras.clone();
        clone.add_transfer(Buffer::from(vec![1u8, 2, 3]));
        assert_eq!(extras.transfer_count(), 1);
        assert_eq!(extras.take_transfers().total_bytes(), 3);
        assert_eq!(extras.transfer_count(), 0);
    }

    #[test]
    fn test_handler_error_from_remote() {
        let remote = crate::utils::RemoteError {
            kind: "ErrorWithReason".to_string(),
            message: "tabContext".to_string(),
            reason_code: Some(1),
        };
        let err = HandlerError::from(BridgeError::Remote(remote));
        assert_eq!(err.reason_code(), Some(1));
        assert_eq!(err.to_envelope().message, "tabContext");
    }
}
