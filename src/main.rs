//! guestlink - Host/Guest RPC Bridge
//!
//! Demo binary: runs a host and a guest in one process over an in-memory
//! transport and walks through the handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guestlink::bridge::GuestSize;
use guestlink::host::RequestEvent;
use guestlink::{
    BridgeConfig, GuestEndpoint, HandlerError, HandlerTable, HostDelegate, HostEmbedder, HostEndpoint,
    MemoryTransport, NAME, VERSION, WebClient,
};
use serde_json::{Map, Value, json};

const HOST_ORIGIN: &str = "chrome://panel";
const GUEST_ORIGIN: &str = "https://guest.example.com";

struct DemoDelegate;

#[async_trait]
impl HostDelegate for DemoDelegate {
    async fn web_client_created(&self) -> Result<Map<String, Value>, HandlerError> {
        let mut state = Map::new();
        state.insert("panelState".to_string(), json!({"kind": "hidden"}));
        state.insert("focusedTab".to_string(), json!({"title": "New Tab"}));
        Ok(state)
    }
}

struct LoggingEmbedder;

impl HostEmbedder for LoggingEmbedder {
    fn on_guest_resize_request(&self, size: GuestSize) {
        log::info!("embedder: guest wants {}x{}", size.width, size.height);
    }

    fn web_client_initialization_done(&self, success: bool, exception: Option<guestlink::bridge::ErrorEnvelope>) {
        match exception {
            Some(e) => log::warn!("embedder: client initialization failed: {}", e.message),
            None => log::info!("embedder: client initialized (success={})", success),
        }
    }

    fn web_client_ready(&self) {
        log::info!("embedder: client ready");
    }
}

struct DemoClient;

#[async_trait]
impl WebClient for DemoClient {
    async fn initialize(&self, endpoint: &GuestEndpoint) -> Result<(), HandlerError> {
        let reply: String = endpoint.request("echo", "hello from the guest").await?;
        println!("   • host echoed: {}", reply);
        endpoint
            .request_resize(GuestSize { width: 400, height: 600 }, Some(Duration::from_millis(100)))
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    println!("🚀 {} v{} - Host/Guest RPC Bridge demo", NAME, VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if let Err(e) = run().await {
        eprintln!("❌ Demo failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> guestlink::Result<()> {
    let config = BridgeConfig::from_env().with_bootstrap_payload(json!({"apiSource": "client.js"}));
    let (host_side, guest_side) = MemoryTransport::pair(HOST_ORIGIN, GUEST_ORIGIN);

    let host_handlers = HandlerTable::builder()
        .on_call("echo", |message: String, _extras| async move { Ok(message) })
        .build()?;
    let host = HostEndpoint::new(
        Arc::new(host_side),
        GUEST_ORIGIN,
        host_handlers,
        Arc::new(DemoDelegate),
        Arc::new(LoggingEmbedder),
        config.clone(),
    )?;
    println!("✅ Host {} bootstrapping", host.id());

    let guest = GuestEndpoint::new(Arc::new(guest_side), HOST_ORIGIN, HandlerTable::empty(), &config)?;
    while !guest.bootstrap_payload().has_value() {
        tokio::time::sleep(config.bootstrap_interval).await;
    }
    println!("✅ Guest saw bootstrap: {:?}", guest.bootstrap_payload().value());

    guest.observe("panelState").subscribe(|value| {
        println!("   • panelState = {}", value);
    });

    let initialized = guest.register_web_client(&DemoClient).await?;
    println!("✅ Client initialized: {}", initialized);

    host.push_state("panelState", json!({"kind": "floating"}))?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    println!("📊 Requests handled by the host:");
    for (request_type, stats) in host.request_counts().snapshot() {
        println!(
            "   • {}: received {}, answered {}, failed {}",
            request_type, stats.received, stats.response_sent, stats.handler_exception
        );
    }
    println!(
        "   • total received: {}",
        host.request_counts().total(RequestEvent::Received)
    );

    guest.destroy();
    host.destroy();
    Ok(())
}
