//! Pool, message channel and subscribe channel against an echo server.
//!
//! Demonstrates:
//! - Building a pool of WebSocket connections with keepalive
//! - Sending through a MessageChannel before the link is up
//! - Batched subscriptions through a SubscribeChannel
//! - Reconnect after the server drops the link
//!
//! A local echo server is started unless `--url` points elsewhere.
//!
//! Usage:
//!   cargo run --example echo
//!   cargo run --example echo -- --debug
//!   cargo run --example echo -- --url ws://127.0.0.1:9001

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use socket_pool::channel::MapFn;
use socket_pool::transport::{
    Connection, Payload, PingOptions, SharedHandler, WebSocketConnection, WebSocketOptions,
};
use socket_pool::{
    Channel, ConnectionPool, MessageChannel, Operation, PoolConfig, PoolStateEvent, Result,
    SharedContext, SubscribeChannel, TokioExecutorContext,
};

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    url: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let url = args
            .iter()
            .position(|a| a == "--url")
            .and_then(|index| args.get(index + 1).cloned());
        Self {
            debug: args.iter().any(|a| a == "--debug"),
            url,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "socket_pool=debug"
    } else {
        "socket_pool=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== Echo ===\n");

    let url = match args.url {
        Some(url) => url,
        None => spawn_echo_server().await?,
    };

    // ========================================================================
    // Build Pool
    // ========================================================================

    println!("[1] Building pool for {url}...");

    let options = WebSocketOptions::new(&url)?
        .with_connect_timeout(Duration::from_secs(5))
        .with_ping(
            PingOptions::new()
                .with_ping_message("ping")
                .with_pong_message("ping")
                .with_ping_after_idle(Duration::from_secs(5))
                .with_pong_received_timeout(Duration::from_secs(3)),
        );
    let context: SharedContext = Arc::new(TokioExecutorContext::current()?);
    let factory_context = Arc::clone(&context);

    let pool = ConnectionPool::builder(Arc::new(move || -> Arc<dyn Connection> {
        Arc::new(WebSocketConnection::new(
            options.clone(),
            Arc::clone(&factory_context),
            Handle::current(),
        ))
    }))
    .config(PoolConfig::new().with_retry_intervals([
        Duration::ZERO,
        Duration::from_millis(500),
        Duration::from_secs(1),
    ]))
    .context(context)
    .build()?;

    pool.add_state_listener(Arc::new(|event: &PoolStateEvent| {
        println!("    [pool] {event:?}");
    }));

    println!("    ✓ Pool ready\n");

    // ========================================================================
    // Message Channel
    // ========================================================================

    println!("[2] Sending through a message channel...");

    let (echo_tx, mut echoes) = mpsc::unbounded_channel();
    let handler: SharedHandler = Arc::new(move |_: u64, message: &Payload| {
        let _ = echo_tx.send(message.clone());
        false
    });

    let messages: MessageChannel<String> = MessageChannel::new(pool.clone(), handler);
    messages.send("hello".to_string());
    messages.send("world".to_string());
    println!("    Cached while connecting: {}", messages.cached_len());

    for _ in 0..2 {
        if let Some(echo) = next_echo(&mut echoes).await {
            println!("    ✓ Echo: {echo:?}");
        }
    }
    println!();

    // ========================================================================
    // Subscribe Channel
    // ========================================================================

    println!("[3] Subscribing in one batch...");

    let (sub_tx, mut sub_echoes) = mpsc::unbounded_channel();
    let sub_handler: SharedHandler = Arc::new(move |_: u64, message: &Payload| {
        let _ = sub_tx.send(message.clone());
        false
    });

    let map: MapFn<String, Value> = Arc::new(|op: Operation, symbol: &String| {
        json!({ "op": op.as_str(), "args": [symbol] })
    });
    let subscriptions = SubscribeChannel::builder(pool.clone(), sub_handler, map)
        .merge(Arc::new(|op: Operation, symbols: &[String]| {
            json!({ "op": op.as_str(), "args": symbols })
        }))
        .merge_duration(Duration::from_millis(50))
        .build();

    subscriptions.add_all(["BTC-USD", "ETH-USD", "SOL-USD"].map(String::from), false);
    subscriptions.remove("SOL-USD".to_string());

    // the first add binds and sends the set; the removal rides the next window
    for _ in 0..2 {
        if let Some(echo) = next_echo(&mut sub_echoes).await {
            println!("    ✓ Request: {echo:?}");
        }
    }
    println!("    Active: {:?}\n", subscriptions.active_items());

    // ========================================================================
    // Reconnect
    // ========================================================================

    println!("[4] Asking the server to drop the link...");

    messages.send("bye".to_string());
    if let Some(echo) = next_echo(&mut sub_echoes).await {
        println!("    ✓ Resubscribed after reconnect: {echo:?}");
    }
    println!("    Metrics: {:?}\n", pool.metrics());

    // ========================================================================
    // Cleanup
    // ========================================================================

    subscriptions.release();
    messages.release();
    pool.release();
    println!("=== Done ===");

    Ok(())
}

async fn next_echo(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Option<Payload> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .ok()
        .flatten()
}

// ============================================================================
// Echo Server
// ============================================================================

/// Serves every client: echoes frames, closes on "bye".
async fn spawn_echo_server() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) if text.as_str() == "bye" => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    Ok(url)
}
