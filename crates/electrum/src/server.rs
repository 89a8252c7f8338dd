//! The TCP server: one reader and one writer task per connection, with a
//! bounded event channel carrying subscription notifications from the
//! engine into the connection's writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use faro_log::{log_debug, log_info, log_warn};
use faro_sync::{ChainSource, ConnectionId, Engine, Notification};

use crate::handlers::{self, display_order, RpcError};

const RESPONSE_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Binds `addr` and accepts connections until `shutdown` flips to true.
pub async fn serve<S: ChainSource + 'static>(
    addr: &str,
    engine: Arc<Engine<S>>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, engine, shutdown).await
}

/// Accepts connections on an already-bound listener.
pub async fn serve_listener<S: ChainSource + 'static>(
    listener: TcpListener,
    engine: Arc<Engine<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(local) = listener.local_addr() {
        log_info!("electrum server listening on {local}");
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    log_debug!("connection {id} from {peer}");
                    if let Err(err) = handle_connection(id, stream, &engine).await {
                        log_debug!("connection {id} ended: {err}");
                    }
                    engine.unsubscribe_all(id).await;
                    log_debug!("connection {id} closed");
                });
            }
        }
    }
}

async fn handle_connection<S: ChainSource>(
    id: ConnectionId,
    stream: TcpStream,
    engine: &Engine<S>,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<String>(RESPONSE_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel::<Notification>(EVENT_QUEUE_DEPTH);

    let writer = tokio::spawn(run_writer(write_half, out_rx));
    let events = tokio::spawn(run_events(event_rx, out_tx.clone()));

    let mut lines = BufReader::new(read_half).lines();
    let result = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(id, engine, &event_tx, &line).await;
                if out_tx.send(response).await.is_err() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    drop(out_tx);
    events.abort();
    let _ = writer.await;
    result
}

async fn handle_line<S: ChainSource>(
    id: ConnectionId,
    engine: &Engine<S>,
    events: &mpsc::Sender<Notification>,
    line: &str,
) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            log_debug!("connection {id}: unparseable request: {err}");
            return error_line(Value::Null, -32700, "parse error");
        }
    };
    log_debug!("connection {id} ==> {}", request.method);
    match handlers::dispatch(id, engine, events, &request.method, &request.params).await {
        Ok(result) => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "result": result,
            });
            response.to_string()
        }
        Err(err) => {
            if let RpcError::Internal(ref message) = err {
                log_warn!("connection {id}: {} failed: {message}", request.method);
            }
            error_line(request.id, err.code(), &err.message())
        }
    }
}

fn error_line(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::Receiver<String>) {
    while let Some(mut line) = out_rx.recv().await {
        line.push('\n');
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn run_events(mut event_rx: mpsc::Receiver<Notification>, out_tx: mpsc::Sender<String>) {
    while let Some(notification) = event_rx.recv().await {
        if out_tx.send(notification_line(&notification)).await.is_err() {
            break;
        }
    }
}

fn notification_line(notification: &Notification) -> String {
    match notification {
        Notification::NewHeader { height, header } => json!({
            "jsonrpc": "2.0",
            "method": "blockchain.headers.subscribe",
            "params": [{ "height": height, "hex": hex::encode(header) }],
        })
        .to_string(),
        Notification::ScriptStatus {
            script_hash,
            status,
        } => {
            let status = match status {
                Some(status) => json!(hex::encode(status)),
                None => Value::Null,
            };
            json!({
                "jsonrpc": "2.0",
                "method": "blockchain.scripthash.subscribe",
                "params": [hex::encode(display_order(script_hash)), status],
            })
            .to_string()
        }
    }
}
