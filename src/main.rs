//! mcudbg
//!
//! Debug backend engine for embedded firmware. Speaks newline-delimited
//! JSON requests on stdin (`{"seq", "command", "arguments"}`), answers with
//! `{"seq", "success", "body" | "message"}` on stdout, and interleaves
//! unsolicited `{"event", "body"}` notifications from the target.

mod adapter;
mod config;
mod disasm;
mod error;
mod helper;
mod mi;
mod scheduler;
mod server;
mod symbols;
mod target;

use crate::adapter::DebugAdapter;
use crate::error::EngineError;
use crate::scheduler::RequestScheduler;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging goes to stderr; stdout is the wire.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("mcudbg starting");
    let adapter = DebugAdapter::new();
    serve(tokio::io::stdin(), tokio::io::stdout(), adapter).await?;
    info!("mcudbg exiting");
    Ok(())
}

/// Request/response loop over a byte stream pair.
async fn serve<R, W>(input: R, output: W, adapter: Arc<DebugAdapter>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let scheduler = RequestScheduler::new(adapter.clone());

    let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });

    let event_tx = out_tx.clone();
    let mut events = adapter.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    // One forwarder settles outcomes in submission order, so responses hit
    // the wire in the order the requests came in even when a cancelled
    // request resolves before an earlier in-flight one.
    type Outcome = oneshot::Receiver<crate::error::Result<Value>>;
    let (reply_tx, mut reply_rx) = mpsc::channel::<(u64, Outcome)>(256);
    let reply_out = out_tx.clone();
    let replies = tokio::spawn(async move {
        while let Some((seq, rx)) = reply_rx.recv().await {
            let outcome = rx.await.unwrap_or(Err(EngineError::SessionStopping));
            let response = match outcome {
                Ok(body) => json!({"seq": seq, "success": true, "body": body}),
                Err(e) => json!({"seq": seq, "success": false, "message": e.to_string()}),
            };
            if reply_out.send(response).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("undecodable request: {}", e);
                continue;
            }
        };
        let Some(command) = request.get("command").and_then(Value::as_str) else {
            warn!("request without command: {}", request);
            continue;
        };
        let seq = request.get("seq").and_then(Value::as_u64).unwrap_or(0);
        let arguments = request.get("arguments").cloned().unwrap_or(json!({}));
        debug!("request {}: {}", seq, command);

        let rx = scheduler.submit(command, arguments);
        if reply_tx.send((seq, rx)).await.is_err() {
            break;
        }
        if scheduler.is_terminal() {
            break;
        }
    }

    // Flush every pending response, then stop forwarding events so the
    // writer can drain.
    drop(reply_tx);
    let _ = replies.await;
    event_task.abort();
    drop(out_tx);
    if let Err(e) = writer.await {
        if !e.is_cancelled() {
            error!("output writer failed: {}", e);
        }
    }
    Ok(())
}
