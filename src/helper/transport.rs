//! Helper process transport
//!
//! The engine delegates heavyweight analysis (disassembly windows, address
//! resolution) to a helper process speaking length-prefixed JSON. Requests
//! carry a sequence number and resolve through a pending map; unsolicited
//! messages are events keyed by `kind`. Two of those kinds are readiness
//! signals other components block on.

use crate::error::{EngineError, Result};
use crate::helper::frame::{encode_frame, FrameDecoder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Unsolicited helper messages, republished to subscribers.
#[derive(Debug, Clone)]
pub enum HelperEvent {
    /// Program output captured by the helper (RTT, semihosting).
    Output(String),
    Log(String),
    Error(String),
    Progress(Value),
    AddressFound(Value),
    Other { kind: String, body: Value },
}

#[derive(Debug)]
struct HelperResponse {
    success: bool,
    body: Value,
    message: Option<String>,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<HelperResponse>>>;

pub struct HelperTransport {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    seq: AtomicU64,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<HelperEvent>,
    symbols_ready: watch::Receiver<bool>,
    disasm_ready: watch::Receiver<bool>,
    child: tokio::sync::Mutex<Option<Child>>,
    request_timeout: Duration,
}

impl HelperTransport {
    /// Spawn the helper executable and attach to its stdio.
    pub fn spawn(path: &PathBuf, args: &[String]) -> Result<Arc<HelperTransport>> {
        info!("starting helper: {}", path.display());
        let mut child = tokio::process::Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::StartupFailure {
                what: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| EngineError::StartupFailure {
            what: path.display().to_string(),
            reason: "no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::StartupFailure {
            what: path.display().to_string(),
            reason: "no stdout pipe".to_string(),
        })?;
        let transport = Self::from_streams(stdout, stdin);
        *transport.child.try_lock().map_err(|_| EngineError::StartupFailure {
            what: path.display().to_string(),
            reason: "transport busy at startup".to_string(),
        })? = Some(child);
        Ok(transport)
    }

    /// Build a transport over arbitrary byte streams. Used directly in tests
    /// via `tokio::io::duplex`.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Arc<HelperTransport>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(256);
        let (symbols_tx, symbols_ready) = watch::channel(false);
        let (disasm_tx, disasm_ready) = watch::channel(false);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));

        let transport = Arc::new(HelperTransport {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            seq: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            events: events.clone(),
            symbols_ready,
            disasm_ready,
            child: tokio::sync::Mutex::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        });

        tokio::spawn(read_loop(reader, pending, events, symbols_tx, disasm_tx));
        transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HelperEvent> {
        self.events.subscribe()
    }

    /// Send a request and await its correlated response.
    pub async fn request(&self, command: &str, arguments: Value) -> Result<Value> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);

        let payload = serde_json::to_vec(&json!({
            "seq": seq,
            "command": command,
            "arguments": arguments,
        }))
        .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;

        {
            let mut writer = self.writer.lock().await;
            let res = writer.write_all(&encode_frame(&payload)).await;
            let res = match res {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                self.pending.lock().unwrap().remove(&seq);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.body)
                } else {
                    Err(EngineError::CommandFailed(
                        response.message.unwrap_or_else(|| command.to_string()),
                    ))
                }
            }
            Ok(Err(_)) => Err(EngineError::SessionStopping),
            Err(_) => {
                self.pending.lock().unwrap().remove(&seq);
                Err(EngineError::RequestTimeout {
                    seq,
                    secs: self.request_timeout.as_secs(),
                })
            }
        }
    }

    /// Resolves once the helper has announced its symbol table.
    pub async fn await_symbol_table(&self) {
        let mut rx = self.symbols_ready.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves once the helper can serve disassembly windows.
    pub async fn await_disassembly(&self) {
        let mut rx = self.disasm_ready.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Kill the helper and reject everything in flight. Idempotent.
    pub async fn dispose(&self) {
        self.pending.lock().unwrap().clear();
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.kill().await;
        }
        *guard = None;
        info!("helper disposed");
    }
}

#[async_trait::async_trait]
impl crate::disasm::InstructionSource for HelperTransport {
    async fn fetch_window(
        &self,
        request: crate::disasm::WindowRequest,
    ) -> Result<crate::disasm::WindowResponse> {
        let arguments = serde_json::to_value(&request)
            .map_err(|e| EngineError::ProtocolViolation(e.to_string()))?;
        let body = self.request("disassemble", arguments).await?;
        serde_json::from_value(body)
            .map_err(|e| EngineError::ProtocolViolation(format!("bad window response: {}", e)))
    }
}

async fn read_loop<R: AsyncRead + Send + Unpin>(
    mut reader: R,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<HelperEvent>,
    symbols_tx: watch::Sender<bool>,
    disasm_tx: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let batch = decoder.drain_batch();
        if batch.is_empty() {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    decoder.push(&chunk[..n]);
                    continue;
                }
            }
        }
        for frame in batch {
            handle_frame(&frame, &pending, &events, &symbols_tx, &disasm_tx);
        }
        // Don't starve the runtime when the helper floods us.
        if decoder.has_more() {
            tokio::task::yield_now().await;
        }
    }
    pending.lock().unwrap().clear();
    debug!("helper reader stopped");
}

fn handle_frame(
    frame: &[u8],
    pending: &PendingMap,
    events: &broadcast::Sender<HelperEvent>,
    symbols_tx: &watch::Sender<bool>,
    disasm_tx: &watch::Sender<bool>,
) {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => {
            warn!("undecodable helper frame: {}", e);
            return;
        }
    };

    if let Some(seq) = value.get("seq").and_then(Value::as_u64) {
        let response = HelperResponse {
            success: value.get("success").and_then(Value::as_bool).unwrap_or(false),
            body: value.get("body").cloned().unwrap_or(Value::Null),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        match pending.lock().unwrap().remove(&seq) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => warn!("helper response for unknown seq {}", seq),
        }
        return;
    }

    let Some(kind) = value.get("kind").and_then(Value::as_str) else {
        warn!("helper message with neither seq nor kind: {}", value);
        return;
    };
    let body = value.get("body").cloned().unwrap_or(Value::Null);
    let text = || body.as_str().unwrap_or_default().to_string();
    let event = match kind {
        "symbol-table-ready" => {
            let _ = symbols_tx.send(true);
            return;
        }
        "disassembly-ready" => {
            let _ = disasm_tx.send(true);
            return;
        }
        "output" => HelperEvent::Output(text()),
        "log" => HelperEvent::Log(text()),
        "error" => HelperEvent::Error(text()),
        "progress" => HelperEvent::Progress(body),
        "address-found" => HelperEvent::AddressFound(body),
        other => {
            warn!("unrecognized helper event kind {:?}", other);
            HelperEvent::Other {
                kind: other.to_string(),
                body,
            }
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A scripted helper on the far side of a duplex pipe.
    async fn fake_helper(
        mut stream: tokio::io::DuplexStream,
        respond: impl Fn(&Value) -> Option<Value> + Send + 'static,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 1024];
        loop {
            let Ok(n) = stream.read(&mut chunk).await else {
                break;
            };
            if n == 0 {
                break;
            }
            decoder.push(&chunk[..n]);
            while let Some(frame) = decoder.next_frame() {
                let request: Value = serde_json::from_slice(&frame).unwrap();
                if let Some(reply) = respond(&request) {
                    let bytes = encode_frame(&serde_json::to_vec(&reply).unwrap());
                    stream.write_all(&bytes).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn request_resolves_with_matching_seq() {
        let (near, far) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(near);
        let transport = HelperTransport::from_streams(read_half, write_half);
        tokio::spawn(fake_helper(far, |req| {
            Some(json!({
                "seq": req["seq"],
                "success": true,
                "body": {"echo": req["command"]},
            }))
        }));

        let body = transport.request("ping", json!({})).await.unwrap();
        assert_eq!(body["echo"], "ping");
    }

    #[tokio::test]
    async fn failed_response_maps_to_command_failed() {
        let (near, far) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(near);
        let transport = HelperTransport::from_streams(read_half, write_half);
        tokio::spawn(fake_helper(far, |req| {
            Some(json!({
                "seq": req["seq"],
                "success": false,
                "message": "no such address",
            }))
        }));

        let err = transport.request("resolve", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed(msg) if msg == "no such address"));
    }

    #[tokio::test]
    async fn events_reach_subscribers_and_readiness_flips() {
        let (near, mut far) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(near);
        let transport = HelperTransport::from_streams(read_half, write_half);
        let mut rx = transport.subscribe();

        for msg in [
            json!({"kind": "output", "body": "hello from target\n"}),
            json!({"kind": "symbol-table-ready"}),
            json!({"kind": "disassembly-ready"}),
        ] {
            let bytes = encode_frame(&serde_json::to_vec(&msg).unwrap());
            far.write_all(&bytes).await.unwrap();
        }

        transport.await_symbol_table().await;
        transport.await_disassembly().await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HelperEvent::Output(text) if text.contains("hello")));
    }

    #[tokio::test]
    async fn unknown_seq_does_not_disturb_later_requests() {
        let (near, far) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(near);
        let transport = HelperTransport::from_streams(read_half, write_half);
        tokio::spawn(fake_helper(far, |req| {
            if req["command"] == "first" {
                // Reply to a seq nobody asked for, then the real one.
                Some(json!({"seq": 9999, "success": true}))
            } else {
                Some(json!({"seq": req["seq"], "success": true, "body": "ok"}))
            }
        }));

        // The stray reply is logged and dropped; this request times out only
        // if correlation broke, so keep it short and follow with a good one.
        let _ = tokio::time::timeout(
            Duration::from_millis(100),
            transport.request("first", json!({})),
        )
        .await;
        let body = transport.request("second", json!({})).await.unwrap();
        assert_eq!(body, "ok");
    }
}
