//! MI Transport & Session
//!
//! Owns the debugger child process: frames stdout into lines, parses each
//! through the MI line parser, correlates numbered commands to their
//! callers, and fans out async/stream records as session events.

use crate::error::{EngineError, Result};
use crate::mi::parser;
use crate::mi::types::{MiRecord, MiValue, ResultRecord, StreamKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct GdbSessionConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Commands issued right after the launch probe succeeds.
    pub init_commands: Vec<String>,
    pub launch_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for GdbSessionConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb-multiarch".to_string(),
            gdb_args: vec!["--interpreter=mi2".to_string()],
            cwd: None,
            init_commands: vec![
                "gdb-set mi-async on".to_string(),
                "gdb-set pagination off".to_string(),
                "gdb-set confirm off".to_string(),
            ],
            launch_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Out-of-band records republished to session subscribers, in wire order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// `*` exec-async record.
    Async {
        class: String,
        results: Vec<(String, MiValue)>,
    },
    /// `=` notify-async record.
    Notify {
        class: String,
        results: Vec<(String, MiValue)>,
    },
    Console(String),
    Target(String),
    Log(String),
    Terminated,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<ResultRecord>>>;

/// A live GDB/MI session over a child process pipe.
pub struct GdbSession {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    token: AtomicU64,
    pending: Arc<PendingMap>,
    stopping: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
    command_timeout: Duration,
}

impl GdbSession {
    /// Spawn the debugger and verify it accepts MI input within the launch
    /// timeout. Fails `StartupFailure` otherwise.
    pub async fn start(config: GdbSessionConfig) -> Result<Arc<GdbSession>> {
        info!("starting debugger: {}", config.gdb_path);

        let mut cmd = Command::new(&config.gdb_path);
        cmd.args(&config.gdb_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::StartupFailure {
            what: config.gdb_path.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| EngineError::StartupFailure {
            what: config.gdb_path.clone(),
            reason: "no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::StartupFailure {
            what: config.gdb_path.clone(),
            reason: "no stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::StartupFailure {
            what: config.gdb_path.clone(),
            reason: "no stderr pipe".to_string(),
        })?;

        let (events, _) = broadcast::channel(256);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let stopping = Arc::new(AtomicBool::new(false));

        let session = Arc::new(GdbSession {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            token: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            stopping: Arc::clone(&stopping),
            events: events.clone(),
            command_timeout: config.command_timeout,
        });

        tokio::spawn(read_output_loop(stdout, pending, events.clone(), stopping));
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("gdb stderr: {}", line);
                let _ = events.send(SessionEvent::Log(line));
            }
        });

        // Launch probe: the first command must be acknowledged in time.
        session
            .send_command_timeout("gdb-version", config.launch_timeout)
            .await
            .map_err(|e| EngineError::StartupFailure {
                what: config.gdb_path.clone(),
                reason: e.to_string(),
            })?;

        for init in &config.init_commands {
            session.send_command(init).await?;
        }

        info!("debugger ready");
        Ok(session)
    }

    /// Subscribe to out-of-band session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send an MI command with the default timeout.
    pub async fn send_command(&self, text: &str) -> Result<ResultRecord> {
        self.send_command_timeout(text, self.command_timeout).await
    }

    /// Send an MI command; the matching result record resolves the call.
    ///
    /// A timeout frees the correlation slot; a result arriving afterwards is
    /// treated as orphaned by the reader.
    pub async fn send_command_timeout(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<ResultRecord> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(EngineError::SessionStopping);
        }

        let token = self.token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(token, tx);

        let line = format!("{}-{}\n", token, text);
        debug!("-> {}", line.trim_end());
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&token);
                return Err(e.into());
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().unwrap().remove(&token);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(record)) => Ok(record),
            // Sender dropped: the session is shutting down or the reader died.
            Ok(Err(_)) => Err(EngineError::SessionStopping),
            Err(_) => {
                self.pending.lock().unwrap().remove(&token);
                Err(EngineError::CommandTimeout {
                    token,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Send an MI command and turn an `^error` result into a failure.
    pub async fn command_ok(&self, text: &str) -> Result<ResultRecord> {
        let record = self.send_command(text).await?;
        if record.is_error() {
            let msg = record.error_msg().unwrap_or("unknown error").to_string();
            return Err(EngineError::CommandFailed(msg));
        }
        Ok(record)
    }

    /// Run a CLI command through `interpreter-exec console` and collect the
    /// console stream output it produces.
    pub async fn execute_console(&self, cli: &str) -> Result<String> {
        let escaped = cli.replace('\\', "\\\\").replace('"', "\\\"");
        let mut rx = self.events.subscribe();
        let command = format!("interpreter-exec console \"{}\"", escaped);
        let fut = self.command_ok(&command);
        tokio::pin!(fut);

        let mut out = String::new();
        loop {
            tokio::select! {
                res = &mut fut => {
                    res?;
                    break;
                }
                ev = rx.recv() => {
                    if let Ok(SessionEvent::Console(text)) = ev {
                        out.push_str(&text);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Number of commands still awaiting a result. Empty after `stop()`.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Reject all pending commands, attempt a graceful exit, escalate to a
    /// forced kill after 500 ms. Resolves once the process is gone by any
    /// means; never blocks indefinitely.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Dropping the senders rejects every waiting caller with SessionStopping.
        self.pending.lock().unwrap().clear();

        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_all(b"-gdb-exit\n").await;
            let _ = stdin.flush().await;
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("debugger did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        *guard = None;
        let _ = self.events.send(SessionEvent::Terminated);
        info!("debugger stopped");
    }
}

async fn read_output_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<SessionEvent>,
    stopping: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("<- {}", line);
        match parser::parse_line(&line) {
            Some(MiRecord::Result {
                token,
                class,
                results,
            }) => match token {
                Some(tok) => {
                    let sender = pending.lock().unwrap().remove(&tok);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(ResultRecord { class, results });
                        }
                        // Caller timed out or never existed.
                        None => warn!("orphaned result record for token {}", tok),
                    }
                }
                None => debug!("untokenized result record dropped"),
            },
            Some(MiRecord::ExecAsync { class, results, .. }) => {
                let _ = events.send(SessionEvent::Async { class, results });
            }
            Some(MiRecord::Notify { class, results }) => {
                let _ = events.send(SessionEvent::Notify { class, results });
            }
            Some(MiRecord::Stream { kind, text }) => {
                let ev = match kind {
                    StreamKind::Console => SessionEvent::Console(text),
                    StreamKind::Target => SessionEvent::Target(text),
                    StreamKind::Log => SessionEvent::Log(text),
                };
                let _ = events.send(ev);
            }
            // Prompt, blank, or malformed: keep streaming.
            None => {}
        }
    }

    // EOF: the debugger is gone. Reject anything still waiting.
    stopping.store(true, Ordering::SeqCst);
    pending.lock().unwrap().clear();
    let _ = events.send(SessionEvent::Terminated);
    debug!("debugger output reader stopped");
}
