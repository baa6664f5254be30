//! Sequential request scheduler
//!
//! Front-end requests are executed strictly one at a time: the debugger
//! cannot answer an inspection issued while the target is being resumed.
//! A resume-class request makes queued-but-undispatched work meaningless,
//! so it cancels the queue; exit-class requests jump the queue and put the
//! scheduler into a terminal state.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Safe to queue behind anything.
    Inspection,
    /// Invalidates queued inspections: the target is about to run.
    Resume,
    /// Ends the session; bypasses the queue.
    Exit,
}

pub fn classify(command: &str) -> RequestClass {
    match command {
        "continue" | "next" | "step" | "stepIn" | "stepOut" | "goto" | "reverseContinue" => {
            RequestClass::Resume
        }
        "disconnect" | "terminate" => RequestClass::Exit,
        _ => RequestClass::Inspection,
    }
}

/// Executes one request at a time on behalf of the scheduler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, command: &str, arguments: Value) -> Result<Value>;
}

struct Entry {
    command: String,
    arguments: Value,
    reply: oneshot::Sender<Result<Value>>,
}

struct Inner {
    queue: Mutex<VecDeque<Entry>>,
    notify: Notify,
    terminal: AtomicBool,
    handler: Arc<dyn RequestHandler>,
}

#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl RequestScheduler {
    pub fn new(handler: Arc<dyn RequestHandler>) -> RequestScheduler {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            terminal: AtomicBool::new(false),
            handler,
        });
        tokio::spawn(run(Arc::clone(&inner)));
        RequestScheduler { inner }
    }

    /// Enqueue a request; the receiver resolves when it has been executed,
    /// cancelled, or rejected.
    pub fn submit(&self, command: &str, arguments: Value) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let class = classify(command);

        if self.inner.terminal.load(Ordering::SeqCst) && class != RequestClass::Exit {
            let _ = tx.send(Err(EngineError::SessionStopping));
            return rx;
        }

        let entry = Entry {
            command: command.to_string(),
            arguments,
            reply: tx,
        };
        {
            let mut queue = self.inner.queue.lock().unwrap();
            match class {
                RequestClass::Inspection => queue.push_back(entry),
                RequestClass::Resume => {
                    // Whatever was queued would observe a running target.
                    let cancelled = queue.len();
                    for stale in queue.drain(..) {
                        let _ = stale.reply.send(Err(EngineError::Cancelled));
                    }
                    if cancelled > 0 {
                        debug!("{} queued requests cancelled by {}", cancelled, command);
                    }
                    queue.push_back(entry);
                }
                RequestClass::Exit => {
                    self.inner.terminal.store(true, Ordering::SeqCst);
                    for stale in queue.drain(..) {
                        let _ = stale.reply.send(Err(EngineError::SessionStopping));
                    }
                    queue.push_front(entry);
                }
            }
        }
        self.inner.notify.notify_one();
        rx
    }

    /// `submit` and await the outcome.
    pub async fn execute(&self, command: &str, arguments: Value) -> Result<Value> {
        self.submit(command, arguments)
            .await
            .unwrap_or(Err(EngineError::SessionStopping))
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.terminal.load(Ordering::SeqCst)
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        let entry = {
            let popped = inner.queue.lock().unwrap().pop_front();
            match popped {
                Some(e) => e,
                None => {
                    inner.notify.notified().await;
                    continue;
                }
            }
        };
        // Exactly one request is in flight from here until the send.
        let result = inner.handler.handle(&entry.command, entry.arguments).await;
        let _ = entry.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Handler that blocks until released, counting concurrent entries.
    struct GatedHandler {
        gate: Notify,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RequestHandler for GatedHandler {
        async fn handle(&self, command: &str, _arguments: Value) -> Result<Value> {
            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);
            self.gate.notified().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "command": command }))
        }
    }

    #[tokio::test]
    async fn resume_cancels_queued_but_not_in_flight() {
        let handler = GatedHandler::new();
        let scheduler = RequestScheduler::new(handler.clone());

        let first = scheduler.submit("evaluate", json!({}));
        // Let the first request reach the handler.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued: Vec<_> = (0..3)
            .map(|_| scheduler.submit("variables", json!({})))
            .collect();
        let resume = scheduler.submit("continue", json!({}));

        for rx in queued {
            let outcome = rx.await.unwrap();
            assert!(matches!(outcome, Err(EngineError::Cancelled)));
        }

        // Release the in-flight request, then the resume.
        handler.gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome["command"], "evaluate");
        handler.gate.notify_one();
        let outcome = resume.await.unwrap().unwrap();
        assert_eq!(outcome["command"], "continue");
    }

    #[tokio::test]
    async fn only_one_request_in_flight() {
        let handler = GatedHandler::new();
        let scheduler = RequestScheduler::new(handler.clone());

        let receivers: Vec<_> = (0..5)
            .map(|_| scheduler.submit("threads", json!({})))
            .collect();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handler.gate.notify_one();
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exit_is_terminal_and_jumps_the_queue() {
        let handler = GatedHandler::new();
        let scheduler = RequestScheduler::new(handler.clone());

        let first = scheduler.submit("evaluate", json!({}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = scheduler.submit("variables", json!({}));
        let exit = scheduler.submit("disconnect", json!({}));

        assert!(scheduler.is_terminal());
        let outcome = stale.await.unwrap();
        assert!(matches!(outcome, Err(EngineError::SessionStopping)));

        // Anything after the exit is rejected outright.
        let late = scheduler.submit("evaluate", json!({}));
        assert!(matches!(late.await.unwrap(), Err(EngineError::SessionStopping)));

        handler.gate.notify_one();
        first.await.unwrap().unwrap();
        handler.gate.notify_one();
        let outcome = exit.await.unwrap().unwrap();
        assert_eq!(outcome["command"], "disconnect");
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify("continue"), RequestClass::Resume);
        assert_eq!(classify("stepIn"), RequestClass::Resume);
        assert_eq!(classify("goto"), RequestClass::Resume);
        assert_eq!(classify("disconnect"), RequestClass::Exit);
        assert_eq!(classify("terminate"), RequestClass::Exit);
        assert_eq!(classify("evaluate"), RequestClass::Inspection);
        assert_eq!(classify("disassemble"), RequestClass::Inspection);
    }
}
