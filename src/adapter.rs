//! Debug adapter
//!
//! Implements the front-end command set on top of the MI session, the
//! symbol engine, the helper transport and the server orchestrator. All
//! commands arrive through the sequential scheduler, so state access here
//! never races with another request.

use crate::config::LaunchConfig;
use crate::disasm::DisassemblyAdapter;
use crate::error::{EngineError, Result};
use crate::helper::{HelperEvent, HelperTransport};
use crate::mi::types::find;
use crate::mi::{GdbSession, SessionEvent};
use crate::scheduler::RequestHandler;
use crate::server::ports::PortAllocator;
use crate::server::GdbServer;
use crate::symbols::SymbolStore;
use crate::target::TargetInfo;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Default)]
struct AdapterState {
    session: Option<Arc<GdbSession>>,
    server: Option<GdbServer>,
    symbols: Option<SymbolStore>,
    target: TargetInfo,
    disasm: Option<DisassemblyAdapter>,
    helper: Option<Arc<HelperTransport>>,
    /// Live watch id -> MI variable object name.
    watches: HashMap<String, String>,
}

pub struct DebugAdapter {
    state: Mutex<AdapterState>,
    /// Session and helper activity republished to the front end.
    events: broadcast::Sender<Value>,
}

fn parse_address(value: Option<&Value>) -> Result<u64> {
    let value = value.ok_or_else(|| {
        EngineError::ProtocolViolation("missing memory reference".to_string())
    })?;
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let s = value.as_str().ok_or_else(|| {
        EngineError::ProtocolViolation(format!("bad memory reference: {}", value))
    })?;
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| EngineError::ProtocolViolation(format!("bad memory reference: {}", s)))
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::ProtocolViolation(format!("missing argument {:?}", key)))
}

impl DebugAdapter {
    pub fn new() -> Arc<DebugAdapter> {
        let (events, _) = broadcast::channel(256);
        Arc::new(DebugAdapter {
            state: Mutex::new(AdapterState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    async fn launch(&self, arguments: Value) -> Result<Value> {
        let config: LaunchConfig = serde_json::from_value(arguments)
            .map_err(|e| EngineError::ProtocolViolation(format!("bad launch config: {}", e)))?;
        let mut state = self.state.lock().await;
        if state.session.is_some() {
            return Err(EngineError::CommandFailed("already launched".to_string()));
        }

        // Server first: the session needs its port to connect to. The RTT
        // decoder port, when the family has one, rides in the same block.
        let capability = config.server_type.capability();
        let server = {
            let count = capability.total_ports();
            let ports = if count > 0 {
                PortAllocator::new(config.port_range())?.reserve_consecutive(count)?
            } else {
                Vec::new()
            };
            GdbServer::launch(config.server_config(), ports).await?
        };

        let session = GdbSession::start(config.session_config()).await?;
        self.forward_session_events(session.subscribe());

        session
            .command_ok(&format!(
                "file-exec-and-symbols \"{}\"",
                config.executable.display()
            ))
            .await?;
        if let Some(port) = server.gdb_port() {
            session
                .command_ok(&format!("target-select extended-remote localhost:{}", port))
                .await?;
        }

        // Symbols degrade to an empty table when the dump tools are absent.
        let symbols = match SymbolStore::load(config.symbol_config()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("symbol table unavailable: {}", e);
                None
            }
        };
        let target = TargetInfo::discover(&session).await;

        let helper = match &config.helper_path {
            Some(path) => match HelperTransport::spawn(path, &config.helper_args) {
                Ok(helper) => {
                    self.forward_helper_events(helper.subscribe());
                    Some(helper)
                }
                Err(e) => {
                    warn!("helper unavailable: {}", e);
                    None
                }
            },
            None => None,
        };
        let disasm = match &helper {
            Some(helper) => {
                let source: Arc<dyn crate::disasm::InstructionSource> = helper.clone();
                match DisassemblyAdapter::initialize(source, &target) {
                    Ok(adapter) => Some(adapter),
                    Err(e) => {
                        warn!("disassembly disabled: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let rtt_address = match &symbols {
            Some(store) => store.read().await.rtt_control_block(),
            None => None,
        };
        let symbol_count = match &symbols {
            Some(store) => store.read().await.len(),
            None => 0,
        };
        let body = json!({
            "gdbPort": server.gdb_port(),
            "rttPort": server.rtt_port(),
            "architecture": target.architecture,
            "pointerSize": target.pointer_size,
            "symbolCount": symbol_count,
            "rttAddress": rtt_address,
            "disassembly": disasm.is_some(),
        });

        state.server = Some(server);
        state.session = Some(session);
        state.symbols = symbols;
        state.target = target;
        state.helper = helper;
        state.disasm = disasm;
        info!("launch complete");
        Ok(body)
    }

    fn forward_session_events(&self, mut rx: broadcast::Receiver<SessionEvent>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let value = match event {
                    SessionEvent::Async { class, results } => {
                        json!({"event": class, "body": mi_results_to_json(&results)})
                    }
                    SessionEvent::Notify { class, results } => {
                        json!({"event": class, "body": mi_results_to_json(&results)})
                    }
                    SessionEvent::Console(text) => {
                        json!({"event": "console", "body": text})
                    }
                    SessionEvent::Target(text) => json!({"event": "target", "body": text}),
                    SessionEvent::Log(text) => json!({"event": "log", "body": text}),
                    SessionEvent::Terminated => json!({"event": "terminated"}),
                };
                let _ = events.send(value);
            }
        });
    }

    fn forward_helper_events(&self, mut rx: broadcast::Receiver<HelperEvent>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let value = match event {
                    HelperEvent::Output(text) => json!({"event": "output", "body": text}),
                    HelperEvent::Log(text) => json!({"event": "log", "body": text}),
                    HelperEvent::Error(text) => json!({"event": "error", "body": text}),
                    HelperEvent::Progress(body) => json!({"event": "progress", "body": body}),
                    HelperEvent::AddressFound(body) => {
                        json!({"event": "address-found", "body": body})
                    }
                    HelperEvent::Other { kind, body } => json!({"event": kind, "body": body}),
                };
                let _ = events.send(value);
            }
        });
    }

    async fn session(&self) -> Result<Arc<GdbSession>> {
        self.state
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| EngineError::CommandFailed("no active session".to_string()))
    }

    async fn exec(&self, mi_command: &str) -> Result<Value> {
        let session = self.session().await?;
        session.command_ok(mi_command).await?;
        Ok(json!({}))
    }

    async fn evaluate(&self, arguments: Value) -> Result<Value> {
        let expression = str_arg(&arguments, "expression")?;
        let session = self.session().await?;

        let id = format!("w{}", Uuid::new_v4().simple());
        let record = session
            .command_ok(&format!(
                "var-create {} @ \"{}\"",
                id,
                expression.replace('\\', "\\\\").replace('"', "\\\"")
            ))
            .await?;
        let value = find(&record.results, "value")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let children = find(&record.results, "numchild")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut state = self.state.lock().await;
        state.watches.insert(id.clone(), id.clone());
        Ok(json!({"result": value, "id": id, "childCount": children}))
    }

    async fn variables(&self, arguments: Value) -> Result<Value> {
        let id = str_arg(&arguments, "id")?.to_string();
        {
            let state = self.state.lock().await;
            if !state.watches.contains_key(&id) && !id.contains('.') {
                return Err(EngineError::CommandFailed(format!("unknown watch {}", id)));
            }
        }
        let session = self.session().await?;
        let record = session
            .command_ok(&format!("var-list-children --all-values {}", id))
            .await?;

        let mut out = Vec::new();
        if let Some(children) = find(&record.results, "children").and_then(|v| v.as_list()) {
            for child in children {
                let Some(child) = child.get("child") else {
                    continue;
                };
                out.push(json!({
                    "name": child.get("exp").and_then(|v| v.as_str()),
                    "value": child.get("value").and_then(|v| v.as_str()),
                    "id": child.get("name").and_then(|v| v.as_str()),
                    "childCount": child.get("numchild").and_then(|v| v.as_u64()).unwrap_or(0),
                }));
            }
        }
        Ok(json!({"variables": out}))
    }

    async fn disassemble(&self, arguments: Value) -> Result<Value> {
        let reference = parse_address(arguments.get("memoryReference"))?;
        let byte_offset = arguments.get("offset").and_then(Value::as_i64).unwrap_or(0);
        let instruction_offset = arguments
            .get("instructionOffset")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let count = arguments
            .get("instructionCount")
            .and_then(Value::as_u64)
            .unwrap_or(32);

        let state = self.state.lock().await;
        let Some(disasm) = &state.disasm else {
            return Err(EngineError::CommandFailed(
                "disassembly unavailable".to_string(),
            ));
        };
        if let Some(helper) = &state.helper {
            // The helper may still be indexing the image right after launch.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
                helper.await_symbol_table().await;
                helper.await_disassembly().await;
            })
            .await;
        }
        if let Some(store) = &state.symbols {
            let table = store.read().await;
            if !state.target.is_accessible(reference, &table) {
                return Err(EngineError::CommandFailed(format!(
                    "address {:#x} is not accessible",
                    reference
                )));
            }
        }
        let rows = disasm
            .disassemble(reference, byte_offset, instruction_offset, count)
            .await?;
        Ok(json!({ "instructions": rows }))
    }

    async fn read_memory(&self, arguments: Value) -> Result<Value> {
        let address = parse_address(arguments.get("memoryReference"))?;
        let count = arguments.get("count").and_then(Value::as_u64).unwrap_or(4);
        {
            let state = self.state.lock().await;
            if let Some(store) = &state.symbols {
                let table = store.read().await;
                if !state.target.is_accessible(address, &table) {
                    return Err(EngineError::CommandFailed(format!(
                        "address {:#x} is not accessible",
                        address
                    )));
                }
            }
        }
        let session = self.session().await?;
        let record = session
            .command_ok(&format!("data-read-memory-bytes {:#x} {}", address, count))
            .await?;
        let contents = find(&record.results, "memory")
            .and_then(|v| v.as_list())
            .and_then(|l| l.first())
            .and_then(|m| m.get("contents"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(json!({"address": format!("{:#x}", address), "data": contents}))
    }

    async fn symbol_query(&self, arguments: Value) -> Result<Value> {
        let state = self.state.lock().await;
        let Some(store) = &state.symbols else {
            return Err(EngineError::CommandFailed("no symbol table".to_string()));
        };
        // Name and file queries depend on the nm merge having landed.
        if arguments.get("name").is_some() || arguments.get("staticsOf").is_some() {
            store.attribution_complete().await;
        }
        let table = store.read().await;

        if let Some(name) = arguments.get("name").and_then(Value::as_str) {
            let file = arguments.get("file").and_then(Value::as_str);
            let found = table
                .function_by_name(name, file)
                .or_else(|| table.variable_by_name(name, file));
            return Ok(match found {
                Some(sym) => json!({
                    "name": sym.name,
                    "address": format!("{:#x}", sym.address),
                    "length": sym.length,
                    "file": sym.file,
                    "static": sym.is_static,
                }),
                None => Value::Null,
            });
        }
        if let Some(address) = arguments.get("address") {
            let address = parse_address(Some(address))?;
            return Ok(match table.function_at(address) {
                Some(sym) => json!({
                    "name": sym.name,
                    "address": format!("{:#x}", sym.address),
                    "length": sym.length,
                    "file": sym.file,
                    "static": sym.is_static,
                }),
                None => Value::Null,
            });
        }
        if let Some(file) = arguments.get("staticsOf").and_then(Value::as_str) {
            let statics: Vec<Value> = table
                .statics_for_file(file)
                .into_iter()
                .map(|sym| {
                    json!({
                        "name": sym.name,
                        "address": format!("{:#x}", sym.address),
                        "length": sym.length,
                    })
                })
                .collect();
            return Ok(json!({ "symbols": statics }));
        }
        let globals: Vec<Value> = table
            .global_variables()
            .into_iter()
            .map(|sym| {
                json!({
                    "name": sym.name,
                    "address": format!("{:#x}", sym.address),
                    "length": sym.length,
                })
            })
            .collect();
        Ok(json!({ "symbols": globals }))
    }

    async fn status(&self) -> Result<Value> {
        let state = self.state.lock().await;
        let symbol_count = match &state.symbols {
            Some(store) => store.read().await.len(),
            None => 0,
        };
        Ok(json!({
            "connected": state.session.is_some(),
            "architecture": state.target.architecture,
            "pointerSize": state.target.pointer_size,
            "symbolCount": symbol_count,
            "disassembly": state.disasm.is_some(),
        }))
    }

    async fn shutdown(&self) -> Result<Value> {
        let mut state = self.state.lock().await;
        if let Some(helper) = state.helper.take() {
            helper.dispose().await;
        }
        if let Some(session) = state.session.take() {
            session.stop().await;
        }
        if let Some(mut server) = state.server.take() {
            server.shutdown().await;
        }
        state.disasm = None;
        state.symbols = None;
        state.watches.clear();
        info!("session shut down");
        Ok(json!({}))
    }
}

fn mi_results_to_json(results: &[(String, crate::mi::MiValue)]) -> Value {
    use crate::mi::MiValue;
    fn convert(value: &MiValue) -> Value {
        match value {
            MiValue::String(s) => Value::String(s.clone()),
            MiValue::Tuple(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), convert(v)))
                    .collect(),
            ),
            MiValue::List(items) => Value::Array(items.iter().map(convert).collect()),
        }
    }
    Value::Object(results.iter().map(|(k, v)| (k.clone(), convert(v))).collect())
}

#[async_trait]
impl RequestHandler for DebugAdapter {
    async fn handle(&self, command: &str, arguments: Value) -> Result<Value> {
        match command {
            "launch" => self.launch(arguments).await,
            "continue" => self.exec("exec-continue").await,
            "next" => self.exec("exec-next").await,
            "step" | "stepIn" => self.exec("exec-step").await,
            "stepOut" => self.exec("exec-finish").await,
            "pause" => self.exec("exec-interrupt").await,
            "evaluate" => self.evaluate(arguments).await,
            "variables" => self.variables(arguments).await,
            "disassemble" => self.disassemble(arguments).await,
            "readMemory" => self.read_memory(arguments).await,
            "symbols" => self.symbol_query(arguments).await,
            "status" => self.status().await,
            "disconnect" | "terminate" => self.shutdown().await,
            other => Err(EngineError::CommandFailed(format!(
                "unsupported command {:?}",
                other
            ))),
        }
    }
}
