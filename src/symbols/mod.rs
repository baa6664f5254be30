//! Firmware symbol table engine
//!
//! Symbols come from two toolchain dumps. objdump is authoritative for
//! addresses, sizes, sections and scope; nm supplements it afterwards with
//! the defining file of global symbols. Queries are served from an interval
//! tree over relocated addresses plus name and file indexes.

pub mod interval;
pub mod nm;
pub mod objdump;
pub mod paths;

use crate::error::Result;
use interval::{Interval, IntervalTree};
use objdump::{MemoryRegion, ObjdumpOutput, RawKind, RawScope};
use paths::FileAliasSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// The RTT control block symbol emitted by SEGGER's target library.
pub const RTT_SYMBOL: &str = "_SEGGER_RTT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Address as written in the image.
    pub orig_address: u64,
    /// Address after applying the load offset; all queries use this.
    pub address: u64,
    pub length: u64,
    pub section: String,
    pub kind: SymbolKind,
    /// Canonical defining file, when known.
    pub file: Option<String>,
    /// File-scoped symbol (a C `static`).
    pub is_static: bool,
    pub hidden: bool,
}

impl Symbol {
    /// Closed address range, for symbols with a size.
    fn span(&self) -> Option<(u64, u64)> {
        if self.length == 0 {
            None
        } else {
            Some((self.address, self.address + self.length - 1))
        }
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    tree: IntervalTree,
    globals_by_name: HashMap<String, Vec<usize>>,
    statics_by_name: HashMap<String, Vec<usize>>,
    /// Canonical file -> file-scoped symbol indexes, sorted by address.
    by_file: HashMap<String, Vec<usize>>,
    aliases: FileAliasSet,
    regions: Vec<MemoryRegion>,
}

/// Classification of one raw symbol line.
enum Class {
    Global,
    Static,
    Drop,
}

fn classify(scope: RawScope, kind: RawKind, has_file: bool) -> Class {
    match (scope, kind) {
        // File-scoped statics, attributable through the df context.
        (RawScope::Local, _) if has_file => Class::Static,
        // A local function with no file context is still addressable code.
        (RawScope::Local, RawKind::Function) => Class::Global,
        // A local variable we cannot attribute is unusable for evaluation.
        (RawScope::Local, _) => Class::Drop,
        (RawScope::Global, _) | (RawScope::Both, _) => Class::Global,
        // Blank scope: weak functions matter, anonymous objects do not.
        (RawScope::Neither, RawKind::Function) => Class::Global,
        (RawScope::Neither, _) => Class::Drop,
    }
}

impl SymbolTable {
    /// Build the table from parsed objdump output, relocating every address
    /// by `load_offset`.
    pub fn build(output: ObjdumpOutput, load_offset: u64) -> Self {
        let mut table = SymbolTable {
            regions: output.regions,
            ..Default::default()
        };

        for raw in output.symbols {
            let class = classify(raw.scope, raw.kind, raw.file.is_some());
            let is_static = match class {
                Class::Drop => continue,
                Class::Static => true,
                Class::Global => false,
            };
            let kind = match raw.kind {
                RawKind::Function => SymbolKind::Function,
                RawKind::Object => SymbolKind::Object,
                _ => SymbolKind::Other,
            };
            let file = raw.file.map(|f| table.aliases.add(&f));
            table.symbols.push(Symbol {
                name: raw.name,
                orig_address: raw.address,
                address: raw.address.wrapping_add(load_offset),
                length: raw.length,
                section: raw.section,
                kind,
                file,
                is_static,
                hidden: raw.hidden,
            });
        }

        table.rebuild_indexes();
        info!(
            "symbol table: {} symbols, {} regions",
            table.symbols.len(),
            table.regions.len()
        );
        table
    }

    fn rebuild_indexes(&mut self) {
        self.globals_by_name.clear();
        self.statics_by_name.clear();
        self.by_file.clear();
        let mut ivals = Vec::new();

        for (i, sym) in self.symbols.iter().enumerate() {
            if let Some((low, high)) = sym.span() {
                ivals.push(Interval { low, high, index: i });
            }
            let index = if sym.is_static {
                &mut self.statics_by_name
            } else {
                &mut self.globals_by_name
            };
            index.entry(sym.name.clone()).or_default().push(i);
            if let Some(file) = &sym.file {
                self.by_file.entry(file.clone()).or_default().push(i);
            }
        }
        for indexes in self.by_file.values_mut() {
            indexes.sort_by_key(|&i| self.symbols[i].address);
        }
        self.tree = IntervalTree::build(ivals);
    }

    /// Merge nm's address -> file attribution into symbols that lack one.
    ///
    /// Attribution never changes a symbol's scope classification; it only
    /// makes file-filtered queries able to see it.
    pub fn attach_files(&mut self, attribution: &HashMap<u64, String>) {
        let mut changed = 0usize;
        for sym in &mut self.symbols {
            if sym.file.is_none() {
                if let Some(file) = attribution.get(&sym.orig_address) {
                    sym.file = Some(self.aliases.add(file));
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.rebuild_indexes();
        }
        debug!("nm attribution merged: {} symbols updated", changed);
    }

    /// The function covering `address`, if any. When ranges overlap the
    /// innermost function wins; non-function symbols are only returned if
    /// no function covers the address.
    pub fn function_at(&self, address: u64) -> Option<&Symbol> {
        let hits = self.tree.stab(address);
        let mut best: Option<&Symbol> = None;
        for ival in hits {
            let sym = &self.symbols[ival.index];
            best = match best {
                None => Some(sym),
                Some(cur) => {
                    let cur_fn = cur.kind == SymbolKind::Function;
                    let sym_fn = sym.kind == SymbolKind::Function;
                    if (sym_fn, sym.address, std::cmp::Reverse(sym.length))
                        > (cur_fn, cur.address, std::cmp::Reverse(cur.length))
                    {
                        Some(sym)
                    } else {
                        Some(cur)
                    }
                }
            };
        }
        best
    }

    /// Look up a function by name. With a file hint, file-scoped functions
    /// in that file win over globals of the same name.
    pub fn function_by_name(&self, name: &str, file: Option<&str>) -> Option<&Symbol> {
        if let Some(file) = file {
            if let Some(canonical) = self.aliases.resolve(file) {
                if let Some(indexes) = self.by_file.get(canonical) {
                    if let Some(&i) = indexes.iter().find(|&&i| {
                        self.symbols[i].name == name
                            && self.symbols[i].kind == SymbolKind::Function
                    }) {
                        return Some(&self.symbols[i]);
                    }
                }
            }
        }
        self.lookup_by_name(&self.globals_by_name, name, SymbolKind::Function)
            .or_else(|| self.lookup_by_name(&self.statics_by_name, name, SymbolKind::Function))
    }

    /// Look up a variable: file-scoped static first when a file is given,
    /// then globals.
    pub fn variable_by_name(&self, name: &str, file: Option<&str>) -> Option<&Symbol> {
        if let Some(file) = file {
            if let Some(canonical) = self.aliases.resolve(file) {
                if let Some(indexes) = self.by_file.get(canonical) {
                    if let Some(&i) = indexes.iter().find(|&&i| {
                        self.symbols[i].name == name
                            && self.symbols[i].kind == SymbolKind::Object
                    }) {
                        return Some(&self.symbols[i]);
                    }
                }
            }
        }
        self.lookup_by_name(&self.globals_by_name, name, SymbolKind::Object)
    }

    /// Of several same-named candidates the (file, address)-least wins, so
    /// the answer never depends on dump ordering.
    fn lookup_by_name<'a>(
        &'a self,
        index: &'a HashMap<String, Vec<usize>>,
        name: &str,
        kind: SymbolKind,
    ) -> Option<&'a Symbol> {
        index
            .get(name)?
            .iter()
            .map(|&i| &self.symbols[i])
            .filter(|s| s.kind == kind)
            .min_by(|a, b| {
                (a.file.as_deref(), a.address).cmp(&(b.file.as_deref(), b.address))
            })
    }

    /// File-scoped symbols of a file (any spelling), sorted by address.
    pub fn statics_for_file(&self, file: &str) -> Vec<&Symbol> {
        let Some(canonical) = self.aliases.resolve(file) else {
            return Vec::new();
        };
        self.by_file
            .get(canonical)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| &self.symbols[i])
                    .filter(|s| s.is_static)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Global variables, sorted case-insensitively with runtime-internal
    /// `__`-prefixed names last.
    pub fn global_variables(&self) -> Vec<&Symbol> {
        let mut out: Vec<&Symbol> = self
            .symbols
            .iter()
            .filter(|s| !s.is_static && s.kind == SymbolKind::Object && !s.hidden)
            .collect();
        out.sort_by(|a, b| {
            (a.name.starts_with("__"), a.name.to_lowercase())
                .cmp(&(b.name.starts_with("__"), b.name.to_lowercase()))
        });
        out
    }

    /// Relocated address of the SEGGER RTT control block, if linked in.
    pub fn rtt_control_block(&self) -> Option<u64> {
        self.globals_by_name
            .get(RTT_SYMBOL)
            .and_then(|v| v.first())
            .map(|&i| self.symbols[i].address)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Is the address inside any loadable section of the image?
    pub fn in_loadable_region(&self, address: u64) -> bool {
        self.regions.iter().any(|r| r.contains(address))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Paths and options for the two dump tools.
#[derive(Debug, Clone)]
pub struct SymbolLoaderConfig {
    pub objdump_path: PathBuf,
    pub nm_path: PathBuf,
    pub executable: PathBuf,
    pub load_offset: u64,
}

/// Shared, asynchronously-attributed symbol table.
///
/// `load` returns as soon as the objdump pass completes; nm attribution
/// merges in the background and flips the completion watch when done
/// (successfully or not).
pub struct SymbolStore {
    table: Arc<RwLock<SymbolTable>>,
    attributed: watch::Receiver<bool>,
}

impl SymbolStore {
    pub async fn load(config: SymbolLoaderConfig) -> Result<SymbolStore> {
        // Both dump tools start at once; the table is usable as soon as the
        // authoritative objdump pass lands.
        let nm_path = config.nm_path.clone();
        let nm_exe = config.executable.clone();
        let nm_task = tokio::spawn(async move { nm::load(&nm_path, &nm_exe).await });

        let output = objdump::load(&config.objdump_path, &config.executable).await?;
        let table = Arc::new(RwLock::new(SymbolTable::build(output, config.load_offset)));
        let (tx, attributed) = watch::channel(false);

        let bg_table = Arc::clone(&table);
        tokio::spawn(async move {
            match nm_task.await {
                Ok(Ok(map)) => bg_table.write().await.attach_files(&map),
                // Attribution is best-effort; queries still work without it.
                Ok(Err(e)) => warn!("nm attribution unavailable: {}", e),
                Err(e) => warn!("nm attribution task failed: {}", e),
            }
            let _ = tx.send(true);
        });

        Ok(SymbolStore { table, attributed })
    }

    /// Wrap an already-built table; attribution is considered complete.
    pub fn from_table(table: SymbolTable) -> SymbolStore {
        let (tx, attributed) = watch::channel(true);
        drop(tx);
        SymbolStore {
            table: Arc::new(RwLock::new(table)),
            attributed,
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, SymbolTable> {
        self.table.read().await
    }

    /// Resolves once background file attribution has finished.
    pub async fn attribution_complete(&self) {
        let mut rx = self.attributed.clone();
        // An error means the sender is gone, which also means it finished.
        let _ = rx.wait_for(|done| *done).await;
    }
}
