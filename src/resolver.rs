//! Symbol resolution engine.
//!
//! Owns the global symbol table and implements cross-file resolution:
//! insertion with strong/weak/common tie-breaking, conflict detection,
//! undefined-reference tracking, and the global resolve pass. The table is
//! a bucket array with per-bucket chains; it doubles and rehashes once the
//! load factor passes [`LOAD_FACTOR_LIMIT`].

use anyhow::{anyhow, Error, Result};
use std::io::Write;
use std::time::Instant;

use crate::object::{ObjectFile, ObjectSymbol};
use crate::symbol::{RefKind, SymbolBinding, SymbolEntry, SymbolKind, SymbolReference, SymbolStatus};

const DEFAULT_TABLE_SIZE: usize = 1024;
const LOAD_FACTOR_LIMIT: f64 = 0.7;

/// Resolver-wide behavior switches.
///
/// Configure before registering symbols: the case policy participates in
/// hashing, so changing it on a populated table invalidates lookups.
#[derive(Debug, Clone, Copy)]
pub struct ResolverPolicy {
    /// Report success from [`SymbolResolver::resolve_all`] even when
    /// undefined entries remain.
    pub allow_undefined_symbols: bool,
    /// A strong definition arriving after a weak one replaces it.
    pub prefer_strong_over_weak: bool,
    pub case_sensitive_symbols: bool,
    pub max_resolution_iterations: usize,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            allow_undefined_symbols: false,
            prefer_strong_over_weak: true,
            case_sensitive_symbols: true,
            max_resolution_iterations: 10,
        }
    }
}

/// Hash table health counters, monotone until [`SymbolResolver::clear`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HashStats {
    pub hash_collisions: u64,
    pub max_chain_length: usize,
    pub resize_count: u64,
}

/// Cumulative per-resolver statistics across resolve passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverStats {
    pub total_resolutions: u64,
    pub successful_resolutions: u64,
    pub total_resolution_time_ms: f64,
    pub symbols_processed: u64,
}

/// Outcome of one [`SymbolResolver::resolve_all`] pass.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    pub success: bool,
    pub total_symbols: usize,
    pub resolved_symbols: usize,
    pub undefined_symbols: usize,
    /// Weak definitions observed since creation (or the last clear), not
    /// the count of entries that ended up weak.
    pub weak_symbols: usize,
    /// Undefined names in bucket traversal order, not insertion order.
    pub undefined_symbol_names: Vec<String>,
    pub resolution_time_ms: f64,
    pub hash_collisions: u64,
}

/// The global symbol table plus resolution state for one link operation.
pub struct SymbolResolver {
    buckets: Vec<Vec<SymbolEntry>>,
    symbol_count: usize,
    resolution_complete: bool,
    last_result: Option<ResolutionResult>,
    policy: ResolverPolicy,
    hash_stats: HashStats,
    stats: ResolverStats,
    weak_seen: usize,
    last_error: Option<String>,
}

fn bucket_index(name: &str, case_sensitive: bool, table_size: usize) -> usize {
    let mut h: u64 = 0;
    for b in name.bytes() {
        let b = if case_sensitive { b } else { b.to_ascii_lowercase() };
        h = h.wrapping_mul(31).wrapping_add(u64::from(b));
    }
    (h % table_size as u64) as usize
}

fn names_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

fn status_for(binding: SymbolBinding) -> SymbolStatus {
    match binding {
        SymbolBinding::Undefined => SymbolStatus::Undefined,
        SymbolBinding::Global | SymbolBinding::Local => SymbolStatus::Defined,
        SymbolBinding::Weak => SymbolStatus::Weak,
        SymbolBinding::Common => SymbolStatus::Common,
    }
}

/// Fall back to section placement, then a name heuristic, when the object
/// metadata did not classify the symbol.
fn infer_kind(sym: &ObjectSymbol) -> SymbolKind {
    if sym.kind != SymbolKind::Unknown {
        return sym.kind;
    }
    match sym.section_name.as_deref() {
        Some(s) if s.starts_with(".text") => SymbolKind::Function,
        Some(s) if s.starts_with(".data") || s.starts_with(".bss") || s.starts_with(".rodata") => {
            SymbolKind::Variable
        }
        _ => {
            if sym.name.starts_with("__") {
                SymbolKind::Function
            } else {
                SymbolKind::Unknown
            }
        }
    }
}

impl SymbolResolver {
    /// Create a resolver with the given bucket count (1024 when zero).
    pub fn new(initial_table_size: usize) -> Self {
        let table_size = if initial_table_size == 0 {
            DEFAULT_TABLE_SIZE
        } else {
            initial_table_size
        };
        Self {
            buckets: vec![Vec::new(); table_size],
            symbol_count: 0,
            resolution_complete: false,
            last_result: None,
            policy: ResolverPolicy::default(),
            hash_stats: HashStats::default(),
            stats: ResolverStats::default(),
            weak_seen: 0,
            last_error: None,
        }
    }

    /// Adjust resolution behavior. Call before any symbols are registered.
    pub fn configure(&mut self, allow_undefined: bool, prefer_strong: bool, case_sensitive: bool) {
        self.policy.allow_undefined_symbols = allow_undefined;
        self.policy.prefer_strong_over_weak = prefer_strong;
        self.policy.case_sensitive_symbols = case_sensitive;
    }

    pub fn policy(&self) -> ResolverPolicy {
        self.policy
    }

    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_count
    }

    pub fn is_resolution_complete(&self) -> bool {
        self.resolution_complete
    }

    pub fn last_result(&self) -> Option<&ResolutionResult> {
        self.last_result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn hash_stats(&self) -> HashStats {
        self.hash_stats
    }

    pub fn statistics(&self) -> ResolverStats {
        self.stats
    }

    /// All entries in bucket traversal order.
    pub fn entries(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.buckets.iter().flatten()
    }

    fn set_error(&mut self, msg: String) -> Error {
        tracing::debug!("resolver error: {msg}");
        self.last_error = Some(msg.clone());
        anyhow!(msg)
    }

    fn find_index(&self, name: &str) -> Option<(usize, usize)> {
        let case = self.policy.case_sensitive_symbols;
        let b = bucket_index(name, case, self.buckets.len());
        self.buckets[b]
            .iter()
            .position(|e| names_equal(&e.name, name, case))
            .map(|i| (b, i))
    }

    /// Insert a brand-new entry at its chain head, resizing first if the
    /// load factor has been exceeded.
    fn insert_entry(&mut self, entry: SymbolEntry) {
        if self.symbol_count as f64 / self.buckets.len() as f64 > LOAD_FACTOR_LIMIT {
            self.resize();
        }
        let b = bucket_index(&entry.name, self.policy.case_sensitive_symbols, self.buckets.len());
        if !self.buckets[b].is_empty() {
            self.hash_stats.hash_collisions += 1;
        }
        self.buckets[b].insert(0, entry);
        self.symbol_count += 1;
        let chain = self.buckets[b].len();
        if chain > self.hash_stats.max_chain_length {
            self.hash_stats.max_chain_length = chain;
        }
    }

    /// Double the bucket count and rehash every entry. Entries move by
    /// value; only their bucket placement changes.
    fn resize(&mut self) {
        let new_size = self.buckets.len() * 2;
        let case = self.policy.case_sensitive_symbols;
        let old = std::mem::replace(&mut self.buckets, vec![Vec::new(); new_size]);
        for chain in old {
            for entry in chain {
                let b = bucket_index(&entry.name, case, new_size);
                self.buckets[b].push(entry);
            }
        }
        self.hash_stats.resize_count += 1;
        tracing::debug!(
            "symbol table resized to {} buckets ({} symbols)",
            new_size,
            self.symbol_count
        );
    }

    /// Insert or update the entry for one object-file symbol.
    ///
    /// A second strong definition over an already-defined entry is a
    /// multiple-definition conflict; an undefined placeholder receiving its
    /// first real definition is upgraded in place; anything else that is
    /// already satisfied is a no-op.
    pub fn add_symbol(&mut self, symbol: &ObjectSymbol, source_file: &str) -> Result<()> {
        if symbol.name.is_empty() {
            return Err(self.set_error("cannot register an unnamed symbol".to_string()));
        }
        if symbol.binding == SymbolBinding::Weak {
            self.weak_seen += 1;
        }

        let Some((b, i)) = self.find_index(&symbol.name) else {
            let mut entry = SymbolEntry::undefined(&symbol.name);
            if symbol.binding != SymbolBinding::Undefined {
                entry.define(
                    symbol.address,
                    symbol.size,
                    status_for(symbol.binding),
                    infer_kind(symbol),
                    source_file,
                    symbol.section_name.as_deref(),
                );
            } else {
                entry.kind = infer_kind(symbol);
            }
            tracing::trace!("new symbol {} ({}) from {source_file}", entry.name, entry.status);
            self.insert_entry(entry);
            return Ok(());
        };

        let prefer_strong = self.policy.prefer_strong_over_weak;
        let entry = &mut self.buckets[b][i];
        match (entry.status, symbol.binding) {
            // The name is already tracked; an undefined record adds nothing.
            (_, SymbolBinding::Undefined) => Ok(()),

            // First real definition for a placeholder.
            (SymbolStatus::Undefined, binding) => {
                entry.define(
                    symbol.address,
                    symbol.size,
                    status_for(binding),
                    infer_kind(symbol),
                    source_file,
                    symbol.section_name.as_deref(),
                );
                Ok(())
            }

            (SymbolStatus::Defined, SymbolBinding::Global) => {
                let msg = format!(
                    "multiple definition of `{}`: first defined in {}, redefined in {}",
                    entry.name,
                    entry.defining_file.as_deref().unwrap_or("<unknown>"),
                    source_file
                );
                Err(self.set_error(msg))
            }

            // Duplicate locals, weak-after-strong, and common-after-strong
            // are all already satisfied.
            (SymbolStatus::Defined, _) => Ok(()),

            (SymbolStatus::Weak, SymbolBinding::Global | SymbolBinding::Local) => {
                if prefer_strong {
                    entry.define(
                        symbol.address,
                        symbol.size,
                        SymbolStatus::Defined,
                        infer_kind(symbol),
                        source_file,
                        symbol.section_name.as_deref(),
                    );
                }
                Ok(())
            }

            // The first weak definition wins.
            (SymbolStatus::Weak, SymbolBinding::Weak) => Ok(()),

            // A common block outranks a weak definition.
            (SymbolStatus::Weak, SymbolBinding::Common) => {
                entry.define(
                    symbol.address,
                    symbol.size,
                    SymbolStatus::Common,
                    infer_kind(symbol),
                    source_file,
                    symbol.section_name.as_deref(),
                );
                Ok(())
            }

            (SymbolStatus::Common, SymbolBinding::Global | SymbolBinding::Local) => {
                entry.define(
                    symbol.address,
                    symbol.size,
                    SymbolStatus::Defined,
                    infer_kind(symbol),
                    source_file,
                    symbol.section_name.as_deref(),
                );
                Ok(())
            }

            (SymbolStatus::Common, SymbolBinding::Weak) => Ok(()),

            // Common meeting common keeps the larger block.
            (SymbolStatus::Common, SymbolBinding::Common) => {
                if symbol.size > entry.size {
                    entry.size = symbol.size;
                    entry.defining_file = Some(source_file.to_string());
                }
                Ok(())
            }
        }
    }

    /// Register every symbol of a loaded object file, then every relocation
    /// record as a reference. Returns the number of symbols added.
    pub fn add_object_file(&mut self, file: &ObjectFile) -> Result<usize> {
        let mut added = 0;
        for sym in &file.symbols {
            self.add_symbol(sym, &file.path)?;
            added += 1;
        }
        for section in &file.sections {
            for reloc in &section.relocations {
                self.add_reference(
                    &reloc.symbol_name,
                    &file.path,
                    &section.name,
                    reloc.offset,
                    reloc.kind,
                    reloc.addend,
                )?;
            }
        }
        tracing::debug!("registered {added} symbols from {}", file.path);
        Ok(added)
    }

    /// Record one usage site of a symbol. The entry is lazily created as
    /// undefined when the name has never been seen; forward references are
    /// legal.
    pub fn add_reference(
        &mut self,
        symbol_name: &str,
        referencing_file: &str,
        section_name: &str,
        offset: u64,
        kind: RefKind,
        addend: i64,
    ) -> Result<()> {
        if symbol_name.is_empty() {
            return Err(self.set_error("cannot reference an unnamed symbol".to_string()));
        }
        if self.find_index(symbol_name).is_none() {
            self.insert_entry(SymbolEntry::undefined(symbol_name));
        }
        let (b, i) = self
            .find_index(symbol_name)
            .expect("entry exists after insert");
        self.buckets[b][i].references.insert(
            0,
            SymbolReference {
                referencing_file: referencing_file.to_string(),
                section_name: section_name.to_string(),
                offset,
                kind,
                addend,
                resolved: false,
            },
        );
        Ok(())
    }

    /// One global pass over every bucket chain, classifying entries and
    /// producing a [`ResolutionResult`]. Succeeds when no entry is left
    /// undefined, or when the policy allows undefined symbols. Cumulative
    /// statistics are updated on success and failure alike; the previous
    /// stored result is replaced.
    pub fn resolve_all(&mut self) -> ResolutionResult {
        let start = Instant::now();
        tracing::debug!(
            "resolving {} symbols (pass limit {})",
            self.symbol_count,
            self.policy.max_resolution_iterations
        );

        let mut total = 0;
        let mut resolved = 0;
        let mut undefined_names = Vec::new();
        for entry in self.buckets.iter().flatten() {
            total += 1;
            match entry.status {
                SymbolStatus::Undefined => undefined_names.push(entry.name.clone()),
                SymbolStatus::Defined | SymbolStatus::Weak | SymbolStatus::Common => resolved += 1,
            }
        }

        let undefined = undefined_names.len();
        let success = undefined == 0 || self.policy.allow_undefined_symbols;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        self.stats.total_resolutions += 1;
        self.stats.symbols_processed += total as u64;
        self.stats.total_resolution_time_ms += elapsed_ms;
        if success {
            self.stats.successful_resolutions += 1;
            self.resolution_complete = true;
        } else {
            self.last_error = Some(format!(
                "symbol resolution failed: {undefined} undefined symbols"
            ));
        }

        let result = ResolutionResult {
            success,
            total_symbols: total,
            resolved_symbols: resolved,
            undefined_symbols: undefined,
            weak_symbols: self.weak_seen,
            undefined_symbol_names: undefined_names,
            resolution_time_ms: elapsed_ms,
            hash_collisions: self.hash_stats.hash_collisions,
        };
        self.last_result = Some(result.clone());
        result
    }

    /// Bookkeeping pass: for every entry with a known address, mark the
    /// references made from `file` as resolved. Byte patching is the
    /// executable generator's job, driven by this partition.
    pub fn apply_relocations(&mut self, file: &ObjectFile) -> Result<()> {
        let mut marked = 0;
        for chain in &mut self.buckets {
            for entry in chain {
                if !entry.resolved {
                    continue;
                }
                for r in &mut entry.references {
                    if r.referencing_file == file.path && !r.resolved {
                        r.resolved = true;
                        marked += 1;
                    }
                }
            }
        }
        tracing::debug!("marked {marked} references from {} as resolved", file.path);
        Ok(())
    }

    /// Exact-name lookup. Never allocates.
    pub fn find_symbol(&self, name: &str) -> Option<&SymbolEntry> {
        let case = self.policy.case_sensitive_symbols;
        let b = bucket_index(name, case, self.buckets.len());
        self.buckets[b]
            .iter()
            .find(|e| names_equal(&e.name, name, case))
    }

    /// Whether every entry has a definition, and how many do not.
    pub fn is_complete(&self) -> (bool, usize) {
        let undefined = self
            .entries()
            .filter(|e| e.status == SymbolStatus::Undefined)
            .count();
        (undefined == 0, undefined)
    }

    /// Names of all undefined entries, in bucket traversal order.
    pub fn undefined_symbols(&self) -> Vec<&str> {
        self.entries()
            .filter(|e| e.status == SymbolStatus::Undefined)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Drop every entry and reset all counters to their initial state.
    pub fn clear(&mut self) {
        let size = self.buckets.len();
        self.buckets = vec![Vec::new(); size];
        self.symbol_count = 0;
        self.resolution_complete = false;
        self.last_result = None;
        self.hash_stats = HashStats::default();
        self.stats = ResolverStats::default();
        self.weak_seen = 0;
        self.last_error = None;
    }

    /// Write a human-readable table dump, one line per entry.
    pub fn dump_symbols(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "symbol table: {} symbols, {} buckets, {} resizes, {} collisions",
            self.symbol_count,
            self.buckets.len(),
            self.hash_stats.resize_count,
            self.hash_stats.hash_collisions
        )?;
        for entry in self.entries() {
            writeln!(
                out,
                "  {:<32} {:<9} addr=0x{:08x} size={:<8} refs={} {}",
                entry.name,
                entry.status.to_string(),
                entry.address,
                entry.size,
                entry.references.len(),
                entry.defining_file.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}
