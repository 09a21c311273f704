//! Linker orchestration.
//!
//! The `Linker` drives the whole pipeline: load object files, feed their
//! symbols to the resolution engine, resolve, generate the executable, set
//! permissions, and validate the artifact. Each step runs once, in order,
//! and the first failure terminates the operation with a structured
//! [`LinkingResult`]; nothing is retried within one call.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::generator::{ElfGenerator, ExecutableGenerator};
use crate::layout;
use crate::object::ObjectManager;
use crate::resolver::SymbolResolver;

/// Pipeline position, advanced step by step during [`Linker::link_files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Configured,
    Loading,
    AddingSymbols,
    Resolving,
    GeneratingExecutable,
    SettingPermissions,
    Validating,
    Succeeded,
    Failed,
}

/// What to link and how.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub object_files: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub generate_debug_info: bool,
    pub allow_undefined_symbols: bool,
    /// When set, a weak definition is allowed to stand against a later
    /// strong one instead of being replaced.
    pub weak_symbol_resolution: bool,
    pub entry_point_symbol: String,
    /// Accepted for forward compatibility; linking is sequential and a
    /// warning is recorded when this is set.
    pub parallel_linking: bool,
}

impl Default for LinkRequest {
    fn default() -> Self {
        Self {
            object_files: Vec::new(),
            output_path: PathBuf::from("a.out"),
            generate_debug_info: false,
            allow_undefined_symbols: false,
            weak_symbol_resolution: false,
            entry_point_symbol: "main".to_string(),
            parallel_linking: false,
        }
    }
}

/// Platform/format description of the produced executable.
#[derive(Debug, Clone)]
pub struct ExecutableMetadata {
    pub target_platform: String,
    pub target_architecture: String,
    pub executable_format: String,
    pub executable_size: u64,
    pub symbol_count: usize,
    pub section_count: usize,
    pub has_debug_info: bool,
    pub entry_point: String,
    pub base_address: u64,
    pub file_permissions: u32,
}

impl Default for ExecutableMetadata {
    fn default() -> Self {
        Self {
            target_platform: std::env::consts::OS.to_string(),
            target_architecture: "x86_64".to_string(),
            executable_format: "ELF".to_string(),
            executable_size: 0,
            symbol_count: 0,
            section_count: 0,
            has_debug_info: false,
            entry_point: "main".to_string(),
            base_address: layout::BASE_ADDR,
            file_permissions: 0o755,
        }
    }
}

/// Outcome of one link operation. The caller owns it outright.
#[derive(Debug, Clone, Default)]
pub struct LinkingResult {
    pub success: bool,
    pub executable_path: Option<PathBuf>,
    pub error: Option<String>,
    pub total_symbols_processed: usize,
    pub symbols_resolved: usize,
    pub symbols_unresolved: usize,
    pub undefined_symbol_names: Vec<String>,
    pub warnings: Vec<String>,
    pub linking_time_ms: f64,
    pub metadata: ExecutableMetadata,
}

/// Cumulative per-linker statistics across link operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkerStats {
    pub total_objects_linked: u64,
    pub total_executables_generated: u64,
    pub total_linking_time_ms: f64,
}

/// The linker instance: owns the object manager, the symbol resolver, and
/// the executable generator for one series of link operations. Not
/// internally synchronized; use one instance per concurrent link.
pub struct Linker {
    object_manager: ObjectManager,
    resolver: SymbolResolver,
    generator: Box<dyn ExecutableGenerator>,
    request: LinkRequest,
    state: LinkState,
    initialized: bool,
    last_error: Option<String>,
    stats: LinkerStats,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    pub fn new() -> Self {
        let mut resolver = SymbolResolver::new(1024);
        resolver.configure(false, true, true);
        Self {
            object_manager: ObjectManager::new(),
            resolver,
            generator: Box::new(ElfGenerator),
            request: LinkRequest::default(),
            state: LinkState::Created,
            initialized: true,
            last_error: None,
            stats: LinkerStats::default(),
        }
    }

    /// Install a request and re-configure the resolver from it.
    pub fn configure(&mut self, request: LinkRequest) {
        self.resolver.configure(
            request.allow_undefined_symbols,
            !request.weak_symbol_resolution,
            true,
        );
        self.request = request;
        self.state = LinkState::Configured;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn statistics(&self) -> LinkerStats {
        self.stats
    }

    /// The resolver's current view; valid until the next mutating call.
    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    pub fn is_ready(&self) -> bool {
        self.initialized && self.last_error.is_none()
    }

    /// Drop all loaded files and symbols, keeping configuration.
    pub fn clear_cache(&mut self) {
        self.object_manager.clear();
        self.resolver.clear();
    }

    /// Run the stored request.
    pub fn execute(&mut self) -> LinkingResult {
        let paths = self.request.object_files.clone();
        let output = self.request.output_path.clone();
        let result = self.link_files(&paths, &output);
        self.stats.total_linking_time_ms += result.linking_time_ms;
        if result.success {
            self.stats.total_executables_generated += 1;
        }
        result
    }

    /// Link a single object file into an executable.
    pub fn link_single_file(&mut self, object_file: &Path, output: &Path) -> LinkingResult {
        self.link_files(&[object_file.to_path_buf()], output)
    }

    /// The full pipeline. Every failure path returns a `LinkingResult`
    /// with `success == false`, a non-empty error, and whatever counts
    /// were gathered before the failing step.
    pub fn link_files(&mut self, object_paths: &[PathBuf], output_path: &Path) -> LinkingResult {
        let start = Instant::now();
        let mut result = LinkingResult {
            metadata: ExecutableMetadata {
                has_debug_info: self.request.generate_debug_info,
                entry_point: self.request.entry_point_symbol.clone(),
                ..ExecutableMetadata::default()
            },
            ..LinkingResult::default()
        };

        // Step 1: validate inputs before any mutation.
        if object_paths.is_empty() {
            return self.fail(result, start, "no input object files".to_string());
        }
        if output_path.as_os_str().is_empty() {
            return self.fail(result, start, "output path is empty".to_string());
        }
        if !self.initialized {
            return self.fail(result, start, "linker not initialized".to_string());
        }
        if self.request.parallel_linking {
            let msg = "parallel linking is not implemented; linking sequentially".to_string();
            tracing::warn!("{msg}");
            result.warnings.push(msg);
        }

        // Step 2: load every object file.
        self.state = LinkState::Loading;
        tracing::info!("loading {} object files", object_paths.len());
        let loaded = self.object_manager.load_files(object_paths);
        if loaded != object_paths.len() {
            let detail = self
                .object_manager
                .last_error()
                .unwrap_or("unknown load error")
                .to_string();
            return self.fail(
                result,
                start,
                format!(
                    "only {loaded} of {} object files loaded: {detail}",
                    object_paths.len()
                ),
            );
        }

        // Step 3: feed every file's symbol table into the resolver.
        self.state = LinkState::AddingSymbols;
        let mut add_error = None;
        for file in self.object_manager.all_files() {
            match self.resolver.add_object_file(file) {
                Ok(added) => result.total_symbols_processed += added,
                Err(e) => {
                    add_error = Some(format!("{e:#}"));
                    break;
                }
            }
        }
        if let Some(msg) = add_error {
            return self.fail(result, start, msg);
        }
        tracing::info!("registered {} symbols", result.total_symbols_processed);

        // Step 4: global resolution.
        self.state = LinkState::Resolving;
        let resolution = self.resolver.resolve_all();
        result.symbols_resolved = resolution.resolved_symbols;
        result.symbols_unresolved = resolution.undefined_symbols;
        if !resolution.success {
            result.undefined_symbol_names = resolution.undefined_symbol_names.clone();
            return self.fail(
                result,
                start,
                format!(
                    "symbol resolution failed: {} undefined symbols: {}",
                    resolution.undefined_symbols,
                    resolution.undefined_symbol_names.join(", ")
                ),
            );
        }
        result.undefined_symbol_names = resolution.undefined_symbol_names.clone();
        let mut reloc_error = None;
        for file in self.object_manager.all_files() {
            if let Err(e) = self.resolver.apply_relocations(file) {
                reloc_error = Some(format!("relocation bookkeeping failed: {e:#}"));
                break;
            }
        }
        if let Some(msg) = reloc_error {
            return self.fail(result, start, msg);
        }

        // Step 5: generate the executable image.
        self.state = LinkState::GeneratingExecutable;
        let image = layout::build_image(
            self.object_manager.all_files(),
            &self.resolver,
            &self.request.entry_point_symbol,
        );
        if let Err(e) = self.generator.generate(image, output_path, &mut result.metadata) {
            discard_output(output_path);
            return self.fail(result, start, format!("executable generation failed: {e:#}"));
        }

        // Step 6: platform permission bits.
        self.state = LinkState::SettingPermissions;
        if let Err(e) = set_executable_permissions(output_path, result.metadata.file_permissions) {
            discard_output(output_path);
            return self.fail(result, start, format!("failed to set permissions: {e:#}"));
        }

        // Step 7: validate the artifact.
        self.state = LinkState::Validating;
        if let Err(e) = self.generator.validate(output_path, &mut result.metadata) {
            discard_output(output_path);
            return self.fail(result, start, format!("executable validation failed: {e:#}"));
        }

        // Step 8: success.
        self.state = LinkState::Succeeded;
        self.stats.total_objects_linked += object_paths.len() as u64;
        result.success = true;
        result.executable_path = Some(output_path.to_path_buf());
        result.linking_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            "linked {} object files -> {} ({} symbols resolved, {:.2} ms)",
            object_paths.len(),
            output_path.display(),
            result.symbols_resolved,
            result.linking_time_ms
        );
        result
    }

    fn fail(&mut self, mut result: LinkingResult, start: Instant, msg: String) -> LinkingResult {
        tracing::error!("{msg}");
        self.last_error = Some(msg.clone());
        self.state = LinkState::Failed;
        result.success = false;
        result.error = Some(msg);
        result.linking_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    }
}

fn set_executable_permissions(path: &Path, permissions: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(permissions);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, permissions);
    }
    Ok(())
}

/// A failed pipeline must not leave a half-written artifact behind.
fn discard_output(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("could not remove {}: {e}", path.display());
        }
    }
}
