//! Object file manager.
//!
//! Loads compiled object files (and static archives) and exposes their
//! symbol, section, and relocation records to the rest of the linker. The
//! manager owns every loaded file; nothing here resolves anything, it only
//! parses and remembers.

use anyhow::{anyhow, Context, Result};
use memmap2::Mmap;
use object::read::{Object, ObjectSection as _, ObjectSymbol as _, RelocationTarget};
use object::{Architecture, RelocationKind};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::symbol::{RefKind, SymbolBinding, SymbolKind};

/// Coarse classification of an input section, used by layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionClass {
    Text,
    ReadOnlyData,
    Data,
    Bss,
    Other,
}

/// A symbol record as it appears in one compilation unit.
#[derive(Debug, Clone)]
pub struct ObjectSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub binding: SymbolBinding,
    pub kind: SymbolKind,
    pub section_name: Option<String>,
}

/// A relocation record within one section.
#[derive(Debug, Clone)]
pub struct ObjectReloc {
    pub offset: u64,
    pub symbol_name: String,
    pub kind: RefKind,
    pub addend: i64,
}

/// A section's metadata and raw bytes.
#[derive(Debug, Clone)]
pub struct ObjectSection {
    pub name: String,
    pub size: u64,
    pub alignment: u64,
    pub class: SectionClass,
    pub data: Vec<u8>,
    pub relocations: Vec<ObjectReloc>,
}

/// One parsed compilation unit.
#[derive(Debug, Clone)]
pub struct ObjectFile {
    /// Provenance path; archive members render as `lib.a(member.o)`.
    pub path: String,
    pub symbols: Vec<ObjectSymbol>,
    pub sections: Vec<ObjectSection>,
    pub format: String,
    pub architecture: String,
}

/// Load statistics, monotone until [`ObjectManager::clear`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    pub files_loaded: u64,
    pub total_symbols_processed: u64,
}

/// Owns all loaded object files for one link operation.
#[derive(Default)]
pub struct ObjectManager {
    files: Vec<ObjectFile>,
    stats: LoadStats,
    last_error: Option<String>,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every path in order, continuing past failures so the caller can
    /// report how many of the requested files actually loaded. The first
    /// failure is retained in [`Self::last_error`].
    pub fn load_files(&mut self, paths: &[PathBuf]) -> usize {
        let mut loaded = 0;
        for path in paths {
            match self.load_file(path) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!("failed to load {}: {e:#}", path.display());
                    if self.last_error.is_none() {
                        self.last_error = Some(format!("{e:#}"));
                    }
                }
            }
        }
        loaded
    }

    /// Load a single object file or static archive.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        let data: &[u8] = &mmap;

        if data.starts_with(b"!<arch>\n") {
            let archive = object::read::archive::ArchiveFile::parse(data)
                .with_context(|| format!("failed to parse archive {}", path.display()))?;
            for member in archive.members() {
                let member = member?;
                let name = String::from_utf8_lossy(member.name()).to_string();
                let bytes = member.data(data)?;
                let obj = object::File::parse(bytes)
                    .with_context(|| format!("failed to parse {}({})", path.display(), name))?;
                let parsed = parse_object(&format!("{}({})", path.display(), name), &obj)?;
                self.push(parsed);
            }
        } else {
            let obj = object::File::parse(data)
                .with_context(|| format!("failed to parse object file {}", path.display()))?;
            let parsed = parse_object(&path.display().to_string(), &obj)?;
            self.push(parsed);
        }
        Ok(())
    }

    fn push(&mut self, file: ObjectFile) {
        self.stats.files_loaded += 1;
        self.stats.total_symbols_processed += file.symbols.len() as u64;
        tracing::debug!(
            "loaded {}: {} symbols, {} sections",
            file.path,
            file.symbols.len(),
            file.sections.len()
        );
        self.files.push(file);
    }

    /// All currently loaded files, in load order.
    pub fn all_files(&self) -> &[ObjectFile] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Drop every loaded file and reset statistics.
    pub fn clear(&mut self) {
        self.files.clear();
        self.stats = LoadStats::default();
        self.last_error = None;
    }
}

fn parse_object(path: &str, obj: &object::File<'_>) -> Result<ObjectFile> {
    if obj.architecture() != Architecture::X86_64 {
        return Err(anyhow!(
            "unsupported architecture in {}: {:?} (only x86_64 is supported)",
            path,
            obj.architecture()
        ));
    }

    let mut symbols = Vec::new();
    for sym in obj.symbols() {
        let name = sym.name()?;
        if name.is_empty() {
            continue;
        }
        match sym.kind() {
            object::SymbolKind::File | object::SymbolKind::Section => {
                continue
            }
            _ => {}
        }

        let binding = if sym.is_undefined() {
            SymbolBinding::Undefined
        } else if sym.is_common() {
            SymbolBinding::Common
        } else if sym.is_weak() {
            SymbolBinding::Weak
        } else if sym.is_local() {
            SymbolBinding::Local
        } else {
            SymbolBinding::Global
        };

        let kind = match sym.kind() {
            object::SymbolKind::Text => SymbolKind::Function,
            object::SymbolKind::Data | object::SymbolKind::Tls => SymbolKind::Variable,
            _ => SymbolKind::Unknown,
        };

        let section_name = sym.section_index().and_then(|idx| {
            obj.section_by_index(idx)
                .ok()
                .and_then(|s| s.name().ok().map(str::to_string))
        });

        symbols.push(ObjectSymbol {
            name: name.to_string(),
            address: sym.address(),
            size: sym.size(),
            binding,
            kind,
            section_name,
        });
    }

    let mut sections = Vec::new();
    for section in obj.sections() {
        let name = section.name().unwrap_or("").to_string();
        let class = match section.kind() {
            object::SectionKind::Text => SectionClass::Text,
            object::SectionKind::ReadOnlyData | object::SectionKind::ReadOnlyString => {
                SectionClass::ReadOnlyData
            }
            object::SectionKind::Data => SectionClass::Data,
            object::SectionKind::UninitializedData => SectionClass::Bss,
            _ => SectionClass::Other,
        };

        let data = if class == SectionClass::Bss || class == SectionClass::Other {
            Vec::new()
        } else {
            section
                .data()
                .with_context(|| format!("failed to read section {} of {}", name, path))?
                .to_vec()
        };

        let mut relocations = Vec::new();
        for (offset, reloc) in section.relocations() {
            let kind = match reloc.kind() {
                RelocationKind::Absolute => RefKind::Absolute,
                RelocationKind::Relative => RefKind::Relative,
                RelocationKind::PltRelative => RefKind::Plt,
                RelocationKind::Got | RelocationKind::GotRelative => RefKind::Got,
                other => {
                    tracing::trace!("skipping unsupported relocation kind {other:?} in {path}");
                    continue;
                }
            };
            let symbol_name = match reloc.target() {
                RelocationTarget::Symbol(idx) => {
                    let target = obj.symbol_by_index(idx)?;
                    let target_name = target.name()?;
                    if target_name.is_empty() {
                        tracing::trace!("skipping relocation against unnamed symbol in {path}");
                        continue;
                    }
                    target_name.to_string()
                }
                _ => continue,
            };
            relocations.push(ObjectReloc {
                offset,
                symbol_name,
                kind,
                addend: reloc.addend(),
            });
        }

        sections.push(ObjectSection {
            name,
            size: section.size(),
            alignment: section.align(),
            class,
            data,
            relocations,
        });
    }

    Ok(ObjectFile {
        path: path.to_string(),
        symbols,
        sections,
        format: format!("{:?}", obj.format()),
        architecture: "x86_64".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{Object as ObjWriter, Symbol as WriteSymbol, SymbolSection};
    use object::{
        BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, SectionKind, SymbolFlags,
        SymbolScope,
    };

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rld-object-tests-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn sample_object() -> Vec<u8> {
        let mut obj = ObjWriter::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90; 32], 16);
        obj.add_symbol(WriteSymbol {
            name: b"entry".to_vec(),
            value: 0,
            size: 32,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        let ext = obj.add_symbol(WriteSymbol {
            name: b"external".to_vec(),
            value: 0,
            size: 0,
            kind: object::SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            object::write::Relocation {
                offset: 12,
                symbol: ext,
                addend: -4,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Relative,
                    encoding: RelocationEncoding::Generic,
                    size: 32,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn parses_symbols_sections_and_relocations() {
        let path = temp_path("sample.o");
        std::fs::write(&path, sample_object()).unwrap();

        let mut manager = ObjectManager::new();
        manager.load_file(&path).unwrap();

        let files = manager.all_files();
        assert_eq!(files.len(), 1);
        let file = &files[0];

        let entry = file.symbols.iter().find(|s| s.name == "entry").unwrap();
        assert_eq!(entry.binding, SymbolBinding::Global);
        assert_eq!(entry.kind, SymbolKind::Function);
        assert_eq!(entry.size, 32);
        assert_eq!(entry.section_name.as_deref(), Some(".text"));

        let ext = file.symbols.iter().find(|s| s.name == "external").unwrap();
        assert_eq!(ext.binding, SymbolBinding::Undefined);

        let text = file.sections.iter().find(|s| s.name == ".text").unwrap();
        assert_eq!(text.class, SectionClass::Text);
        assert_eq!(text.size, 32);
        assert_eq!(text.relocations.len(), 1);
        let reloc = &text.relocations[0];
        assert_eq!(reloc.symbol_name, "external");
        assert_eq!(reloc.kind, RefKind::Relative);
        assert_eq!(reloc.offset, 12);
        assert_eq!(reloc.addend, -4);
    }

    #[test]
    fn missing_file_is_counted_and_reported() {
        let mut manager = ObjectManager::new();
        let loaded = manager.load_files(&[
            temp_path("does-not-exist.o"),
        ]);
        assert_eq!(loaded, 0);
        assert!(manager.last_error().is_some());
        assert_eq!(manager.file_count(), 0);
    }

    #[test]
    fn clear_resets_files_and_stats() {
        let path = temp_path("clearme.o");
        std::fs::write(&path, sample_object()).unwrap();

        let mut manager = ObjectManager::new();
        manager.load_file(&path).unwrap();
        assert_eq!(manager.stats().files_loaded, 1);

        manager.clear();
        assert_eq!(manager.file_count(), 0);
        assert_eq!(manager.stats().files_loaded, 0);
        assert!(manager.last_error().is_none());
    }
}
