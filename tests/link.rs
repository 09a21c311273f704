//! End-to-end pipeline tests.
//!
//! Each test synthesizes real relocatable ELF objects with `object::write`,
//! links them through the full pipeline, and checks the structured result
//! and the produced artifact.

use object::write::{Object as ObjWriter, Relocation as WriteReloc, Symbol as WriteSymbol, SymbolSection};
use object::{
    BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind, SectionKind,
    SymbolFlags, SymbolScope,
};
use std::path::PathBuf;

use rld::linker::{LinkRequest, LinkState, Linker};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rld-e2e-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct ObjBuilder {
    obj: ObjWriter<'static>,
    text: object::write::SectionId,
}

impl ObjBuilder {
    fn new() -> Self {
        let mut obj = ObjWriter::new(BinaryFormat::Elf, object::Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90; 64], 16);
        Self { obj, text }
    }

    fn define(&mut self, name: &str, value: u64, size: u64, weak: bool) -> &mut Self {
        self.obj.add_symbol(WriteSymbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak,
            section: SymbolSection::Section(self.text),
            flags: SymbolFlags::None,
        });
        self
    }

    /// Add an undefined symbol plus a PC-relative reference to it.
    fn reference(&mut self, name: &str, offset: u64) -> &mut Self {
        let sym = self.obj.add_symbol(WriteSymbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: object::SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.obj
            .add_relocation(
                self.text,
                WriteReloc {
                    offset,
                    symbol: sym,
                    addend: -4,
                    flags: RelocationFlags::Generic {
                        kind: RelocationKind::Relative,
                        encoding: RelocationEncoding::Generic,
                        size: 32,
                    },
                },
            )
            .unwrap();
        self
    }

    fn write_to(&mut self, path: &PathBuf) {
        std::fs::write(path, self.obj.write().unwrap()).unwrap();
    }
}

#[test]
fn two_files_link_successfully() {
    let dir = test_dir("two-files");
    let a = dir.join("a.o");
    let b = dir.join("b.o");
    let out = dir.join("out");

    ObjBuilder::new()
        .define("main", 0x10, 32, false)
        .reference("helper", 0x18)
        .write_to(&a);
    ObjBuilder::new().define("helper", 0x20, 16, false).write_to(&b);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a, b], &out);

    assert!(result.success, "link failed: {:?}", result.error);
    assert_eq!(result.symbols_resolved, 2);
    assert_eq!(result.symbols_unresolved, 0);
    assert_eq!(result.executable_path.as_deref(), Some(out.as_path()));
    assert_eq!(linker.state(), LinkState::Succeeded);
    assert!(result.error.is_none());

    // The artifact exists, is ELF64, and carries the exec bit.
    let bytes = std::fs::read(&out).unwrap();
    assert_eq!(&bytes[..4], b"\x7fELF");
    assert_eq!(bytes[4], 2);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    assert_eq!(result.metadata.executable_format, "ELF");
    assert!(result.metadata.executable_size > 0);
    assert_eq!(result.metadata.symbol_count, 2);
}

#[test]
fn undefined_symbol_fails_the_link() {
    let dir = test_dir("undefined");
    let a = dir.join("a.o");
    let out = dir.join("out");

    ObjBuilder::new()
        .define("main", 0x10, 32, false)
        .reference("missing_fn", 0x18)
        .write_to(&a);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a], &out);

    assert!(!result.success);
    assert_eq!(result.undefined_symbol_names, vec!["missing_fn".to_string()]);
    assert_eq!(result.symbols_unresolved, 1);
    let err = result.error.unwrap();
    assert!(err.contains("missing_fn"), "error does not name the symbol: {err}");
    assert_eq!(linker.state(), LinkState::Failed);
    assert!(linker.last_error().is_some());

    // No artifact may survive a failed pipeline.
    assert!(!out.exists());
}

#[test]
fn undefined_symbols_allowed_by_request() {
    let dir = test_dir("undefined-allowed");
    let a = dir.join("a.o");
    let out = dir.join("out");

    ObjBuilder::new()
        .define("main", 0x10, 32, false)
        .reference("libc_helper", 0x18)
        .write_to(&a);

    let mut linker = Linker::new();
    linker.configure(LinkRequest {
        allow_undefined_symbols: true,
        ..LinkRequest::default()
    });
    let result = linker.link_files(&[a], &out);

    assert!(result.success, "link failed: {:?}", result.error);
    assert_eq!(result.symbols_unresolved, 1);
    assert_eq!(result.undefined_symbol_names, vec!["libc_helper".to_string()]);
    assert!(out.exists());
}

#[test]
fn strong_definition_wins_over_weak() {
    let dir = test_dir("weak-strong");
    let a = dir.join("weak.o");
    let b = dir.join("strong.o");
    let out = dir.join("out");

    ObjBuilder::new().define("helper", 0x30, 16, true).write_to(&a);
    ObjBuilder::new().define("helper", 0x20, 16, false).write_to(&b);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a, b], &out);
    assert!(result.success, "link failed: {:?}", result.error);

    let entry = linker.resolver().find_symbol("helper").unwrap();
    assert_eq!(entry.address, 0x20);
    assert!(entry.defining_file.as_deref().unwrap().ends_with("strong.o"));
}

#[test]
fn duplicate_strong_definitions_conflict() {
    let dir = test_dir("conflict");
    let a = dir.join("a.o");
    let b = dir.join("b.o");
    let out = dir.join("out");

    ObjBuilder::new().define("main", 0x10, 32, false).write_to(&a);
    ObjBuilder::new().define("main", 0x40, 32, false).write_to(&b);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a, b], &out);

    assert!(!result.success);
    let err = result.error.unwrap();
    assert!(err.contains("multiple definition"), "unexpected error: {err}");
    assert!(err.contains("main"));
    assert!(!out.exists());
}

#[test]
fn count_mismatch_aborts_before_resolution() {
    let dir = test_dir("mismatch");
    let a = dir.join("a.o");
    let out = dir.join("out");

    ObjBuilder::new().define("main", 0x10, 32, false).write_to(&a);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a, dir.join("never-created.o")], &out);

    assert!(!result.success);
    let err = result.error.unwrap();
    assert!(err.contains("1 of 2"), "unexpected error: {err}");
    // Resolution never ran.
    assert_eq!(result.symbols_resolved, 0);
    assert!(!out.exists());
}

#[test]
fn execute_uses_the_configured_request() {
    let dir = test_dir("execute");
    let a = dir.join("a.o");
    let out = dir.join("prog");

    ObjBuilder::new().define("main", 0x10, 32, false).write_to(&a);

    let mut linker = Linker::new();
    linker.configure(LinkRequest {
        object_files: vec![a],
        output_path: out.clone(),
        ..LinkRequest::default()
    });
    let result = linker.execute();

    assert!(result.success, "link failed: {:?}", result.error);
    assert!(out.exists());
    assert_eq!(linker.statistics().total_executables_generated, 1);
    assert_eq!(linker.statistics().total_objects_linked, 1);
    assert!(linker.statistics().total_linking_time_ms >= 0.0);
}

#[test]
fn forward_references_are_marked_resolved() {
    let dir = test_dir("forward");
    let a = dir.join("a.o");
    let b = dir.join("b.o");
    let out = dir.join("out");

    // a.o references helper before any definition is seen.
    ObjBuilder::new()
        .define("main", 0x10, 32, false)
        .reference("helper", 0x18)
        .write_to(&a);
    ObjBuilder::new().define("helper", 0x20, 16, false).write_to(&b);

    let mut linker = Linker::new();
    let result = linker.link_files(&[a, b], &out);
    assert!(result.success, "link failed: {:?}", result.error);

    let entry = linker.resolver().find_symbol("helper").unwrap();
    assert_eq!(entry.reference_count(), 1);
    assert!(entry.references.iter().all(|r| r.resolved));
}
