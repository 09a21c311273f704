//! Output image layout.
//!
//! Aggregates sections from the loaded object files into output segments
//! (.text, .rodata, .data, .bss), assigns virtual addresses, and collects
//! the patch list the executable generator applies. The result is the
//! partitioned view handed across the generator boundary: segment bytes,
//! patch sites for resolved references, and the names still undefined.

use std::collections::HashMap;

use crate::object::{ObjectFile, SectionClass};
use crate::resolver::SymbolResolver;
use crate::symbol::RefKind;
use crate::utils::align_up;

pub const PAGE_SIZE: u64 = 0x1000;
pub const BASE_ADDR: u64 = 0x400000;

/// A segment of the output executable, built from same-class input sections.
pub struct Segment {
    pub name: &'static str,
    pub class: SectionClass,
    pub size: u64,
    pub virtual_address: u64,
    pub file_offset: u64,
    pub data: Vec<u8>,
}

impl Segment {
    fn new(name: &'static str, class: SectionClass) -> Self {
        Self {
            name,
            class,
            size: 0,
            virtual_address: 0,
            file_offset: 0,
            data: Vec::new(),
        }
    }
}

/// One reference site to patch: where the bytes live, the place address P,
/// the symbol value S, and the addend A.
pub struct Patch {
    pub segment: usize,
    pub data_offset: u64,
    pub place: u64,
    pub symbol_value: u64,
    pub addend: i64,
    pub kind: RefKind,
}

/// Everything the executable generator needs to emit an image.
pub struct LinkImage {
    pub segments: Vec<Segment>,
    pub patches: Vec<Patch>,
    pub entry_address: u64,
    pub symbol_count: usize,
    pub section_count: usize,
    pub undefined: Vec<String>,
}

/// Build the output image view from the loaded files and the resolved
/// symbol table. Purely in-memory; emission happens in the generator.
pub fn build_image(
    files: &[ObjectFile],
    resolver: &SymbolResolver,
    entry_symbol: &str,
) -> LinkImage {
    let mut segments = vec![
        Segment::new(".text", SectionClass::Text),
        Segment::new(".rodata", SectionClass::ReadOnlyData),
        Segment::new(".data", SectionClass::Data),
        Segment::new(".bss", SectionClass::Bss),
    ];

    // (file path, section name) -> (segment index, offset within segment)
    let mut section_map: HashMap<(&str, &str), (usize, u64)> = HashMap::new();
    let mut section_count = 0;

    for file in files {
        for section in &file.sections {
            if section.size == 0 {
                continue;
            }
            let seg_idx = match section.class {
                SectionClass::Text => 0,
                SectionClass::ReadOnlyData => 1,
                SectionClass::Data => 2,
                SectionClass::Bss => 3,
                SectionClass::Other => {
                    tracing::debug!(
                        "skipping section {} of {} (size {})",
                        section.name,
                        file.path,
                        section.size
                    );
                    continue;
                }
            };
            section_count += 1;
            let segment = &mut segments[seg_idx];
            let start = align_up(segment.size, section.alignment.max(1));
            segment.size = start + section.size;
            if segment.class != SectionClass::Bss {
                segment.data.resize(start as usize, 0);
                segment.data.extend_from_slice(&section.data);
            }
            section_map.insert((file.path.as_str(), section.name.as_str()), (seg_idx, start));
        }
    }

    let mut va = BASE_ADDR + PAGE_SIZE;
    let mut off = PAGE_SIZE;
    for segment in &mut segments {
        if segment.size == 0 {
            continue;
        }
        va = align_up(va, PAGE_SIZE);
        off = align_up(off, PAGE_SIZE);
        segment.virtual_address = va;
        segment.file_offset = off;
        va += segment.size;
        if segment.class != SectionClass::Bss {
            off += segment.size;
        }
    }

    let mut patches = Vec::new();
    for entry in resolver.entries() {
        if !entry.resolved {
            continue;
        }
        for r in &entry.references {
            let Some(&(seg_idx, base)) =
                section_map.get(&(r.referencing_file.as_str(), r.section_name.as_str()))
            else {
                tracing::debug!(
                    "reference to {} from {}({}) has no mapped section",
                    entry.name,
                    r.referencing_file,
                    r.section_name
                );
                continue;
            };
            let data_offset = base + r.offset;
            patches.push(Patch {
                segment: seg_idx,
                data_offset,
                place: segments[seg_idx].virtual_address + data_offset,
                symbol_value: entry.address,
                addend: r.addend,
                kind: r.kind,
            });
        }
    }

    let entry_address = resolver
        .find_symbol(entry_symbol)
        .filter(|e| e.resolved)
        .map(|e| e.address)
        .unwrap_or(0);

    LinkImage {
        segments,
        patches,
        entry_address,
        symbol_count: resolver.symbol_count(),
        section_count,
        undefined: resolver
            .undefined_symbols()
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}
