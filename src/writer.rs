//! ELF image emission.
//!
//! Serializes the laid-out segments into a minimal ELF64 executable: file
//! header, a single RWX LOAD program header, segment bytes, and section
//! headers with a string table. Permission bits on the artifact are the
//! orchestrator's responsibility, not this module's.

use anyhow::{Context, Result};
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;
use std::path::Path;

use crate::layout::{Segment, BASE_ADDR, PAGE_SIZE};
use crate::object::SectionClass;

fn u16v(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32v(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64v(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

fn section_header(
    name_offset: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    align: u64,
) -> object::elf::SectionHeader64<Endianness> {
    object::elf::SectionHeader64 {
        sh_name: u32v(name_offset),
        sh_type: u32v(sh_type),
        sh_flags: u64v(flags),
        sh_addr: u64v(addr),
        sh_offset: u64v(offset),
        sh_size: u64v(size),
        sh_link: u32v(0),
        sh_info: u32v(0),
        sh_addralign: u64v(align),
        sh_entsize: u64v(0),
    }
}

/// Serialize the image and write it to `output_path`.
pub fn write_elf(output_path: &Path, segments: &[Segment], entry_point: u64) -> Result<()> {
    let mut buffer = Vec::new();
    // Segments, plus the null section and .shstrtab.
    let num_sections = segments.len() as u16 + 2;

    let file_header = object::elf::FileHeader64::<Endianness> {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16v(object::elf::ET_EXEC),
        e_machine: u16v(object::elf::EM_X86_64),
        e_version: u32v(object::elf::EV_CURRENT as u32),
        e_entry: u64v(entry_point),
        e_phoff: u64v(64),
        e_shoff: u64v(0), // patched below, once the layout is known
        e_flags: u32v(0),
        e_ehsize: u16v(64),
        e_phentsize: u16v(56),
        e_phnum: u16v(1),
        e_shentsize: u16v(64),
        e_shnum: u16v(num_sections),
        e_shstrndx: u16v(num_sections - 1),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    let file_size = segments
        .iter()
        .filter(|s| s.class != SectionClass::Bss && s.size > 0)
        .map(|s| s.file_offset + s.size)
        .max()
        .unwrap_or(PAGE_SIZE);

    let mem_size = segments
        .iter()
        .filter(|s| s.virtual_address > 0)
        .map(|s| s.virtual_address + s.size)
        .max()
        .unwrap_or(BASE_ADDR)
        - BASE_ADDR;

    let prog_header = object::elf::ProgramHeader64::<Endianness> {
        p_type: u32v(object::elf::PT_LOAD),
        p_flags: u32v(object::elf::PF_R | object::elf::PF_W | object::elf::PF_X),
        p_offset: u64v(0),
        p_vaddr: u64v(BASE_ADDR),
        p_paddr: u64v(BASE_ADDR),
        p_filesz: u64v(file_size),
        p_memsz: u64v(mem_size),
        p_align: u64v(PAGE_SIZE),
    };
    buffer.extend_from_slice(bytes_of(&prog_header));

    if (buffer.len() as u64) < PAGE_SIZE {
        buffer.resize(PAGE_SIZE as usize, 0);
    }

    for segment in segments {
        if segment.class == SectionClass::Bss {
            continue;
        }
        if segment.file_offset > buffer.len() as u64 {
            buffer.resize(segment.file_offset as usize, 0);
        }
        buffer.extend_from_slice(&segment.data);
    }

    // Section header string table: null byte, segment names, ".shstrtab".
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(segments.len() + 1);
    for segment in segments {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(segment.name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    let shoff = buffer.len() as u64;

    buffer.extend_from_slice(bytes_of(&section_header(
        0,
        object::elf::SHT_NULL,
        0,
        0,
        0,
        0,
        0,
    )));

    for (i, segment) in segments.iter().enumerate() {
        let sh_type = if segment.class == SectionClass::Bss {
            object::elf::SHT_NOBITS
        } else {
            object::elf::SHT_PROGBITS
        };
        let flags = match segment.class {
            SectionClass::Text => object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR,
            SectionClass::Data | SectionClass::Bss => {
                object::elf::SHF_ALLOC | object::elf::SHF_WRITE
            }
            _ => object::elf::SHF_ALLOC,
        } as u64;
        buffer.extend_from_slice(bytes_of(&section_header(
            name_offsets[i],
            sh_type,
            flags,
            segment.virtual_address,
            segment.file_offset,
            segment.size,
            16,
        )));
    }

    let shstrtab_offset = shoff + u64::from(num_sections) * 64;
    buffer.extend_from_slice(bytes_of(&section_header(
        shstrtab_name,
        object::elf::SHT_STRTAB,
        0,
        0,
        shstrtab_offset,
        shstrtab.len() as u64,
        1,
    )));

    buffer.extend_from_slice(&shstrtab);

    // Patch e_shoff now that the section header table position is known.
    buffer[40..48].copy_from_slice(&shoff.to_le_bytes());

    std::fs::write(output_path, &buffer)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    Ok(())
}
