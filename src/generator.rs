//! Executable generation.
//!
//! The generator is the replaceable back edge of the pipeline: it takes the
//! partitioned image view produced by layout, patches every resolved
//! reference into the segment bytes, and emits a platform executable. The
//! [`ExecutableGenerator`] trait is the seam a port to another format would
//! implement; [`ElfGenerator`] is the stock x86-64 ELF shim.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::path::Path;

use crate::layout::{LinkImage, Patch, Segment};
use crate::linker::ExecutableMetadata;
use crate::symbol::RefKind;
use crate::writer;

pub trait ExecutableGenerator {
    /// Patch the image and write the executable, recording size and counts
    /// into `metadata`.
    fn generate(
        &self,
        image: LinkImage,
        output_path: &Path,
        metadata: &mut ExecutableMetadata,
    ) -> Result<()>;

    /// Re-open the produced artifact and check it is structurally sane.
    fn validate(&self, path: &Path, metadata: &mut ExecutableMetadata) -> Result<()>;
}

/// Stock generator for x86-64 ELF executables.
pub struct ElfGenerator;

/// Apply one patch to a segment's bytes.
///
/// `Absolute` writes S + A as a 64-bit value; the relative forms write
/// S + A - P as a signed 32-bit displacement, range-checked.
fn apply_patch(segment: &mut Segment, patch: &Patch) -> Result<()> {
    let off = patch.data_offset as usize;
    let data = &mut segment.data;
    match patch.kind {
        RefKind::Absolute => {
            let value = (patch.symbol_value as i64 + patch.addend) as u64;
            let end = off
                .checked_add(8)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| anyhow!("relocation offset 0x{off:x} out of bounds in {}", segment.name))?;
            data[off..end].copy_from_slice(&value.to_le_bytes());
        }
        RefKind::Relative | RefKind::Plt | RefKind::Got => {
            let disp = patch.symbol_value as i64 + patch.addend - patch.place as i64;
            if disp < i64::from(i32::MIN) || disp > i64::from(i32::MAX) {
                bail!(
                    "relocation overflow at VA 0x{:x}: displacement 0x{:x} exceeds the signed 32-bit range",
                    patch.place,
                    disp
                );
            }
            let end = off
                .checked_add(4)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| anyhow!("relocation offset 0x{off:x} out of bounds in {}", segment.name))?;
            data[off..end].copy_from_slice(&(disp as i32).to_le_bytes());
        }
    }
    Ok(())
}

impl ExecutableGenerator for ElfGenerator {
    fn generate(
        &self,
        mut image: LinkImage,
        output_path: &Path,
        metadata: &mut ExecutableMetadata,
    ) -> Result<()> {
        tracing::debug!(
            "generating {} ({} patches, entry 0x{:x})",
            output_path.display(),
            image.patches.len(),
            image.entry_address
        );

        let LinkImage {
            ref mut segments,
            ref patches,
            entry_address,
            ..
        } = image;
        for patch in patches {
            apply_patch(&mut segments[patch.segment], patch)?;
        }

        writer::write_elf(output_path, segments, entry_address)?;

        metadata.symbol_count = image.symbol_count;
        metadata.section_count = image.section_count;
        metadata.executable_size = std::fs::metadata(output_path)
            .with_context(|| format!("failed to stat {}", output_path.display()))?
            .len();
        Ok(())
    }

    fn validate(&self, path: &Path, metadata: &mut ExecutableMetadata) -> Result<()> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("generated executable not found: {}", path.display()))?;
        if !meta.is_file() {
            bail!("generated output is not a regular file: {}", path.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o100 == 0 {
                bail!("generated file is not executable: {}", path.display());
            }
        }

        let mut header = [0u8; 5];
        std::fs::File::open(path)
            .and_then(|mut f| f.read_exact(&mut header))
            .with_context(|| format!("failed to read back {}", path.display()))?;
        if header[..4] != object::elf::ELFMAG {
            bail!("{} is not an ELF image", path.display());
        }
        if header[4] != object::elf::ELFCLASS64 {
            bail!("{} is not an ELF64 image", path.display());
        }

        metadata.executable_size = meta.len();
        Ok(())
    }
}
