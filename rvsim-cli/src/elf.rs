//! ELF program image loading: parses the image and writes its loadable segments into a
//! [`rvsim_core::memory::MemoryStorage`] through whichever [`rvsim_core::cache::Memory`]
//! implementation the caller is driving.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::debug;
use rvsim_core::memory::MemoryLoadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfLoadError {
    #[error("failed to parse ELF file: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("failed to load segment into guest memory: {0}")]
    Memory(#[from] MemoryLoadError),
}

/// Parses `buf` as an ELF32/ELF64 image and loads every `PT_LOAD` segment's file contents into
/// `mem`, zero-filling the remainder of each segment up to its memory size (e.g. `.bss`).
pub fn load_elf(
    buf: &[u8],
    mem: &mut rvsim_core::memory::MemoryStorage,
) -> Result<Elf<'_>, ElfLoadError> {
    let elf = Elf::parse(buf)?;

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        debug!(
            "loading segment paddr={:#010x} filesz={:#x} memsz={:#x}",
            header.p_paddr, header.p_filesz, header.p_memsz
        );
        let data = &buf[header.file_range()];
        mem.load_segment(
            header.p_paddr as u32,
            data,
            header.p_memsz as usize,
        )?;
    }

    Ok(elf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_core::memory::MemoryStorage;

    #[test]
    fn rejects_garbage_input() {
        let mut mem = MemoryStorage::new();
        let result = load_elf(b"not an elf file", &mut mem);
        assert!(result.is_err());
    }
}
