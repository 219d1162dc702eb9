//! Flat backing storage for the simulated address space.

use thiserror::Error;

/// Number of 32-bit words backing the simulated address space (4 MiB).
pub const MEM_SIZE_WORDS: usize = 1 << 20;

/// Errors that can occur while populating [`MemoryStorage`] from a program image.
#[derive(Debug, Error)]
pub enum MemoryLoadError {
    #[error("segment at physical address {paddr:#x} with size {size:#x} overflows the {mem_size:#x} byte address space")]
    SegmentOverflow {
        paddr: u32,
        size: usize,
        mem_size: usize,
    },
}

/// A flat, word-addressed memory image.
///
/// Addresses are byte addresses; all accesses in this simulator are word-aligned, so the byte
/// address is simply divided by 4 to find the backing word. Out-of-range accesses through
/// [`MemoryStorage::read`]/[`MemoryStorage::write`] panic: any in-bounds guest program never
/// reaches an out-of-range address through [`crate::cache::CachedMemory`]'s line-aligned
/// accesses, and the one path that can receive an attacker/bug-controlled address (the ELF
/// loader) is checked explicitly and reported as a [`MemoryLoadError`] instead.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    words: Vec<u32>,
}

impl MemoryStorage {
    /// Creates a new, zero-filled memory of [`MEM_SIZE_WORDS`] words.
    pub fn new() -> Self {
        Self {
            words: vec![0; MEM_SIZE_WORDS],
        }
    }

    /// Size of the backing store, in bytes.
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 4
    }

    /// Reads the word at the given byte address, rounded down to its containing word.
    pub fn read(&self, addr: u32) -> u32 {
        self.words[(addr >> 2) as usize]
    }

    /// Writes a word at the given byte address.
    pub fn write(&mut self, addr: u32, value: u32) {
        self.words[(addr >> 2) as usize] = value;
    }

    /// Loads a byte image (e.g. an ELF segment's file contents) at the given physical byte
    /// address, zero-filling the remainder up to `total_len` bytes.
    ///
    /// `total_len` may exceed `data.len()` to model `.bss`-style zero-fill padding beyond the
    /// segment's file size.
    pub fn load_segment(
        &mut self,
        paddr: u32,
        data: &[u8],
        total_len: usize,
    ) -> Result<(), MemoryLoadError> {
        let mem_size = self.size_bytes();
        let end = paddr as usize + total_len;
        if end > mem_size {
            return Err(MemoryLoadError::SegmentOverflow {
                paddr,
                size: total_len,
                mem_size,
            });
        }

        let base = paddr as usize;
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let word = u32::from_le_bytes(bytes);
            let word_addr = (base + i * 4) as u32;
            self.write(word_addr, word);
        }
        // Any bytes between the file image and `total_len` are already zero since the backing
        // store is zero-initialized at construction; nothing further to do here.
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_storage_reads_zero() {
        let mem = MemoryStorage::new();
        assert_eq!(0, mem.read(0));
        assert_eq!(0, mem.read(4 * (MEM_SIZE_WORDS as u32 - 1)));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut mem = MemoryStorage::new();
        mem.write(0x100, 0xDEADBEEF);
        assert_eq!(0xDEADBEEF, mem.read(0x100));
    }

    #[test]
    fn load_segment_writes_words_and_zero_fills_bss() {
        let mut mem = MemoryStorage::new();
        let data = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        mem.load_segment(0x200, &data, 16).unwrap();
        assert_eq!(1, mem.read(0x200));
        assert_eq!(2, mem.read(0x204));
        assert_eq!(0, mem.read(0x208));
        assert_eq!(0, mem.read(0x20c));
    }

    #[test]
    fn load_segment_overflow_is_reported() {
        let mut mem = MemoryStorage::new();
        let data = [0u8; 4];
        let bad_paddr = mem.size_bytes() as u32 - 2;
        assert!(mem.load_segment(bad_paddr, &data, 4).is_err());
    }
}
