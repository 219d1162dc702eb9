//! The two-level cached memory model: a code cache and a data cache sitting in front of
//! [`MemoryStorage`], each with independent LRU eviction.

use crate::instruction::{Class, Instruction};
use crate::memory::MemoryStorage;
use log::trace;
use std::collections::HashMap;

/// Number of words in a cache line (128 bytes).
pub const LINE_SIZE_WORDS: usize = 32;
const LINE_SIZE_BYTES: u32 = LINE_SIZE_WORDS as u32 * 4;

/// Number of lines held by the code cache.
pub const CODE_CACHE_LINES: usize = 8;
/// Number of lines held by the data cache.
pub const DATA_CACHE_LINES: usize = 16;

/// Cycles to service a code fetch that misses the code cache.
pub const FETCH_MISS_LATENCY: u32 = 152;
/// Cycles to service a data access that misses the data cache.
pub const DATA_MISS_LATENCY: u32 = 152;
/// Cycles to service a data access that hits the data cache.
pub const DATA_HIT_LATENCY: u32 = 3;
/// Cycles to service any access through [`UncachedMemory`].
pub const UNCACHED_LATENCY: u32 = 120;

type Line = [u32; LINE_SIZE_WORDS];

fn line_base(addr: u32) -> u32 {
    addr & !(LINE_SIZE_BYTES - 1)
}

fn line_tag(addr: u32) -> u32 {
    line_base(addr) / LINE_SIZE_BYTES
}

fn line_offset(addr: u32) -> usize {
    ((addr >> 2) & (LINE_SIZE_WORDS as u32 - 1)) as usize
}

fn read_line(mem: &MemoryStorage, base: u32) -> Line {
    let mut line = [0u32; LINE_SIZE_WORDS];
    for (i, slot) in line.iter_mut().enumerate() {
        *slot = mem.read(base + (i as u32) * 4);
    }
    line
}

/// A memory façade a [`crate::cpu::CpuCore`] can issue fetch and load/store requests against.
///
/// Each kind of access is a two-phase request/poll pair: a request latches the address and arms a
/// wait counter, and the matching poll returns `None`/`false` until [`Memory::tick`] has driven
/// that counter to zero.
pub trait Memory {
    /// Begins a code fetch at `addr`. Any previous unfinished fetch is replaced.
    fn request_fetch(&mut self, addr: u32);
    /// Returns the fetched word once the wait counter has reached zero.
    fn poll_fetch(&mut self) -> Option<u32>;
    /// Begins a data access for `instr`, if it is a [`Class::Ld`] or [`Class::St`]. No-op
    /// otherwise.
    fn request_data(&mut self, instr: &Instruction);
    /// Services `instr`'s data access once its wait counter has reached zero: for a load,
    /// populates `instr.data`; for a store, commits `instr.data`. Returns `true` once the access
    /// has completed (immediately, for non-memory instructions).
    fn poll_data(&mut self, instr: &mut Instruction) -> bool;
    /// Decrements any in-flight wait counters by one cycle.
    fn tick(&mut self);
}

#[derive(Debug, Default)]
struct LruMap {
    timestamps: HashMap<u32, u64>,
    clock: u64,
}

impl LruMap {
    fn touch(&mut self, tag: u32) {
        self.clock += 1;
        self.timestamps.insert(tag, self.clock);
    }

    fn remove(&mut self, tag: u32) {
        self.timestamps.remove(&tag);
    }

    fn least_recently_used(&self) -> Option<u32> {
        self.timestamps
            .iter()
            .min_by_key(|(_, &ts)| ts)
            .map(|(&tag, _)| tag)
    }
}

/// Two-level cached memory: a code cache (no write-back) and a data cache (write-back for dirty
/// lines), each with independent LRU eviction, sitting in front of [`MemoryStorage`].
#[derive(Debug)]
pub struct CachedMemory {
    mem: MemoryStorage,

    code_cache: HashMap<u32, Line>,
    code_lru: LruMap,
    fetch_wait: u32,
    fetch_addr: u32,
    fetch_hit: bool,

    data_cache: HashMap<u32, (Line, bool)>,
    data_lru: LruMap,
    data_wait: u32,
    data_addr: u32,
    data_hit: bool,
}

impl CachedMemory {
    pub fn new(mem: MemoryStorage) -> Self {
        Self {
            mem,
            code_cache: HashMap::new(),
            code_lru: LruMap::default(),
            fetch_wait: 0,
            fetch_addr: 0,
            fetch_hit: false,
            data_cache: HashMap::new(),
            data_lru: LruMap::default(),
            data_wait: 0,
            data_addr: 0,
            data_hit: false,
        }
    }

    /// Returns a reference to the underlying backing storage, e.g. for ELF loading before the
    /// first tick.
    pub fn storage(&self) -> &MemoryStorage {
        &self.mem
    }

    /// Returns a mutable reference to the underlying backing storage.
    pub fn storage_mut(&mut self) -> &mut MemoryStorage {
        &mut self.mem
    }

    fn evict_code_if_full(&mut self) {
        if self.code_cache.len() < CODE_CACHE_LINES {
            return;
        }
        if let Some(victim) = self.code_lru.least_recently_used() {
            trace!("evicting code cache line, tag {victim:#x}");
            self.code_cache.remove(&victim);
            self.code_lru.remove(victim);
        }
    }

    fn evict_data_if_full(&mut self) {
        if self.data_cache.len() < DATA_CACHE_LINES {
            return;
        }
        if let Some(victim) = self.data_lru.least_recently_used() {
            if let Some((line, clean)) = self.data_cache.remove(&victim) {
                if !clean {
                    trace!("writing back dirty data cache line, tag {victim:#x}");
                    let base = victim * LINE_SIZE_BYTES;
                    for (i, word) in line.iter().enumerate() {
                        self.mem.write(base + (i as u32) * 4, *word);
                    }
                }
            }
            self.data_lru.remove(victim);
        }
    }
}

impl Memory for CachedMemory {
    fn request_fetch(&mut self, addr: u32) {
        let tag = line_tag(addr);
        self.fetch_addr = addr;
        if let Some(_line) = self.code_cache.get(&tag) {
            self.fetch_hit = true;
            self.fetch_wait = 0;
        } else {
            self.fetch_hit = false;
            self.fetch_wait = FETCH_MISS_LATENCY;
        }
    }

    fn poll_fetch(&mut self) -> Option<u32> {
        if self.fetch_wait > 0 {
            return None;
        }
        let tag = line_tag(self.fetch_addr);
        if self.fetch_hit {
            let word = self.code_cache[&tag][line_offset(self.fetch_addr)];
            self.code_lru.touch(tag);
            return Some(word);
        }

        let base = line_base(self.fetch_addr);
        let line = read_line(&self.mem, base);
        let word = line[line_offset(self.fetch_addr)];

        self.evict_code_if_full();
        self.code_cache.insert(tag, line);
        self.code_lru.touch(tag);
        trace!("filled code cache line, tag {tag:#x}");
        Some(word)
    }

    fn request_data(&mut self, instr: &Instruction) {
        if instr.class != Class::Ld && instr.class != Class::St {
            return;
        }
        let tag = line_tag(instr.addr);
        self.data_addr = instr.addr;
        if self.data_cache.contains_key(&tag) {
            self.data_hit = true;
            self.data_wait = DATA_HIT_LATENCY;
        } else {
            self.data_hit = false;
            self.data_wait = DATA_MISS_LATENCY;
        }
    }

    fn poll_data(&mut self, instr: &mut Instruction) -> bool {
        if instr.class != Class::Ld && instr.class != Class::St {
            return true;
        }
        if self.data_wait > 0 {
            return false;
        }

        let tag = line_tag(self.data_addr);
        if !self.data_hit {
            let base = line_base(self.data_addr);
            let line = read_line(&self.mem, base);
            self.evict_data_if_full();
            self.data_cache.insert(tag, (line, true));
            trace!("filled data cache line, tag {tag:#x}");
        }

        self.data_lru.touch(tag);
        let offset = line_offset(self.data_addr);
        let (line, clean) = self.data_cache.get_mut(&tag).expect("line just installed");
        match instr.class {
            Class::Ld => instr.data = line[offset],
            Class::St => {
                line[offset] = instr.data;
                *clean = false;
            }
            _ => unreachable!(),
        }
        true
    }

    fn tick(&mut self) {
        if self.fetch_wait > 0 {
            self.fetch_wait -= 1;
        }
        if self.data_wait > 0 {
            self.data_wait -= 1;
        }
    }
}

/// A flat, non-caching memory with a uniform latency for both fetch and data accesses. Kept for
/// completeness and as a differential-testing baseline for [`CachedMemory`]; the CLI's default
/// configuration wires up [`CachedMemory`] instead.
#[derive(Debug)]
pub struct UncachedMemory {
    mem: MemoryStorage,
    fetch_wait: u32,
    fetch_addr: u32,
    data_wait: u32,
    data_addr: u32,
}

impl UncachedMemory {
    pub fn new(mem: MemoryStorage) -> Self {
        Self {
            mem,
            fetch_wait: 0,
            fetch_addr: 0,
            data_wait: 0,
            data_addr: 0,
        }
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.mem
    }

    pub fn storage_mut(&mut self) -> &mut MemoryStorage {
        &mut self.mem
    }
}

impl Memory for UncachedMemory {
    fn request_fetch(&mut self, addr: u32) {
        self.fetch_addr = addr;
        self.fetch_wait = UNCACHED_LATENCY;
    }

    fn poll_fetch(&mut self) -> Option<u32> {
        if self.fetch_wait > 0 {
            return None;
        }
        Some(self.mem.read(self.fetch_addr))
    }

    fn request_data(&mut self, instr: &Instruction) {
        if instr.class != Class::Ld && instr.class != Class::St {
            return;
        }
        self.data_addr = instr.addr;
        self.data_wait = UNCACHED_LATENCY;
    }

    fn poll_data(&mut self, instr: &mut Instruction) -> bool {
        if instr.class != Class::Ld && instr.class != Class::St {
            return true;
        }
        if self.data_wait > 0 {
            return false;
        }
        match instr.class {
            Class::Ld => instr.data = self.mem.read(self.data_addr),
            Class::St => self.mem.write(self.data_addr, instr.data),
            _ => unreachable!(),
        }
        true
    }

    fn tick(&mut self) {
        if self.fetch_wait > 0 {
            self.fetch_wait -= 1;
        }
        if self.data_wait > 0 {
            self.data_wait -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_fetch(mem: &mut CachedMemory, addr: u32) -> u32 {
        mem.request_fetch(addr);
        loop {
            if let Some(word) = mem.poll_fetch() {
                return word;
            }
            mem.tick();
        }
    }

    fn load(mem: &mut CachedMemory, addr: u32) -> u32 {
        let mut instr = Instruction::nop();
        instr.class = Class::Ld;
        instr.addr = addr;
        mem.request_data(&instr);
        loop {
            if mem.poll_data(&mut instr) {
                return instr.data;
            }
            mem.tick();
        }
    }

    fn store(mem: &mut CachedMemory, addr: u32, value: u32) {
        let mut instr = Instruction::nop();
        instr.class = Class::St;
        instr.addr = addr;
        instr.data = value;
        mem.request_data(&instr);
        loop {
            if mem.poll_data(&mut instr) {
                return;
            }
            mem.tick();
        }
    }

    #[test]
    fn fetch_miss_then_hit() {
        let mut storage = MemoryStorage::new();
        storage.write(0x1000, 0xAAAA);
        let mut mem = CachedMemory::new(storage);

        mem.request_fetch(0x1000);
        assert_eq!(None, mem.poll_fetch());
        for _ in 0..FETCH_MISS_LATENCY {
            mem.tick();
        }
        assert_eq!(Some(0xAAAA), mem.poll_fetch());

        // Second fetch of the same line is a hit: completes without ticking.
        mem.request_fetch(0x1000);
        assert_eq!(Some(0xAAAA), mem.poll_fetch());
    }

    #[test]
    fn store_then_load_observes_written_value() {
        let mut mem = CachedMemory::new(MemoryStorage::new());
        store(&mut mem, 0x2000, 42);
        assert_eq!(42, load(&mut mem, 0x2000));
    }

    #[test]
    fn dirty_eviction_writes_back_to_storage() {
        let mut mem = CachedMemory::new(MemoryStorage::new());
        store(&mut mem, 0, 0xDEAD);
        // Touch DATA_CACHE_LINES further distinct lines to evict the first.
        for i in 1..=DATA_CACHE_LINES as u32 {
            store(&mut mem, i * LINE_SIZE_WORDS as u32 * 4, i);
        }
        assert_eq!(0xDEAD, mem.storage().read(0));
    }

    #[test]
    fn lru_evicts_oldest_tag() {
        let mut mem = CachedMemory::new(MemoryStorage::new());
        for i in 0..DATA_CACHE_LINES as u32 {
            store(&mut mem, i * LINE_SIZE_WORDS as u32 * 4, i);
        }
        // One more distinct line forces eviction of tag 0.
        store(&mut mem, DATA_CACHE_LINES as u32 * LINE_SIZE_WORDS as u32 * 4, 999);
        assert!(!mem.data_cache.contains_key(&0));
    }

    #[test]
    fn code_and_data_caches_are_disjoint() {
        let mut mem = CachedMemory::new(MemoryStorage::new());
        run_fetch(&mut mem, 0);
        store(&mut mem, 0, 7);
        // Evicting the data cache's tag 0 must not disturb the code cache's tag 0.
        for i in 1..=DATA_CACHE_LINES as u32 {
            store(&mut mem, i * LINE_SIZE_WORDS as u32 * 4, i);
        }
        assert!(mem.code_cache.contains_key(&0));
    }
}
