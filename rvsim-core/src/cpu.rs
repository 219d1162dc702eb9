//! The CPU control state machine: fetch, execute, and write-back, threaded across ticks to honor
//! memory latency.

use crate::cache::Memory;
use crate::csr::{CsrFile, HostMessage};
use crate::instruction::{decode, execute, Instruction};
use crate::registers::RegisterFile;
use log::{debug, trace, warn};

/// The CPU's control state. Exactly one instruction is in flight between leaving [`Status::Ready`]
/// and returning to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Status {
    Ready,
    AwaitingFetch,
    AwaitingData,
}

/// A single RV32I core: register file, CSR file, and the control state machine that drives them.
///
/// The instruction pointer lives here rather than in the register file (see
/// [`crate::registers::RegisterFile`]): it is part of the CPU's own control state, not a
/// general-purpose register.
#[derive(Debug)]
pub struct CpuCore {
    registers: RegisterFile,
    csrs: CsrFile,
    ip: u32,
    status: Status,
    instr: Instruction,
}

impl CpuCore {
    /// Creates a fresh core, reset to the given instruction pointer.
    pub fn new(reset_ip: u32) -> Self {
        Self {
            registers: RegisterFile::new(),
            csrs: CsrFile::new(),
            ip: reset_ip,
            status: Status::Ready,
            instr: Instruction::nop(),
        }
    }

    /// Resets the core to the given instruction pointer, clearing register and CSR state.
    pub fn reset(&mut self, reset_ip: u32) {
        self.registers = RegisterFile::new();
        self.csrs.reset();
        self.ip = reset_ip;
        self.status = Status::Ready;
        self.instr = Instruction::nop();
    }

    /// Current instruction pointer.
    pub fn ip(&self) -> u32 {
        self.ip
    }

    /// Direct read access to the register file, e.g. for a `--signature`-style dump.
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Pops the oldest pending host message, if any.
    pub fn take_message(&mut self) -> Option<HostMessage> {
        self.csrs.take_message()
    }

    /// Number of instructions retired since the last [`CpuCore::reset`].
    pub fn instructions_retired(&self) -> u64 {
        self.csrs.instructions_retired()
    }

    /// Advances the control state machine by at most one transition.
    ///
    /// Per cycle: the CSR file is ticked unconditionally, then the state is dispatched. A
    /// `Ready` core issues a fetch and immediately polls it; `AwaitingFetch` only polls; a
    /// completed fetch is decoded, read, executed, and its data request issued, falling through to
    /// a data poll in the same tick if the memory already has a response. `AwaitingData` polls
    /// the pending data access and, on completion, commits the instruction's effects and returns
    /// to `Ready`.
    pub fn tick(&mut self, memory: &mut impl Memory) {
        self.csrs.tick();

        if self.status == Status::Ready {
            memory.request_fetch(self.ip);
            self.status = Status::AwaitingFetch;
        }

        if self.status == Status::AwaitingFetch {
            let Some(raw) = memory.poll_fetch() else {
                return;
            };
            self.begin_instruction(raw, memory);
        }

        if self.status == Status::AwaitingData {
            if !memory.poll_data(&mut self.instr) {
                return;
            }
            self.retire();
        }
    }

    fn begin_instruction(&mut self, raw: u32, memory: &mut impl Memory) {
        let mut instr = decode(raw).unwrap_or_else(|err| {
            warn!("decode failed at ip {:#010x} ({err}), treating as nop", self.ip);
            Instruction::nop()
        });

        if let Some(src1) = instr.src1 {
            instr.src1_val = self.registers.x(src1);
        }
        if let Some(src2) = instr.src2 {
            instr.src2_val = self.registers.x(src2);
        }
        self.csrs.read(&mut instr);

        execute(&mut instr, self.ip);
        trace!("executing instruction at ip {:#010x}: {:?}", self.ip, instr.class);

        memory.request_data(&instr);
        self.instr = instr;
        self.status = Status::AwaitingData;
    }

    fn retire(&mut self) {
        let instr = self.instr;
        if let Some(dest) = instr.dest {
            self.registers.set_x(dest, instr.data);
        }
        self.csrs.write(&instr);
        self.csrs.instruction_retired();
        debug!("retired instruction, ip {:#010x} -> {:#010x}", self.ip, instr.next_ip);
        self.ip = instr.next_ip;
        self.status = Status::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedMemory;
    use crate::memory::MemoryStorage;
    use crate::registers::Specifier;

    fn assemble_i(imm12: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm12 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        assemble_i(imm as u32 & 0xFFF, rs1, 0b000, rd, 0b0010011)
    }

    #[test]
    fn single_all_hit_instruction_retires_in_one_tick() {
        let mut storage = MemoryStorage::new();
        storage.write(0, addi(1, 0, 5));
        let mut memory = CachedMemory::new(storage);
        let mut cpu = CpuCore::new(0);

        // Prime the code cache so the fetch is a hit.
        memory.request_fetch(0);
        while memory.poll_fetch().is_none() {
            memory.tick();
        }

        cpu.tick(&mut memory);
        assert_eq!(5, cpu.registers().x(Specifier::from_u5(1)));
        assert_eq!(4, cpu.ip());
    }

    #[test]
    fn cold_fetch_miss_takes_at_least_miss_latency_plus_one_ticks() {
        use crate::cache::FETCH_MISS_LATENCY;

        let mut storage = MemoryStorage::new();
        storage.write(0, addi(1, 0, 1));
        let mut memory = CachedMemory::new(storage);
        let mut cpu = CpuCore::new(0);

        let mut ticks: u32 = 0;
        while cpu.ip() == 0 {
            cpu.tick(&mut memory);
            memory.tick();
            ticks += 1;
            assert!(ticks <= FETCH_MISS_LATENCY + 200, "instruction never retired");
        }
        assert!(ticks >= FETCH_MISS_LATENCY + 1);
    }

    #[test]
    fn x0_write_is_ignored_through_retirement() {
        let mut storage = MemoryStorage::new();
        storage.write(0, addi(0, 0, 5));
        let mut memory = CachedMemory::new(storage);
        let mut cpu = CpuCore::new(0);
        loop {
            cpu.tick(&mut memory);
            memory.tick();
            if cpu.ip() != 0 {
                break;
            }
        }
        assert_eq!(0, cpu.registers().x(Specifier::X0));
    }
}
