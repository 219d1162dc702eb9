mod elf;

use clap::Parser;
use elf::load_elf;
use log::{error, info, warn};
use rvsim_core::cache::CachedMemory;
use rvsim_core::csr::HostMessage;
use rvsim_core::memory::MemoryStorage;
use rvsim_core::simulator::Simulator;
use std::fs::File;
use std::io::{Read, Write};
use std::process::ExitCode;

/// Default instruction pointer the core resets to, matching the guest image's entry convention.
const DEFAULT_RESET_VECTOR: u32 = 0x200;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the ELF program image to run.
    #[arg(default_value = "program")]
    elf: String,

    /// Instruction pointer the core resets to before the first tick.
    #[arg(long, short, default_value_t = DEFAULT_RESET_VECTOR)]
    reset_vector: u32,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    let mut buf = Vec::new();
    let mut file = match File::open(&args.elf) {
        Ok(file) => file,
        Err(err) => {
            error!("failed to open {}: {err}", args.elf);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = file.read_to_end(&mut buf) {
        error!("failed to read {}: {err}", args.elf);
        return ExitCode::FAILURE;
    }

    let mut storage = MemoryStorage::new();
    if let Err(err) = load_elf(&buf, &mut storage) {
        error!("failed to load {}: {err}", args.elf);
        return ExitCode::FAILURE;
    }

    let memory = CachedMemory::new(storage);
    let mut simulator = Simulator::new(memory, args.reset_vector);

    loop {
        simulator.step();
        while let Some(message) = simulator.take_message() {
            match message {
                HostMessage::ExitCode(code) => {
                    if code == 0 {
                        info!("guest exited successfully");
                        return ExitCode::SUCCESS;
                    }
                    warn!("guest exited with code {code}");
                    return ExitCode::from(code.min(u16::from(u8::MAX)) as u8);
                }
                HostMessage::PrintChar(ch) => {
                    let _ = std::io::stderr().write_all(&[ch]);
                }
                HostMessage::PrintInt(value) => {
                    eprint!("{value}");
                }
            }
        }
    }
}
