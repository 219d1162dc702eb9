#[macro_use]
extern crate static_assertions;

pub mod cache;
pub mod cpu;
pub mod csr;
pub mod instruction;
pub mod memory;
pub mod registers;
pub mod simulator;
