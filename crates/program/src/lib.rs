//! Instruction model of the simulator.
//!
//! This crate is pure data and text: the sum type of instructions, their
//! single-line wire format for the backing store, the `screen -c` script
//! grammar, and the random program generator. Execution lives in the kernel
//! so that instructions never reference processes.

pub mod gen;
pub mod instruction;
pub mod parse;
pub mod word;

pub use gen::Rng;
pub use instruction::{expand_program, Instruction, Operand};
pub use word::StoredWord;
