//! Machine model for the RV32IM simulator.
//!
//! This crate owns everything that exists at run time: the register file, the
//! segmented guest memory with its decode cache, the device (I/O streams,
//! opcode counters, branch predictor), the libc stubs and the interpreter
//! loop. The [`rvasm`] crate produces the [`MemoryLayout`] this crate
//! consumes.

pub mod command;
pub mod config;
pub mod constants;
pub mod device;
pub mod executable;
pub mod fault;
pub mod interpreter;
pub mod layout;
pub mod libc;
pub mod memory;
pub mod predictor;
pub mod register;

/// Width of every guest register, address and immediate.
pub type Word = u32;

pub use command::{ArithOp, BranchOp, Command, LoadOp, StoreOp};
pub use config::Config;
pub use device::{Counter, Device};
pub use executable::Executable;
pub use fault::{Fault, FaultKind};
pub use layout::{MemoryLayout, Segment};
pub use memory::Memory;
pub use predictor::BranchPredictor;
pub use register::{Register, RegisterFile};
