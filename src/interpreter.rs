//! The fetch-decode-execute loop.

use crate::config::Config;
use crate::constants::{END_PC, STACK_TOP};
use crate::device::Device;
use crate::fault::Fault;
use crate::layout::MemoryLayout;
use crate::memory::Memory;
use crate::register::{Register, RegisterFile};

/// Runs the program until it returns to [`END_PC`], then yields the final
/// `a0`. Faults carry the program counter of the offending instruction.
pub fn run(
    config: &Config,
    layout: &MemoryLayout,
    memory: &mut Memory,
    device: &mut Device,
) -> Result<u32, Fault> {
    let entry = layout
        .resolve("main")
        .expect("linked layout always contains main");

    let mut rf = RegisterFile::new();
    rf.set_pc(entry);
    rf[Register::Ra] = END_PC;
    rf[Register::Sp] = STACK_TOP;

    let mut steps: u64 = 0;
    while rf.pc() != END_PC {
        // Required by the ISA: x0 reads zero no matter what was written.
        rf.clear_zero();

        steps += 1;
        if steps > config.timeout {
            return Err(Fault::time_limit_exceeded().at(rf.pc()));
        }

        let pc = rf.pc();
        let exe = memory.fetch_executable(pc).map_err(|fault| fault.at(pc))?;
        exe.run(&mut rf, memory, device)
            .map_err(|fault| fault.at(pc))?;
    }

    Ok(rf[Register::A0])
}
