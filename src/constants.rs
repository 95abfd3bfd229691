use std::mem;

use crate::Word;

pub const WORD_BYTES        : u32 = mem::size_of::<Word>() as u32;

/// Start of the text segment, as required by the RISC-V ABI. The libc stub
/// table occupies the first words; user code follows immediately.
pub const TEXT_START        : u32 = 0x10000;

/// First address past the heap. The stack lives above it.
pub const HEAP_TOP          : u32 = 0x1000_0000;

/// First address past the stack.
pub const STACK_TOP         : u32 = 0x2000_0000;

/// Reaching this program counter terminates execution. `ra` is initialized
/// to it so that returning from `main` halts the machine.
pub const END_PC            : u32 = 0x0;

/// Section bases after text are aligned to this.
pub const SECTION_ALIGN     : u32 = 4096;

/// `.align`/`.p2align` exponents must stay below this.
pub const MAX_ALIGN_SHIFT   : u64 = 20;

pub const REGISTER_COUNT    : usize = 32;

pub const DEFAULT_TIMEOUT        : u64 = 1 << 40;
pub const DEFAULT_STACK_SIZE     : u32 = 16 << 20;
pub const DEFAULT_STORAGE_SIZE   : u64 = 512 << 20;
pub const DEFAULT_PREDICTOR_SIZE : usize = 4096;
