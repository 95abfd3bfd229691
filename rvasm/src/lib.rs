//! Assembler and linker for the RV32IM simulator.
//!
//! [`Assembly::parse`] turns one GNU-as-flavored source file into an ordered
//! vector of storage items plus a label table; [`link`] merges any number of
//! such units with the intrinsic libc symbols into the flat
//! [`rvcpu::MemoryLayout`] the machine executes.
//!
//! Line structure, strings and comments are handled by a [pest] grammar;
//! operand tokens stay raw in the parse tree and are interpreted per
//! mnemonic, so directives with unusual payloads (`.type f, @function`,
//! `.size main, .-main`) pass through without special cases. The crate's
//! [`Error`] type is a `pest::error::Error` alias, so pest's pretty caret
//! rendering is available for every assembly-stage diagnostic.
//!
//! # Supported input
//!
//! Sections `.text`/`.data`/`.sdata`/`.rodata`/`.srodata`/`.bss`/`.sbss`
//! (also via `.section`), `.globl`, `.align`/`.p2align`/`.balign`, integer
//! data in byte/half/word widths (comma-separated lists, symbols allowed),
//! `.string`/`.asciz`, `.zero`, and the RV32IM instruction set with the
//! usual pseudo-instructions (`mv`, `li`, `neg`, `not`, `seqz`..`sltz`,
//! `beqz`..`bgez`, `ble`/`bgt`/`bleu`/`bgtu`, `j`, `jr`, `ret`, `call`,
//! `tail`, `la`). `.size`, `.type`, `.file` and `.attribute` are accepted
//! and ignored; unknown directives warn once per name.
//!
//! [pest]: https://docs.rs/pest/

mod assembler;
pub mod error;
mod instructions;
mod linker;
mod literals;
mod parser;
mod storage;

use pest::Span;

pub use assembler::{Assembly, LabelData, LabelSite};
pub use error::LinkError;
pub use linker::link;
pub use parser::{AsmParser, Rule};
pub use storage::{Instruction, IntKind, Section, Storage, Value};

pub type Error = pest::error::Error<Rule>;

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn new_parser_error(span: Span, message: String) -> Error {
    Error::new_from_span(pest::error::ErrorVariant::CustomError { message }, span)
}
