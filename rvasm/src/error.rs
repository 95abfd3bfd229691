use std::fmt::Write;

use thiserror::Error;

/// Link-stage failures. Unlike assembly errors these span files, so they
/// carry names instead of source positions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("duplicate global symbol \"{name}\"")]
    DuplicateSymbol { name: String },

    #[error("global symbol \"{name}\" conflicts with libc")]
    LibcConflict { name: String },

    #[error("symbol \"{name}\" is declared global, but not defined (in {file})")]
    UndefinedGlobal { name: String, file: String },

    #[error("undefined symbol \"{name}\"")]
    Undefined { name: String },

    #[error("immediate out of range at pc {pc:#x}: {value}")]
    ImmediateOutOfRange { pc: u32, value: i64 },

    #[error("no main function found")]
    MissingMain,

    #[error("sections overlap")]
    Overlap,
}

/// A three-line window around `line` (1-based): previous, offending and
/// next source line, each prefixed with its number.
pub fn source_window(source: &str, line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = String::new();
    let first = line.saturating_sub(1).max(1);
    for number in first..=line + 1 {
        if number >= 1 && number <= lines.len() {
            let _ = writeln!(out, "{: >4}  |  {}", number, lines[number - 1]);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_clamps_at_edges() {
        let source = "one\ntwo\nthree";
        assert_eq!(source_window(source, 1), "   1  |  one\n   2  |  two\n");
        assert_eq!(
            source_window(source, 2),
            "   1  |  one\n   2  |  two\n   3  |  three\n"
        );
        assert_eq!(source_window(source, 3), "   2  |  two\n   3  |  three\n");
    }
}
