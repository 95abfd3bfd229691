use std::fmt::Write as FmtWrite;
use std::io::{BufRead, Write};

use crate::config::Config;
use crate::predictor::BranchPredictor;

macro_rules! counter_struct {
    ($($name:ident),* $(,)?) => {
        /// One execution count per opcode, plus `iparse`, the number of
        /// distinct text addresses that were decoded.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct Counter {
            $(pub $name: u64,)*
            pub iparse: u64,
        }

        impl Counter {
            /// Opcode name/count pairs in declaration order, `iparse` excluded.
            pub fn entries(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name),)*]
            }
        }
    };
}

counter_struct!(
    add, sub, and, or, xor, sll, srl, sra, slt, sltu, mul, mulh, mulhsu, mulhu, div, divu, rem,
    remu, lb, lh, lw, lbu, lhu, sb, sh, sw, beq, bne, blt, bge, bltu, bgeu, jal, jalr, lui, auipc,
);

impl Counter {
    pub fn total(&self) -> u64 {
        self.entries().iter().map(|&(_, count)| count).sum()
    }

    pub fn branch_total(&self) -> u64 {
        self.beq + self.bne + self.blt + self.bge + self.bltu + self.bgeu
    }
}

/// The machine's single device: host I/O streams, the opcode counters and
/// the optional branch predictor.
pub struct Device<'io> {
    pub counter: Counter,
    input: &'io mut dyn BufRead,
    output: &'io mut dyn Write,
    predictor: Option<BranchPredictor>,
    bp_failed: u64,
    peeked: Option<u8>,
}

impl<'io> Device<'io> {
    pub fn new(
        config: &Config,
        input: &'io mut dyn BufRead,
        output: &'io mut dyn Write,
    ) -> Device<'io> {
        let predictor = if config.predictor {
            Some(BranchPredictor::new(config.predictor_size))
        } else {
            None
        };
        Device {
            counter: Counter::default(),
            input,
            output,
            predictor,
            bp_failed: 0,
            peeked: None,
        }
    }

    /// Called by every branch handler with the actual outcome. Counts a
    /// miss when the prediction disagrees, then trains the predictor.
    pub fn predict(&mut self, pc: u32, taken: bool) {
        if let Some(bp) = &mut self.predictor {
            if bp.predict(pc) != taken {
                self.bp_failed += 1;
            }
            bp.update(pc, taken);
        }
    }

    pub fn bp_failed(&self) -> u64 {
        self.bp_failed
    }

    /// Reads one byte from the input stream; `None` at end of input.
    pub fn read_byte(&mut self) -> Option<u8> {
        if let Some(byte) = self.peeked.take() {
            return Some(byte);
        }
        let mut buffer = [0u8; 1];
        match self.input.read(&mut buffer) {
            Ok(1) => Some(buffer[0]),
            _ => None,
        }
    }

    /// Like [`read_byte`](Self::read_byte), but leaves the byte in place.
    pub fn peek_byte(&mut self) -> Option<u8> {
        if self.peeked.is_none() {
            self.peeked = self.read_byte();
        }
        self.peeked
    }

    /// Writes guest output. Stream failures are swallowed, matching the
    /// fire-and-forget semantics of the stubbed C streams.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let _ = self.output.write_all(bytes);
    }

    pub fn flush(&mut self) {
        let _ = self.output.flush();
    }

    /// Execution statistics: branch prediction summary, and the per-opcode
    /// table when `detail` is set.
    pub fn report(&self, detail: bool) -> String {
        let mut out = String::new();
        let total = self.counter.total();
        let _ = writeln!(out, "Instructions executed: {}", total);
        let _ = writeln!(out, "Instructions decoded:  {}", self.counter.iparse);
        if self.predictor.is_some() {
            let branches = self.counter.branch_total();
            if branches != 0 {
                let _ = writeln!(
                    out,
                    "Branch predictions: {}, failed: {}, failure rate: {:.2}%",
                    branches,
                    self.bp_failed,
                    self.bp_failed as f64 * 100.0 / branches as f64
                );
            }
        }
        if detail {
            for (name, count) in self.counter.entries() {
                if count != 0 {
                    let _ = writeln!(out, "    {:<8} {}", name, count);
                }
            }
        }
        out
    }
}
