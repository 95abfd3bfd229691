use std::error::Error as StdError;
use std::fmt;

/// Everything that can abort interpretation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultKind {
    InsMisAligned,
    InsOutOfBound,
    InsUnknown,
    LoadMisAligned,
    LoadOutOfBound,
    StoreMisAligned,
    StoreOutOfBound,
    DivideByZero,
    TimeLimitExceeded,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed interpreter fault. Faults are not recoverable; the loop
/// translates them into program termination.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fault {
    pub kind: FaultKind,
    pub pc: Option<u32>,
    pub address: Option<u32>,
    pub size: Option<u32>,
    pub alignment: Option<u32>,
    pub command: Option<u32>,
}

impl Fault {
    fn new(kind: FaultKind) -> Fault {
        Fault {
            kind,
            pc: None,
            address: None,
            size: None,
            alignment: None,
            command: None,
        }
    }

    pub fn misaligned(kind: FaultKind, address: u32, alignment: u32) -> Fault {
        Fault {
            address: Some(address),
            alignment: Some(alignment),
            ..Fault::new(kind)
        }
    }

    pub fn out_of_bound(kind: FaultKind, address: u32, size: u32) -> Fault {
        Fault {
            address: Some(address),
            size: Some(size),
            ..Fault::new(kind)
        }
    }

    pub fn unknown_instruction(command: u32) -> Fault {
        Fault {
            command: Some(command),
            ..Fault::new(FaultKind::InsUnknown)
        }
    }

    pub fn divide_by_zero() -> Fault {
        Fault::new(FaultKind::DivideByZero)
    }

    pub fn time_limit_exceeded() -> Fault {
        Fault::new(FaultKind::TimeLimitExceeded)
    }

    /// Attaches the program counter of the faulting instruction.
    pub fn at(mut self, pc: u32) -> Fault {
        self.pc = Some(pc);
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(pc) = self.pc {
            write!(f, " at pc {:#x}", pc)?;
        }
        if let Some(address) = self.address {
            write!(f, ": address = {:#x}", address)?;
        }
        if let Some(alignment) = self.alignment {
            write!(f, ", alignment = {}", alignment)?;
        }
        if let Some(size) = self.size {
            write!(f, ", size = {}", size)?;
        }
        if let Some(command) = self.command {
            write!(f, ": command = {:#010x}", command)?;
        }
        Ok(())
    }
}

impl StdError for Fault {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_misaligned_load() {
        let fault = Fault::misaligned(FaultKind::LoadMisAligned, 1, 4).at(0x10010);
        assert_eq!(
            fault.to_string(),
            "LoadMisAligned at pc 0x10010: address = 0x1, alignment = 4"
        );
    }
}
