//! Decode-cache slots and the specialized instruction handlers.
//!
//! Every text word owns one `(handler, packed operands)` slot. A slot
//! starts out on [`decode`], which parses the word once, rewrites the slot
//! and tail-calls the result; afterwards execution never switches over an
//! opcode again.

use crate::command::{ArithOp, BranchOp, Command, LoadOp, StoreOp};
use crate::constants::WORD_BYTES;
use crate::device::Device;
use crate::fault::Fault;
use crate::libc;
use crate::memory::Memory;
use crate::register::RegisterFile;

pub type Handler =
    fn(Metadata, &mut RegisterFile, &mut Memory, &mut Device) -> Result<(), Fault>;

/// Preparsed operands, packed into one machine word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

#[derive(Clone, Copy)]
pub struct Executable {
    handler: Handler,
    meta: Metadata,
}

impl Executable {
    pub fn new(handler: Handler, meta: Metadata) -> Executable {
        Executable { handler, meta }
    }

    /// The initial state of every user-text slot.
    pub fn decode_slot() -> Executable {
        Executable::new(decode, Metadata::default())
    }

    /// A slot that dispatches into the libc table.
    pub fn libc_slot(index: usize) -> Executable {
        Executable::new(
            libc_stub,
            Metadata {
                imm: index as i32,
                ..Metadata::default()
            },
        )
    }

    pub fn run(
        &self,
        rf: &mut RegisterFile,
        mem: &mut Memory,
        dev: &mut Device,
    ) -> Result<(), Fault> {
        (self.handler)(self.meta, rf, mem, dev)
    }
}

/// Generic decode handler: parses the word at `pc`, replaces its own slot
/// with the specialized handler and invokes it. Runs at most once per text
/// address.
fn decode(
    _meta: Metadata,
    rf: &mut RegisterFile,
    mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    let pc = rf.pc();
    dev.counter.iparse += 1;
    let word = mem.load_cmd(pc)?;
    let exe = from_word(word)?;
    mem.set_executable(pc, exe);
    exe.run(rf, mem, dev)
}

fn libc_stub(
    meta: Metadata,
    rf: &mut RegisterFile,
    mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    libc::invoke(meta.imm as usize, rf, mem, dev)
}

macro_rules! arith_reg_handler {
    ($name:ident, $counter:ident, |$rs1:ident, $rs2:ident| $value:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            _mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $rs1 = rf.read(meta.rs1);
            let $rs2 = rf.read(meta.rs2);
            rf.write(meta.rd, $value);
            dev.counter.$counter += 1;
            rf.step();
            Ok(())
        }
    };
}

arith_reg_handler!(add, add, |rs1, rs2| rs1.wrapping_add(rs2));
arith_reg_handler!(sub, sub, |rs1, rs2| rs1.wrapping_sub(rs2));
arith_reg_handler!(and, and, |rs1, rs2| rs1 & rs2);
arith_reg_handler!(or, or, |rs1, rs2| rs1 | rs2);
arith_reg_handler!(xor, xor, |rs1, rs2| rs1 ^ rs2);
arith_reg_handler!(sll, sll, |rs1, rs2| rs1 << (rs2 & 0x1F));
arith_reg_handler!(srl, srl, |rs1, rs2| rs1 >> (rs2 & 0x1F));
arith_reg_handler!(sra, sra, |rs1, rs2| ((rs1 as i32) >> (rs2 & 0x1F)) as u32);
arith_reg_handler!(slt, slt, |rs1, rs2| ((rs1 as i32) < (rs2 as i32)) as u32);
arith_reg_handler!(sltu, sltu, |rs1, rs2| (rs1 < rs2) as u32);
arith_reg_handler!(mul, mul, |rs1, rs2| rs1.wrapping_mul(rs2));
arith_reg_handler!(mulh, mulh, |rs1, rs2| {
    ((rs1 as i32 as i64).wrapping_mul(rs2 as i32 as i64) >> 32) as u32
});
arith_reg_handler!(mulhsu, mulhsu, |rs1, rs2| {
    ((rs1 as i32 as i64).wrapping_mul(rs2 as i64) >> 32) as u32
});
arith_reg_handler!(mulhu, mulhu, |rs1, rs2| {
    ((rs1 as u64 * rs2 as u64) >> 32) as u32
});

macro_rules! divide_handler {
    ($name:ident, $counter:ident, |$rs1:ident, $rs2:ident| $value:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            _mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $rs1 = rf.read(meta.rs1);
            let $rs2 = rf.read(meta.rs2);
            if $rs2 == 0 {
                return Err(Fault::divide_by_zero());
            }
            rf.write(meta.rd, $value);
            dev.counter.$counter += 1;
            rf.step();
            Ok(())
        }
    };
}

divide_handler!(div, div, |rs1, rs2| (rs1 as i32).wrapping_div(rs2 as i32)
    as u32);
divide_handler!(divu, divu, |rs1, rs2| rs1 / rs2);
divide_handler!(rem, rem, |rs1, rs2| (rs1 as i32).wrapping_rem(rs2 as i32)
    as u32);
divide_handler!(remu, remu, |rs1, rs2| rs1 % rs2);

macro_rules! arith_imm_handler {
    ($name:ident, $counter:ident, |$rs1:ident, $imm:ident| $value:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            _mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $rs1 = rf.read(meta.rs1);
            let $imm = meta.imm as u32;
            rf.write(meta.rd, $value);
            dev.counter.$counter += 1;
            rf.step();
            Ok(())
        }
    };
}

arith_imm_handler!(addi, add, |rs1, imm| rs1.wrapping_add(imm));
arith_imm_handler!(andi, and, |rs1, imm| rs1 & imm);
arith_imm_handler!(ori, or, |rs1, imm| rs1 | imm);
arith_imm_handler!(xori, xor, |rs1, imm| rs1 ^ imm);
arith_imm_handler!(slli, sll, |rs1, imm| rs1 << (imm & 0x1F));
arith_imm_handler!(srli, srl, |rs1, imm| rs1 >> (imm & 0x1F));
arith_imm_handler!(srai, sra, |rs1, imm| ((rs1 as i32) >> (imm & 0x1F)) as u32);
arith_imm_handler!(slti, slt, |rs1, imm| ((rs1 as i32) < (imm as i32)) as u32);
arith_imm_handler!(sltiu, sltu, |rs1, imm| (rs1 < imm) as u32);

macro_rules! load_handler {
    ($name:ident, $counter:ident, |$mem:ident, $addr:ident| $value:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            $mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $addr = rf.read(meta.rs1).wrapping_add(meta.imm as u32);
            let value = $value;
            rf.write(meta.rd, value);
            dev.counter.$counter += 1;
            rf.step();
            Ok(())
        }
    };
}

load_handler!(lb, lb, |mem, addr| mem.load_i8(addr)? as u32);
load_handler!(lh, lh, |mem, addr| mem.load_i16(addr)? as u32);
load_handler!(lw, lw, |mem, addr| mem.load_i32(addr)? as u32);
load_handler!(lbu, lbu, |mem, addr| mem.load_u8(addr)? as u32);
load_handler!(lhu, lhu, |mem, addr| mem.load_u16(addr)? as u32);

macro_rules! store_handler {
    ($name:ident, $counter:ident, |$mem:ident, $addr:ident, $value:ident| $store:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            $mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $addr = rf.read(meta.rs1).wrapping_add(meta.imm as u32);
            let $value = rf.read(meta.rs2);
            $store?;
            dev.counter.$counter += 1;
            rf.step();
            Ok(())
        }
    };
}

store_handler!(sb, sb, |mem, addr, value| mem.store_u8(addr, value as u8));
store_handler!(sh, sh, |mem, addr, value| mem.store_u16(addr, value as u16));
store_handler!(sw, sw, |mem, addr, value| mem.store_u32(addr, value));

macro_rules! branch_handler {
    ($name:ident, $counter:ident, |$rs1:ident, $rs2:ident| $taken:expr) => {
        fn $name(
            meta: Metadata,
            rf: &mut RegisterFile,
            _mem: &mut Memory,
            dev: &mut Device,
        ) -> Result<(), Fault> {
            let $rs1 = rf.read(meta.rs1);
            let $rs2 = rf.read(meta.rs2);
            let taken = $taken;
            dev.counter.$counter += 1;
            dev.predict(rf.pc(), taken);
            if taken {
                rf.set_pc(rf.pc().wrapping_add(meta.imm as u32));
            } else {
                rf.step();
            }
            Ok(())
        }
    };
}

branch_handler!(beq, beq, |rs1, rs2| rs1 == rs2);
branch_handler!(bne, bne, |rs1, rs2| rs1 != rs2);
branch_handler!(blt, blt, |rs1, rs2| (rs1 as i32) < (rs2 as i32));
branch_handler!(bge, bge, |rs1, rs2| (rs1 as i32) >= (rs2 as i32));
branch_handler!(bltu, bltu, |rs1, rs2| rs1 < rs2);
branch_handler!(bgeu, bgeu, |rs1, rs2| rs1 >= rs2);

fn jal(
    meta: Metadata,
    rf: &mut RegisterFile,
    _mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    let pc = rf.pc();
    rf.write(meta.rd, pc.wrapping_add(WORD_BYTES));
    rf.set_pc(pc.wrapping_add(meta.imm as u32));
    dev.counter.jal += 1;
    Ok(())
}

fn jalr(
    meta: Metadata,
    rf: &mut RegisterFile,
    _mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    let target = rf.read(meta.rs1).wrapping_add(meta.imm as u32) & !1;
    rf.write(meta.rd, rf.pc().wrapping_add(WORD_BYTES));
    rf.set_pc(target);
    dev.counter.jalr += 1;
    Ok(())
}

fn lui(
    meta: Metadata,
    rf: &mut RegisterFile,
    _mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    rf.write(meta.rd, meta.imm as u32);
    dev.counter.lui += 1;
    rf.step();
    Ok(())
}

fn auipc(
    meta: Metadata,
    rf: &mut RegisterFile,
    _mem: &mut Memory,
    dev: &mut Device,
) -> Result<(), Fault> {
    rf.write(meta.rd, rf.pc().wrapping_add(meta.imm as u32));
    dev.counter.auipc += 1;
    rf.step();
    Ok(())
}

fn arith_reg_fn(op: ArithOp) -> Handler {
    use ArithOp::*;
    match op {
        Add => add,
        Sub => sub,
        And => and,
        Or => or,
        Xor => xor,
        Sll => sll,
        Srl => srl,
        Sra => sra,
        Slt => slt,
        Sltu => sltu,
        Mul => mul,
        Mulh => mulh,
        Mulhsu => mulhsu,
        Mulhu => mulhu,
        Div => div,
        Divu => divu,
        Rem => rem,
        Remu => remu,
    }
}

fn arith_imm_fn(op: ArithOp) -> Handler {
    use ArithOp::*;
    match op {
        Add => addi,
        And => andi,
        Or => ori,
        Xor => xori,
        Sll => slli,
        Srl => srli,
        Sra => srai,
        Slt => slti,
        Sltu => sltiu,
        _ => unreachable!(),
    }
}

fn load_fn(op: LoadOp) -> Handler {
    match op {
        LoadOp::Lb => lb,
        LoadOp::Lh => lh,
        LoadOp::Lw => lw,
        LoadOp::Lbu => lbu,
        LoadOp::Lhu => lhu,
    }
}

fn store_fn(op: StoreOp) -> Handler {
    match op {
        StoreOp::Sb => sb,
        StoreOp::Sh => sh,
        StoreOp::Sw => sw,
    }
}

fn branch_fn(op: BranchOp) -> Handler {
    match op {
        BranchOp::Beq => beq,
        BranchOp::Bne => bne,
        BranchOp::Blt => blt,
        BranchOp::Bge => bge,
        BranchOp::Bltu => bltu,
        BranchOp::Bgeu => bgeu,
    }
}

/// Decodes a raw instruction word into its specialized slot.
pub fn from_word(word: u32) -> Result<Executable, Fault> {
    let (handler, meta): (Handler, Metadata) = match Command::decode(word)? {
        Command::Arith { op, rd, rs1, rs2 } => (
            arith_reg_fn(op),
            Metadata {
                rd: rd as u8,
                rs1: rs1 as u8,
                rs2: rs2 as u8,
                imm: 0,
            },
        ),
        Command::ArithImm { op, rd, rs1, imm } => (
            arith_imm_fn(op),
            Metadata {
                rd: rd as u8,
                rs1: rs1 as u8,
                rs2: 0,
                imm,
            },
        ),
        Command::Load { op, rd, rs1, imm } => (
            load_fn(op),
            Metadata {
                rd: rd as u8,
                rs1: rs1 as u8,
                rs2: 0,
                imm,
            },
        ),
        Command::Store { op, rs1, rs2, imm } => (
            store_fn(op),
            Metadata {
                rd: 0,
                rs1: rs1 as u8,
                rs2: rs2 as u8,
                imm,
            },
        ),
        Command::Branch { op, rs1, rs2, imm } => (
            branch_fn(op),
            Metadata {
                rd: 0,
                rs1: rs1 as u8,
                rs2: rs2 as u8,
                imm,
            },
        ),
        Command::Lui { rd, imm } => (
            lui,
            Metadata {
                rd: rd as u8,
                rs1: 0,
                rs2: 0,
                imm,
            },
        ),
        Command::Auipc { rd, imm } => (
            auipc,
            Metadata {
                rd: rd as u8,
                rs1: 0,
                rs2: 0,
                imm,
            },
        ),
        Command::Jal { rd, imm } => (
            jal,
            Metadata {
                rd: rd as u8,
                rs1: 0,
                rs2: 0,
                imm,
            },
        ),
        Command::Jalr { rd, rs1, imm } => (
            jalr,
            Metadata {
                rd: rd as u8,
                rs1: rs1 as u8,
                rs2: 0,
                imm,
            },
        ),
    };
    Ok(Executable::new(handler, meta))
}
