//! Typed view of the RV32IM instruction words.
//!
//! [`Command::decode`] is the only path from a raw 32-bit word to a typed
//! instruction; [`Command::encode`] is its inverse on every supported
//! encoding.

use num_traits::FromPrimitive;

use crate::fault::Fault;
use crate::register::Register;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadOp {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreOp {
    Sb,
    Sh,
    Sw,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BranchOp {
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
}

/// One decoded instruction. `imm` is always the sign-extended byte value;
/// for `Lui`/`Auipc` it is the already-shifted 32-bit constant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    Arith {
        op: ArithOp,
        rd: Register,
        rs1: Register,
        rs2: Register,
    },
    ArithImm {
        op: ArithOp,
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    Load {
        op: LoadOp,
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    Store {
        op: StoreOp,
        rs1: Register,
        rs2: Register,
        imm: i32,
    },
    Branch {
        op: BranchOp,
        rs1: Register,
        rs2: Register,
        imm: i32,
    },
    Lui {
        rd: Register,
        imm: i32,
    },
    Auipc {
        rd: Register,
        imm: i32,
    },
    Jal {
        rd: Register,
        imm: i32,
    },
    Jalr {
        rd: Register,
        rs1: Register,
        imm: i32,
    },
}

const OPCODE_ARITH: u32 = 0b011_0011;
const OPCODE_ARITH_IMM: u32 = 0b001_0011;
const OPCODE_LOAD: u32 = 0b000_0011;
const OPCODE_STORE: u32 = 0b010_0011;
const OPCODE_BRANCH: u32 = 0b110_0011;
const OPCODE_LUI: u32 = 0b011_0111;
const OPCODE_AUIPC: u32 = 0b001_0111;
const OPCODE_JAL: u32 = 0b110_1111;
const OPCODE_JALR: u32 = 0b110_0111;

const FUNCT7_BASE: u32 = 0b000_0000;
const FUNCT7_ALT: u32 = 0b010_0000;
const FUNCT7_MULDIV: u32 = 0b000_0001;

fn int_to_reg(bits: u32) -> Register {
    Register::from_u32(bits & 0x1F).unwrap()
}

fn get_opcode(word: u32) -> u32 {
    word & 0x7F
}

fn get_rd(word: u32) -> Register {
    int_to_reg(word >> 7)
}

fn get_rs1(word: u32) -> Register {
    int_to_reg(word >> 15)
}

fn get_rs2(word: u32) -> Register {
    int_to_reg(word >> 20)
}

fn get_funct3(word: u32) -> u32 {
    (word >> 12) & 0x7
}

fn get_funct7(word: u32) -> u32 {
    word >> 25
}

fn i_imm(word: u32) -> i32 {
    (word as i32) >> 20
}

fn s_imm(word: u32) -> i32 {
    (((word as i32) >> 25) << 5) | (((word >> 7) & 0x1F) as i32)
}

fn b_imm(word: u32) -> i32 {
    (((word as i32) >> 31) << 12)
        | ((((word >> 7) & 0x1) as i32) << 11)
        | ((((word >> 25) & 0x3F) as i32) << 5)
        | ((((word >> 8) & 0xF) as i32) << 1)
}

fn u_imm(word: u32) -> i32 {
    (word & 0xFFFF_F000) as i32
}

fn j_imm(word: u32) -> i32 {
    (((word as i32) >> 31) << 20)
        | ((((word >> 12) & 0xFF) as i32) << 12)
        | ((((word >> 20) & 0x1) as i32) << 11)
        | ((((word >> 21) & 0x3FF) as i32) << 1)
}

fn encode_r(funct7: u32, rs2: Register, rs1: Register, funct3: u32, rd: Register, opcode: u32) -> u32 {
    (funct7 << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((rd as u32) << 7)
        | opcode
}

fn encode_i(imm: i32, rs1: Register, funct3: u32, rd: Register, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((rd as u32) << 7)
        | opcode
}

fn encode_s(imm: i32, rs2: Register, rs1: Register, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((imm & 0x1F) << 7)
        | opcode
}

fn encode_b(imm: i32, rs2: Register, rs1: Register, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 0x1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 0x1) << 7)
        | opcode
}

fn encode_u(imm: i32, rd: Register, opcode: u32) -> u32 {
    ((imm as u32) & 0xFFFF_F000) | ((rd as u32) << 7) | opcode
}

fn encode_j(imm: i32, rd: Register, opcode: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 0x1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 0x1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | ((rd as u32) << 7)
        | opcode
}

fn arith_funct3(op: ArithOp) -> u32 {
    use ArithOp::*;
    match op {
        Add | Sub | Mul => 0,
        Sll | Mulh => 1,
        Slt | Mulhsu => 2,
        Sltu | Mulhu => 3,
        Xor | Div => 4,
        Srl | Sra | Divu => 5,
        Or | Rem => 6,
        And | Remu => 7,
    }
}

fn arith_funct7(op: ArithOp) -> u32 {
    use ArithOp::*;
    match op {
        Sub | Sra => FUNCT7_ALT,
        Mul | Mulh | Mulhsu | Mulhu | Div | Divu | Rem | Remu => FUNCT7_MULDIV,
        _ => FUNCT7_BASE,
    }
}

fn load_funct3(op: LoadOp) -> u32 {
    match op {
        LoadOp::Lb => 0,
        LoadOp::Lh => 1,
        LoadOp::Lw => 2,
        LoadOp::Lbu => 4,
        LoadOp::Lhu => 5,
    }
}

fn store_funct3(op: StoreOp) -> u32 {
    match op {
        StoreOp::Sb => 0,
        StoreOp::Sh => 1,
        StoreOp::Sw => 2,
    }
}

fn branch_funct3(op: BranchOp) -> u32 {
    match op {
        BranchOp::Beq => 0,
        BranchOp::Bne => 1,
        BranchOp::Blt => 4,
        BranchOp::Bge => 5,
        BranchOp::Bltu => 6,
        BranchOp::Bgeu => 7,
    }
}

fn decode_arith(word: u32) -> Result<Command, Fault> {
    use ArithOp::*;
    let op = match (get_funct7(word), get_funct3(word)) {
        (FUNCT7_BASE, 0) => Add,
        (FUNCT7_ALT, 0) => Sub,
        (FUNCT7_BASE, 1) => Sll,
        (FUNCT7_BASE, 2) => Slt,
        (FUNCT7_BASE, 3) => Sltu,
        (FUNCT7_BASE, 4) => Xor,
        (FUNCT7_BASE, 5) => Srl,
        (FUNCT7_ALT, 5) => Sra,
        (FUNCT7_BASE, 6) => Or,
        (FUNCT7_BASE, 7) => And,
        (FUNCT7_MULDIV, 0) => Mul,
        (FUNCT7_MULDIV, 1) => Mulh,
        (FUNCT7_MULDIV, 2) => Mulhsu,
        (FUNCT7_MULDIV, 3) => Mulhu,
        (FUNCT7_MULDIV, 4) => Div,
        (FUNCT7_MULDIV, 5) => Divu,
        (FUNCT7_MULDIV, 6) => Rem,
        (FUNCT7_MULDIV, 7) => Remu,
        _ => return Err(Fault::unknown_instruction(word)),
    };
    Ok(Command::Arith {
        op,
        rd: get_rd(word),
        rs1: get_rs1(word),
        rs2: get_rs2(word),
    })
}

fn decode_arith_imm(word: u32) -> Result<Command, Fault> {
    use ArithOp::*;
    let shamt = ((word >> 20) & 0x1F) as i32;
    let (op, imm) = match get_funct3(word) {
        0 => (Add, i_imm(word)),
        2 => (Slt, i_imm(word)),
        3 => (Sltu, i_imm(word)),
        4 => (Xor, i_imm(word)),
        6 => (Or, i_imm(word)),
        7 => (And, i_imm(word)),
        1 => match get_funct7(word) {
            FUNCT7_BASE => (Sll, shamt),
            _ => return Err(Fault::unknown_instruction(word)),
        },
        5 => match get_funct7(word) {
            FUNCT7_BASE => (Srl, shamt),
            FUNCT7_ALT => (Sra, shamt),
            _ => return Err(Fault::unknown_instruction(word)),
        },
        _ => unreachable!(),
    };
    Ok(Command::ArithImm {
        op,
        rd: get_rd(word),
        rs1: get_rs1(word),
        imm,
    })
}

fn decode_load(word: u32) -> Result<Command, Fault> {
    let op = match get_funct3(word) {
        0 => LoadOp::Lb,
        1 => LoadOp::Lh,
        2 => LoadOp::Lw,
        4 => LoadOp::Lbu,
        5 => LoadOp::Lhu,
        _ => return Err(Fault::unknown_instruction(word)),
    };
    Ok(Command::Load {
        op,
        rd: get_rd(word),
        rs1: get_rs1(word),
        imm: i_imm(word),
    })
}

fn decode_store(word: u32) -> Result<Command, Fault> {
    let op = match get_funct3(word) {
        0 => StoreOp::Sb,
        1 => StoreOp::Sh,
        2 => StoreOp::Sw,
        _ => return Err(Fault::unknown_instruction(word)),
    };
    Ok(Command::Store {
        op,
        rs1: get_rs1(word),
        rs2: get_rs2(word),
        imm: s_imm(word),
    })
}

fn decode_branch(word: u32) -> Result<Command, Fault> {
    let op = match get_funct3(word) {
        0 => BranchOp::Beq,
        1 => BranchOp::Bne,
        4 => BranchOp::Blt,
        5 => BranchOp::Bge,
        6 => BranchOp::Bltu,
        7 => BranchOp::Bgeu,
        _ => return Err(Fault::unknown_instruction(word)),
    };
    Ok(Command::Branch {
        op,
        rs1: get_rs1(word),
        rs2: get_rs2(word),
        imm: b_imm(word),
    })
}

impl Command {
    pub fn decode(word: u32) -> Result<Command, Fault> {
        match get_opcode(word) {
            OPCODE_ARITH => decode_arith(word),
            OPCODE_ARITH_IMM => decode_arith_imm(word),
            OPCODE_LOAD => decode_load(word),
            OPCODE_STORE => decode_store(word),
            OPCODE_BRANCH => decode_branch(word),
            OPCODE_LUI => Ok(Command::Lui {
                rd: get_rd(word),
                imm: u_imm(word),
            }),
            OPCODE_AUIPC => Ok(Command::Auipc {
                rd: get_rd(word),
                imm: u_imm(word),
            }),
            OPCODE_JAL => Ok(Command::Jal {
                rd: get_rd(word),
                imm: j_imm(word),
            }),
            OPCODE_JALR => {
                if get_funct3(word) != 0 {
                    return Err(Fault::unknown_instruction(word));
                }
                Ok(Command::Jalr {
                    rd: get_rd(word),
                    rs1: get_rs1(word),
                    imm: i_imm(word),
                })
            }
            _ => Err(Fault::unknown_instruction(word)),
        }
    }

    pub fn encode(&self) -> u32 {
        use ArithOp::*;
        match *self {
            Command::Arith { op, rd, rs1, rs2 } => encode_r(
                arith_funct7(op),
                rs2,
                rs1,
                arith_funct3(op),
                rd,
                OPCODE_ARITH,
            ),
            Command::ArithImm { op, rd, rs1, imm } => {
                let imm = match op {
                    Sll | Srl | Sra => (imm & 0x1F) | ((arith_funct7(op) as i32) << 5),
                    _ => imm,
                };
                encode_i(imm, rs1, arith_funct3(op), rd, OPCODE_ARITH_IMM)
            }
            Command::Load { op, rd, rs1, imm } => {
                encode_i(imm, rs1, load_funct3(op), rd, OPCODE_LOAD)
            }
            Command::Store { op, rs1, rs2, imm } => {
                encode_s(imm, rs2, rs1, store_funct3(op), OPCODE_STORE)
            }
            Command::Branch { op, rs1, rs2, imm } => {
                encode_b(imm, rs2, rs1, branch_funct3(op), OPCODE_BRANCH)
            }
            Command::Lui { rd, imm } => encode_u(imm, rd, OPCODE_LUI),
            Command::Auipc { rd, imm } => encode_u(imm, rd, OPCODE_AUIPC),
            Command::Jal { rd, imm } => encode_j(imm, rd, OPCODE_JAL),
            Command::Jalr { rd, rs1, imm } => encode_i(imm, rs1, 0, rd, OPCODE_JALR),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::register::Register::*;

    #[test]
    fn decode_known_words() {
        // addi a0, zero, 2
        assert_eq!(
            Command::decode(0x0020_0513).unwrap(),
            Command::ArithImm {
                op: ArithOp::Add,
                rd: A0,
                rs1: Zero,
                imm: 2
            }
        );
        // add a0, a0, a1
        assert_eq!(
            Command::decode(0x00B5_0533).unwrap(),
            Command::Arith {
                op: ArithOp::Add,
                rd: A0,
                rs1: A0,
                rs2: A1
            }
        );
        // jalr zero, ra, 0
        assert_eq!(
            Command::decode(0x0000_8067).unwrap(),
            Command::Jalr {
                rd: Zero,
                rs1: Ra,
                imm: 0
            }
        );
        // div a0, a0, a1
        assert_eq!(
            Command::decode(0x02B5_4533).unwrap(),
            Command::Arith {
                op: ArithOp::Div,
                rd: A0,
                rs1: A0,
                rs2: A1
            }
        );
        // lui a1, 0x1
        assert_eq!(
            Command::decode(0x0000_15B7).unwrap(),
            Command::Lui { rd: A1, imm: 0x1000 }
        );
    }

    #[test]
    fn unknown_words_rejected() {
        assert!(Command::decode(0x0000_0000).is_err());
        assert!(Command::decode(0xFFFF_FFFF).is_err());
        // slli with a non-canonical funct7
        assert!(Command::decode(0x4000_1093).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let words = [
            0x0020_0513, // addi a0, zero, 2
            0x00B5_0533, // add a0, a0, a1
            0x0000_8067, // jalr zero, ra, 0
            0x02B5_4533, // div a0, a0, a1
            0x0000_15B7, // lui a1, 0x1
            0xFE52_9EE3, // bne t0, t0, -4
            0x0000_006F, // jal zero, 0
            0xFFC1_0113, // addi sp, sp, -4
            0x0001_2A03, // lw s4, 0(sp)
            0x0141_2023, // sw s4, 0(sp)
            0x4050_D093, // srai ra, ra, 5
            0x0017_9793, // slli a5, a5, 1
            0x0000_0517, // auipc a0, 0
        ];
        for &word in words.iter() {
            let command = Command::decode(word).unwrap();
            assert_eq!(command.encode(), word, "word {:#010x}", word);
        }
    }

    #[test]
    fn decode_encode_roundtrip() {
        let commands = [
            Command::Branch {
                op: BranchOp::Bgeu,
                rs1: T0,
                rs2: A7,
                imm: -2048,
            },
            Command::Jal { rd: Ra, imm: 0xFF00 },
            Command::Store {
                op: StoreOp::Sb,
                rs1: Sp,
                rs2: T1,
                imm: -1,
            },
            Command::Auipc {
                rd: A0,
                imm: 0x7FFF_F000,
            },
            Command::ArithImm {
                op: ArithOp::Sra,
                rd: S3,
                rs1: S4,
                imm: 31,
            },
        ];
        for &command in commands.iter() {
            assert_eq!(Command::decode(command.encode()).unwrap(), command);
        }
    }
}
