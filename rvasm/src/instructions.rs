//! Mnemonic dispatch: turns one parsed instruction line into storage items,
//! expanding pseudo-instructions eagerly. `call`/`tail` and `la` stay
//! symbolic; their real expansion is chosen by the linker.

use matches::debug_assert_matches;
use pest::iterators::Pair;
use pest::Span;

use rvcpu::command::{ArithOp, BranchOp, LoadOp, StoreOp};
use rvcpu::Register;

use crate::assembler::Assembly;
use crate::literals::{process_int, process_value};
use crate::storage::{Instruction, Storage, Value};
use crate::{new_parser_error, Result, Rule};

fn register(pair: &Pair<Rule>) -> Result<Register> {
    if pair.as_rule() != Rule::token {
        return Err(new_parser_error(
            pair.as_span(),
            "Expected a register".to_owned(),
        ));
    }
    pair.as_str()
        .parse()
        .map_err(|err| new_parser_error(pair.as_span(), format!("{}", err)))
}

fn immediate(pair: &Pair<Rule>) -> Result<i32> {
    let value = process_int(pair)?;
    if value < i64::from(i32::min_value()) || value > u32::max_value() as i64 {
        return Err(new_parser_error(
            pair.as_span(),
            format!("Immediate out of range: {}", value),
        ));
    }
    Ok(value as i32)
}

/// An `offset(base)` memory operand; the offset may be omitted.
fn mem_operand(pair: &Pair<Rule>) -> Result<(i32, Register)> {
    if pair.as_rule() != Rule::offset_base {
        return Err(new_parser_error(
            pair.as_span(),
            "Expected offset(register)".to_owned(),
        ));
    }
    let parts: Vec<Pair<Rule>> = pair.clone().into_inner().collect();
    match parts.len() {
        1 => Ok((0, register(&parts[0])?)),
        2 => Ok((immediate(&parts[0])?, register(&parts[1])?)),
        _ => unreachable!(),
    }
}

fn symbol(pair: &Pair<Rule>) -> Result<String> {
    match process_value(pair)? {
        Value::Symbol(name) => Ok(name),
        Value::Int(_) => Err(new_parser_error(
            pair.as_span(),
            "Expected a symbol".to_owned(),
        )),
    }
}

pub(crate) fn process_instruction(assembly: &mut Assembly, pair: Pair<Rule>) -> Result<()> {
    debug_assert_matches!(pair.as_rule(), Rule::instruction);
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let mnemonic = inner.next().unwrap().as_str().to_owned();
    let args: Vec<Pair<Rule>> = inner
        .next()
        .map(|arguments| {
            arguments
                .into_inner()
                .map(|argument| argument.into_inner().next().unwrap())
                .collect()
        })
        .unwrap_or_default();

    Lowering {
        assembly,
        span,
        args,
    }
    .dispatch(&mnemonic)
}

struct Lowering<'a, 'i> {
    assembly: &'a mut Assembly,
    span: Span<'i>,
    args: Vec<Pair<'i, Rule>>,
}

impl<'a, 'i> Lowering<'a, 'i> {
    fn expect(&self, count: usize) -> Result<()> {
        if self.args.len() == count {
            Ok(())
        } else {
            Err(new_parser_error(
                self.span.clone(),
                format!(
                    "Expected {} operand(s), found {}",
                    count,
                    self.args.len()
                ),
            ))
        }
    }

    fn push(&mut self, instruction: Instruction) -> Result<()> {
        let span = self.span.clone();
        self.assembly.push(&span, Storage::Instr(instruction))
    }

    fn arith_reg(&mut self, op: ArithOp) -> Result<()> {
        self.expect(3)?;
        let rd = register(&self.args[0])?;
        let rs1 = register(&self.args[1])?;
        let rs2 = register(&self.args[2])?;
        self.push(Instruction::ArithReg { op, rd, rs1, rs2 })
    }

    fn arith_imm(&mut self, op: ArithOp) -> Result<()> {
        self.expect(3)?;
        let rd = register(&self.args[0])?;
        let rs1 = register(&self.args[1])?;
        let imm = immediate(&self.args[2])?;
        self.push(Instruction::ArithImm { op, rd, rs1, imm })
    }

    fn load(&mut self, op: LoadOp) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let (offset, base) = mem_operand(&self.args[1])?;
        self.push(Instruction::Load {
            op,
            rd,
            base,
            offset,
        })
    }

    fn store(&mut self, op: StoreOp) -> Result<()> {
        self.expect(2)?;
        let rs2 = register(&self.args[0])?;
        let (offset, base) = mem_operand(&self.args[1])?;
        self.push(Instruction::Store {
            op,
            rs2,
            base,
            offset,
        })
    }

    fn branch(&mut self, op: BranchOp, swap: bool) -> Result<()> {
        self.expect(3)?;
        let mut rs1 = register(&self.args[0])?;
        let mut rs2 = register(&self.args[1])?;
        if swap {
            std::mem::swap(&mut rs1, &mut rs2);
        }
        let target = process_value(&self.args[2])?;
        self.push(Instruction::Branch {
            op,
            rs1,
            rs2,
            target,
        })
    }

    /// `beqz` and friends: compare one register against `zero`.
    fn branch_zero(&mut self, op: BranchOp, zero_first: bool) -> Result<()> {
        self.expect(2)?;
        let rs = register(&self.args[0])?;
        let target = process_value(&self.args[1])?;
        let (rs1, rs2) = if zero_first {
            (Register::Zero, rs)
        } else {
            (rs, Register::Zero)
        };
        self.push(Instruction::Branch {
            op,
            rs1,
            rs2,
            target,
        })
    }

    fn upper(&mut self, auipc: bool) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let imm = immediate(&self.args[1])?;
        self.push(if auipc {
            Instruction::Auipc { rd, imm }
        } else {
            Instruction::Lui { rd, imm }
        })
    }

    /// Two-register pseudo-instructions that lower to one real instruction.
    fn unary(&mut self, build: fn(Register, Register) -> Instruction) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let rs = register(&self.args[1])?;
        self.push(build(rd, rs))
    }

    /// `li`: one `addi` when the constant fits 12 signed bits, else
    /// `lui`+`addi` with the sign-carry correction on the upper half.
    fn load_immediate(&mut self) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let value = immediate(&self.args[1])?;
        if (-2048..=2047).contains(&value) {
            return self.push(Instruction::ArithImm {
                op: ArithOp::Add,
                rd,
                rs1: Register::Zero,
                imm: value,
            });
        }
        let low = (value << 20) >> 20;
        let high = (value.wrapping_sub(low) as u32) >> 12;
        self.push(Instruction::Lui {
            rd,
            imm: high as i32,
        })?;
        self.push(Instruction::ArithImm {
            op: ArithOp::Add,
            rd,
            rs1: rd,
            imm: low,
        })
    }

    fn call(&mut self, tail: bool) -> Result<()> {
        self.expect(1)?;
        let target = symbol(&self.args[0])?;
        let span = self.span.clone();
        self.assembly.push(&span, Storage::Call { tail, target })
    }

    fn load_address(&mut self) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let target = symbol(&self.args[1])?;
        let span = self.span.clone();
        self.assembly
            .push(&span, Storage::LoadAddress { rd, target })
    }

    fn jal(&mut self) -> Result<()> {
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let target = process_value(&self.args[1])?;
        self.push(Instruction::Jal { rd, target })
    }

    fn jump(&mut self) -> Result<()> {
        self.expect(1)?;
        let target = process_value(&self.args[0])?;
        self.push(Instruction::Jal {
            rd: Register::Zero,
            target,
        })
    }

    /// Accepts both `jalr rd, offset(rs1)` and `jalr rd, rs1, offset`.
    fn jalr(&mut self) -> Result<()> {
        if self.args.len() == 3 {
            let rd = register(&self.args[0])?;
            let base = register(&self.args[1])?;
            let offset = immediate(&self.args[2])?;
            return self.push(Instruction::Jalr { rd, base, offset });
        }
        self.expect(2)?;
        let rd = register(&self.args[0])?;
        let (offset, base) = mem_operand(&self.args[1])?;
        self.push(Instruction::Jalr { rd, base, offset })
    }

    /// `jr rs` and `ret`, both plain register jumps without a link.
    fn jump_register(&mut self, base_from_args: bool) -> Result<()> {
        let base = if base_from_args {
            self.expect(1)?;
            register(&self.args[0])?
        } else {
            self.expect(0)?;
            Register::Ra
        };
        self.push(Instruction::Jalr {
            rd: Register::Zero,
            base,
            offset: 0,
        })
    }

    fn dispatch(mut self, mnemonic: &str) -> Result<()> {
        use ArithOp::*;
        use BranchOp::*;
        use Register::Zero;

        match mnemonic {
            "add" => self.arith_reg(Add),
            "sub" => self.arith_reg(Sub),
            "and" => self.arith_reg(And),
            "or" => self.arith_reg(Or),
            "xor" => self.arith_reg(Xor),
            "sll" => self.arith_reg(Sll),
            "srl" => self.arith_reg(Srl),
            "sra" => self.arith_reg(Sra),
            "slt" => self.arith_reg(Slt),
            "sltu" => self.arith_reg(Sltu),

            "mul" => self.arith_reg(Mul),
            "mulh" => self.arith_reg(Mulh),
            "mulhsu" => self.arith_reg(Mulhsu),
            "mulhu" => self.arith_reg(Mulhu),
            "div" => self.arith_reg(Div),
            "divu" => self.arith_reg(Divu),
            "rem" => self.arith_reg(Rem),
            "remu" => self.arith_reg(Remu),

            "addi" => self.arith_imm(Add),
            "andi" => self.arith_imm(And),
            "ori" => self.arith_imm(Or),
            "xori" => self.arith_imm(Xor),
            "slli" => self.arith_imm(Sll),
            "srli" => self.arith_imm(Srl),
            "srai" => self.arith_imm(Sra),
            "slti" => self.arith_imm(Slt),
            "sltiu" => self.arith_imm(Sltu),

            "lb" => self.load(LoadOp::Lb),
            "lh" => self.load(LoadOp::Lh),
            "lw" => self.load(LoadOp::Lw),
            "lbu" => self.load(LoadOp::Lbu),
            "lhu" => self.load(LoadOp::Lhu),
            "sb" => self.store(StoreOp::Sb),
            "sh" => self.store(StoreOp::Sh),
            "sw" => self.store(StoreOp::Sw),

            "beq" => self.branch(Beq, false),
            "bne" => self.branch(Bne, false),
            "blt" => self.branch(Blt, false),
            "bge" => self.branch(Bge, false),
            "bltu" => self.branch(Bltu, false),
            "bgeu" => self.branch(Bgeu, false),

            "ble" => self.branch(Bge, true),
            "bleu" => self.branch(Bgeu, true),
            "bgt" => self.branch(Blt, true),
            "bgtu" => self.branch(Bltu, true),

            "beqz" => self.branch_zero(Beq, false),
            "bnez" => self.branch_zero(Bne, false),
            "bltz" => self.branch_zero(Blt, false),
            "bgtz" => self.branch_zero(Blt, true),
            "blez" => self.branch_zero(Bge, true),
            "bgez" => self.branch_zero(Bge, false),

            "jal" => self.jal(),
            "jalr" => self.jalr(),
            "lui" => self.upper(false),
            "auipc" => self.upper(true),

            "mv" => self.unary(|rd, rs| Instruction::ArithReg {
                op: Add,
                rd,
                rs1: rs,
                rs2: Zero,
            }),
            "li" => self.load_immediate(),
            "neg" => self.unary(|rd, rs| Instruction::ArithReg {
                op: Sub,
                rd,
                rs1: Zero,
                rs2: rs,
            }),
            "not" => self.unary(|rd, rs| Instruction::ArithImm {
                op: Xor,
                rd,
                rs1: rs,
                imm: -1,
            }),

            "seqz" => self.unary(|rd, rs| Instruction::ArithImm {
                op: Sltu,
                rd,
                rs1: rs,
                imm: 1,
            }),
            "snez" => self.unary(|rd, rs| Instruction::ArithReg {
                op: Sltu,
                rd,
                rs1: Zero,
                rs2: rs,
            }),
            "sgtz" => self.unary(|rd, rs| Instruction::ArithReg {
                op: Slt,
                rd,
                rs1: Zero,
                rs2: rs,
            }),
            "sltz" => self.unary(|rd, rs| Instruction::ArithReg {
                op: Slt,
                rd,
                rs1: rs,
                rs2: Zero,
            }),

            "call" => self.call(false),
            "tail" => self.call(true),
            "la" => self.load_address(),

            "j" => self.jump(),
            "jr" => self.jump_register(true),
            "ret" => self.jump_register(false),

            _ => Err(new_parser_error(
                self.span.clone(),
                format!("Unknown command: \"{}\"", mnemonic),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembler::Assembly;

    fn storages(source: &str) -> Vec<Storage> {
        Assembly::parse("test.s", source).unwrap().storages
    }

    fn instr(source: &str) -> Instruction {
        match storages(source).remove(0) {
            Storage::Instr(instruction) => instruction,
            other => panic!("expected an instruction, got {:?}", other),
        }
    }

    #[test]
    fn three_register_form() {
        assert_eq!(
            instr(".text\nadd a0, a1, a2\n"),
            Instruction::ArithReg {
                op: ArithOp::Add,
                rd: Register::A0,
                rs1: Register::A1,
                rs2: Register::A2,
            }
        );
    }

    #[test]
    fn load_store_operands() {
        assert_eq!(
            instr(".text\nlw t1, -8(sp)\n"),
            Instruction::Load {
                op: LoadOp::Lw,
                rd: Register::T1,
                base: Register::Sp,
                offset: -8,
            }
        );
        assert_eq!(
            instr(".text\nsb t2, (gp)\n"),
            Instruction::Store {
                op: StoreOp::Sb,
                rs2: Register::T2,
                base: Register::Gp,
                offset: 0,
            }
        );
    }

    #[test]
    fn li_boundary() {
        // 0x7FF still fits twelve signed bits
        assert_eq!(
            storages(".text\nli a0, 0x7FF\n"),
            vec![Storage::Instr(Instruction::ArithImm {
                op: ArithOp::Add,
                rd: Register::A0,
                rs1: Register::Zero,
                imm: 0x7FF,
            })]
        );
        // 0x800 does not: lui 1 then addi -2048
        assert_eq!(
            storages(".text\nli a0, 0x800\n"),
            vec![
                Storage::Instr(Instruction::Lui {
                    rd: Register::A0,
                    imm: 1,
                }),
                Storage::Instr(Instruction::ArithImm {
                    op: ArithOp::Add,
                    rd: Register::A0,
                    rs1: Register::A0,
                    imm: -2048,
                }),
            ]
        );
    }

    #[test]
    fn li_full_range() {
        assert_eq!(
            storages(".text\nli t0, 0xDEADBEEF\n"),
            vec![
                Storage::Instr(Instruction::Lui {
                    rd: Register::T0,
                    imm: 0xDEADC,
                }),
                Storage::Instr(Instruction::ArithImm {
                    op: ArithOp::Add,
                    rd: Register::T0,
                    rs1: Register::T0,
                    imm: -0x111,
                }),
            ]
        );
    }

    #[test]
    fn branch_pseudo_swaps() {
        assert_eq!(
            instr(".text\nloop: ble a0, a1, loop\n"),
            Instruction::Branch {
                op: BranchOp::Bge,
                rs1: Register::A1,
                rs2: Register::A0,
                target: Value::Symbol("loop".to_owned()),
            }
        );
        assert_eq!(
            instr(".text\nx: bgtz t0, x\n"),
            Instruction::Branch {
                op: BranchOp::Blt,
                rs1: Register::Zero,
                rs2: Register::T0,
                target: Value::Symbol("x".to_owned()),
            }
        );
    }

    #[test]
    fn jump_pseudos() {
        assert_eq!(
            instr(".text\nret\n"),
            Instruction::Jalr {
                rd: Register::Zero,
                base: Register::Ra,
                offset: 0,
            }
        );
        assert_eq!(
            instr(".text\njr t0\n"),
            Instruction::Jalr {
                rd: Register::Zero,
                base: Register::T0,
                offset: 0,
            }
        );
        assert_eq!(
            instr(".text\nhere: j here\n"),
            Instruction::Jal {
                rd: Register::Zero,
                target: Value::Symbol("here".to_owned()),
            }
        );
    }

    #[test]
    fn call_stays_symbolic() {
        assert_eq!(
            storages(".text\ncall printf\n"),
            vec![Storage::Call {
                tail: false,
                target: "printf".to_owned(),
            }]
        );
        assert_eq!(
            storages(".text\ntail exit\n"),
            vec![Storage::Call {
                tail: true,
                target: "exit".to_owned(),
            }]
        );
    }

    #[test]
    fn la_stays_symbolic() {
        assert_eq!(
            storages(".text\nla a0, msg\n"),
            vec![Storage::LoadAddress {
                rd: Register::A0,
                target: "msg".to_owned(),
            }]
        );
    }

    #[test]
    fn unknown_mnemonic_is_fatal() {
        let err = Assembly::parse("test.s", ".text\nfnord a0, a1\n").unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }

    #[test]
    fn operand_count_checked() {
        assert!(Assembly::parse("test.s", ".text\nadd a0, a1\n").is_err());
        assert!(Assembly::parse("test.s", ".text\nret a0\n").is_err());
    }
}
