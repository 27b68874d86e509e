//! Reference model and random instruction generator.
//!
//! The oracle owns the only copy of the expected architectural register
//! state. Nothing else mutates it; the session feeds it the instructions
//! it sends to the DUT and reads the expected values back out.

use std::fmt;

use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::isa::{AluOp, EncodeError, Instr, Variant};
use crate::transaction::Width;

/// Reduce an arbitrary-precision result into the signed 32-bit range.
pub fn wrap_i32(value: i64) -> i32 {
    const SPAN: i64 = 1 << 32;
    let mut v = value.rem_euclid(SPAN);
    if v > i64::from(i32::MAX) {
        v -= SPAN;
    }
    v as i32
}

/// Register value produced by a sub-word load of `raw`.
pub fn extend_load(width: Width, unsigned: bool, raw: u32) -> i32 {
    match (width, unsigned) {
        (Width::Byte, false) => i32::from(raw as u8 as i8),
        (Width::Byte, true) => i32::from(raw as u8),
        (Width::Half, false) => i32::from(raw as u16 as i16),
        (Width::Half, true) => i32::from(raw as u16),
        (Width::Word, _) => raw as i32,
    }
}

/// 32 signed registers shadowing the DUT; `x0` is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRegisterFile {
    regs: [i32; 32],
}

impl Default for ReferenceRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceRegisterFile {
    pub fn new() -> Self {
        Self { regs: [0; 32] }
    }

    pub fn get(&self, reg: u8) -> i32 {
        self.regs[usize::from(reg & 0x1f)]
    }

    pub fn get_u32(&self, reg: u8) -> u32 {
        self.get(reg) as u32
    }

    /// Store `value` wrapped into 32 bits. Writes to `x0` are dropped.
    pub fn set(&mut self, reg: u8, value: i64) {
        if reg != 0 {
            self.regs[usize::from(reg & 0x1f)] = wrap_i32(value);
        }
    }

    pub fn set_word(&mut self, reg: u8, value: u32) {
        self.set(reg, i64::from(value as i32));
    }

    pub fn as_array(&self) -> &[i32; 32] {
        &self.regs
    }

    /// Apply one generated instruction, returning the new value of `rd`.
    pub fn apply(&mut self, instr: &GeneratedInstruction) -> i32 {
        if instr.rd == 0 {
            return 0;
        }
        let a = self.get(instr.rs1);
        let b = match instr.operand2 {
            Operand2::Register(reg) => self.get(reg),
            Operand2::Immediate(imm) => imm,
            Operand2::ShiftAmount(shamt) => i32::from(shamt),
            Operand2::Upper(imm) => imm as i32,
        };
        let result = wrap_i32((instr.family.semantics())(a, b));
        self.regs[usize::from(instr.rd)] = result;
        result
    }

    /// Recompute a register file by re-executing a trace.
    pub fn replay(initial: &ReferenceRegisterFile, trace: &[TraceStep]) -> Self {
        let mut regs = initial.clone();
        for step in trace {
            regs.apply(&step.instruction);
        }
        regs
    }

    /// Rebuild a register file from the results recorded in a trace.
    pub fn replay_recorded(initial: &ReferenceRegisterFile, trace: &[TraceStep]) -> Self {
        let mut regs = initial.clone();
        for step in trace {
            regs.set(step.instruction.rd, i64::from(step.result));
        }
        regs
    }
}

/// Encoding shape of an instruction family's second operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    RegReg,
    Immediate,
    ShiftAmount,
    UpperImmediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Slt,
    Sltu,
    Sll,
    Srl,
    Sra,
    Addi,
    Andi,
    Ori,
    Xori,
    Slti,
    Sltiu,
    Slli,
    Srli,
    Srai,
    Lui,
}

type Semantics = fn(i32, i32) -> i64;

fn add(a: i32, b: i32) -> i64 {
    i64::from(a) + i64::from(b)
}

fn sub(a: i32, b: i32) -> i64 {
    i64::from(a) - i64::from(b)
}

fn and(a: i32, b: i32) -> i64 {
    i64::from(a & b)
}

fn or(a: i32, b: i32) -> i64 {
    i64::from(a | b)
}

fn xor(a: i32, b: i32) -> i64 {
    i64::from(a ^ b)
}

fn slt(a: i32, b: i32) -> i64 {
    i64::from(a < b)
}

fn sltu(a: i32, b: i32) -> i64 {
    i64::from((a as u32) < (b as u32))
}

fn sll(a: i32, b: i32) -> i64 {
    i64::from(a) << (b & 0x1f)
}

fn srl(a: i32, b: i32) -> i64 {
    i64::from((a as u32) >> (b & 0x1f))
}

fn sra(a: i32, b: i32) -> i64 {
    i64::from(a >> (b & 0x1f))
}

fn upper(_: i32, b: i32) -> i64 {
    i64::from(b) << 12
}

impl Family {
    pub const ALL: [Family; 20] = [
        Family::Add,
        Family::Sub,
        Family::And,
        Family::Or,
        Family::Xor,
        Family::Slt,
        Family::Sltu,
        Family::Sll,
        Family::Srl,
        Family::Sra,
        Family::Addi,
        Family::Andi,
        Family::Ori,
        Family::Xori,
        Family::Slti,
        Family::Sltiu,
        Family::Slli,
        Family::Srli,
        Family::Srai,
        Family::Lui,
    ];

    pub fn shape(self) -> Shape {
        use Family::*;
        match self {
            Add | Sub | And | Or | Xor | Slt | Sltu | Sll | Srl | Sra => Shape::RegReg,
            Addi | Andi | Ori | Xori | Slti | Sltiu => Shape::Immediate,
            Slli | Srli | Srai => Shape::ShiftAmount,
            Lui => Shape::UpperImmediate,
        }
    }

    pub fn alu_op(self) -> Option<AluOp> {
        use Family::*;
        let op = match self {
            Add | Addi => AluOp::Add,
            Sub => AluOp::Sub,
            And | Andi => AluOp::And,
            Or | Ori => AluOp::Or,
            Xor | Xori => AluOp::Xor,
            Slt | Slti => AluOp::Slt,
            Sltu | Sltiu => AluOp::Sltu,
            Sll | Slli => AluOp::Sll,
            Srl | Srli => AluOp::Srl,
            Sra | Srai => AluOp::Sra,
            Lui => return None,
        };
        Some(op)
    }

    /// Pure reference semantics `(rs1, operand2) -> rd`, before wrapping.
    pub fn semantics(self) -> Semantics {
        match self.alu_op() {
            None => upper,
            Some(AluOp::Add) => add,
            Some(AluOp::Sub) => sub,
            Some(AluOp::And) => and,
            Some(AluOp::Or) => or,
            Some(AluOp::Xor) => xor,
            Some(AluOp::Slt) => slt,
            Some(AluOp::Sltu) => sltu,
            Some(AluOp::Sll) => sll,
            Some(AluOp::Srl) => srl,
            Some(AluOp::Sra) => sra,
        }
    }

    /// Build the instruction for this family.
    pub fn instr(self, rd: u8, rs1: u8, operand2: Operand2) -> Result<Instr, EncodeError> {
        let mismatch = || EncodeError::UnsupportedForm("operand shape of this family");
        match (self.alu_op(), self.shape(), operand2) {
            (Some(op), Shape::RegReg, Operand2::Register(rs2)) => Ok(Instr::Op { op, rd, rs1, rs2 }),
            (Some(op), Shape::Immediate, Operand2::Immediate(imm)) => {
                Ok(Instr::OpImm { op, rd, rs1, imm })
            }
            (Some(op), Shape::ShiftAmount, Operand2::ShiftAmount(shamt)) => Ok(Instr::OpImm {
                op,
                rd,
                rs1,
                imm: i32::from(shamt),
            }),
            (None, Shape::UpperImmediate, Operand2::Upper(imm)) => Ok(Instr::Lui { rd, imm }),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{self:?}").to_ascii_lowercase();
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    Register(u8),
    Immediate(i32),
    ShiftAmount(u8),
    Upper(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedInstruction {
    pub family: Family,
    pub rd: u8,
    pub rs1: u8,
    pub operand2: Operand2,
    pub instr: Instr,
    pub encoding: u32,
}

impl GeneratedInstruction {
    /// Classify a hand-written instruction. Anything that is not an ALU
    /// operation on registers yields `None`.
    pub fn from_instr(instr: Instr, variant: Variant) -> Result<Option<Self>, EncodeError> {
        let (family, rd, rs1, operand2) = match instr {
            Instr::Op { op, rd, rs1, rs2 } => {
                let family = Family::ALL
                    .iter()
                    .copied()
                    .find(|f| f.shape() == Shape::RegReg && f.alu_op() == Some(op))
                    .ok_or(EncodeError::UnsupportedForm("register-register operation"))?;
                (family, rd, rs1, Operand2::Register(rs2))
            }
            Instr::OpImm { op, rd, rs1, imm } => {
                let (shape, operand2) = if op.is_shift() {
                    (Shape::ShiftAmount, Operand2::ShiftAmount(imm.clamp(0, 0xff) as u8))
                } else {
                    (Shape::Immediate, Operand2::Immediate(imm))
                };
                let family = Family::ALL
                    .iter()
                    .copied()
                    .find(|f| f.shape() == shape && f.alu_op() == Some(op))
                    .ok_or(EncodeError::UnsupportedForm("subtract-immediate"))?;
                (family, rd, rs1, operand2)
            }
            Instr::Lui { rd, imm } => (Family::Lui, rd, 0, Operand2::Upper(imm)),
            _ => return Ok(None),
        };
        let encoding = instr.encode(variant)?;
        Ok(Some(Self {
            family,
            rd,
            rs1,
            operand2,
            instr,
            encoding,
        }))
    }
}

impl fmt::Display for GeneratedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}, x{}, ", self.family, self.rd, self.rs1)?;
        match self.operand2 {
            Operand2::Register(reg) => write!(f, "x{reg}")?,
            Operand2::Immediate(imm) => write!(f, "{imm}")?,
            Operand2::ShiftAmount(shamt) => write!(f, "{shamt}")?,
            Operand2::Upper(imm) => write!(f, "{imm:#x}")?,
        }
        write!(f, " ({:#010x})", self.encoding)
    }
}

/// One applied instruction and the value it left in `rd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceStep {
    pub instruction: GeneratedInstruction,
    pub result: i32,
}

pub struct Oracle {
    registers: ReferenceRegisterFile,
    rng: ChaCha8Rng,
    variant: Variant,
    fuzz_limit: u8,
    trace: Vec<TraceStep>,
}

impl Oracle {
    /// `fuzz_limit` is the highest index picked for `rd` and `rs1`; `rs2`
    /// may name any register of the variant.
    pub fn new(seed: u64, variant: Variant, fuzz_limit: u8) -> Self {
        Self {
            registers: ReferenceRegisterFile::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            variant,
            fuzz_limit: fuzz_limit.min(variant.register_count() - 1),
            trace: Vec::new(),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn registers(&self) -> &ReferenceRegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut ReferenceRegisterFile {
        &mut self.registers
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn reset(&mut self) {
        self.registers = ReferenceRegisterFile::new();
        self.trace.clear();
    }

    /// Pick a family uniformly and generate an instance of it.
    pub fn random_instruction(&mut self) -> GeneratedInstruction {
        let family = Family::ALL
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(Family::Add);
        self.generate_instruction(family)
    }

    /// Generate a well-formed instance of `family`.
    ///
    /// Immediates are drawn one bit wider than their field so both edges of
    /// the legal range come up; draws that do not encode are regenerated.
    pub fn generate_instruction(&mut self, family: Family) -> GeneratedInstruction {
        loop {
            let rd = self.rng.gen_range(0..=self.fuzz_limit);
            let rs1 = self.rng.gen_range(0..=self.fuzz_limit);
            let operand2 = match family.shape() {
                Shape::RegReg => {
                    Operand2::Register(self.rng.gen_range(0..self.variant.register_count()))
                }
                Shape::Immediate => Operand2::Immediate(self.rng.gen_range(-4096..4096)),
                Shape::ShiftAmount => Operand2::ShiftAmount(self.rng.gen_range(0..64)),
                Shape::UpperImmediate => Operand2::Upper(self.rng.gen_range(0..1 << 21)),
            };
            let encoded = family
                .instr(rd, rs1, operand2)
                .and_then(|instr| Ok((instr, instr.encode(self.variant)?)));
            match encoded {
                Ok((instr, encoding)) => {
                    return GeneratedInstruction {
                        family,
                        rd,
                        rs1,
                        operand2,
                        instr,
                        encoding,
                    }
                }
                Err(e) => debug!("regenerating {family}: {e}"),
            }
        }
    }

    /// Update the reference state for `instr` and record it in the trace.
    pub fn apply_reference(&mut self, instr: &GeneratedInstruction) -> i32 {
        let result = self.registers.apply(instr);
        self.trace.push(TraceStep {
            instruction: *instr,
            result,
        });
        result
    }

    pub fn trace(&self) -> &[TraceStep] {
        &self.trace
    }

    pub fn take_trace(&mut self) -> Vec<TraceStep> {
        std::mem::take(&mut self.trace)
    }
}
