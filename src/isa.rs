//! RV32 single-instruction encoder and field extraction.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::transaction::Width;

/// Major opcodes (bits 6:0).
pub mod opcode {
    pub const LOAD: u32 = 0b0000011;
    pub const OP_IMM: u32 = 0b0010011;
    pub const AUIPC: u32 = 0b0010111;
    pub const STORE: u32 = 0b0100011;
    pub const OP: u32 = 0b0110011;
    pub const LUI: u32 = 0b0110111;
    pub const JAL: u32 = 0b1101111;
    pub const SYSTEM: u32 = 0b1110011;
}

/// Machine-mode CSR addresses the bench touches.
pub mod csr {
    pub const MSTATUS: u16 = 0x300;
    pub const MTVEC: u16 = 0x305;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;

    /// Machine interrupt enable bit of `mstatus`.
    pub const MSTATUS_MIE: u32 = 1 << 3;
    /// Previous interrupt enable bit of `mstatus`.
    pub const MSTATUS_MPIE: u32 = 1 << 7;
}

pub const MRET: u32 = 0x3020_0073;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Rv32I,
    Rv32E,
}

impl Variant {
    pub fn register_count(self) -> u8 {
        match self {
            Variant::Rv32I => 32,
            Variant::Rv32E => 16,
        }
    }

    pub fn check_register(self, reg: u8) -> Result<u32, EncodeError> {
        if reg < self.register_count() {
            Ok(u32::from(reg))
        } else {
            Err(EncodeError::RegisterOutOfRange { reg, variant: self })
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Rv32I => f.write_str("RV32I"),
            Variant::Rv32E => f.write_str("RV32E"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rv32i" | "i" => Ok(Variant::Rv32I),
            "rv32e" | "e" => Ok(Variant::Rv32E),
            other => Err(format!("unknown instruction-set variant '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("register x{reg} is outside the {variant} register file")]
    RegisterOutOfRange { reg: u8, variant: Variant },

    #[error("{field} value {value} does not fit in {bits} bits")]
    ImmediateOutOfRange {
        field: &'static str,
        value: i64,
        bits: u8,
    },

    #[error("jump offset {0} is odd")]
    MisalignedOffset(i32),

    #[error("{0} has no encoding")]
    UnsupportedForm(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
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
}

impl AluOp {
    pub fn funct3(self) -> u32 {
        match self {
            AluOp::Add | AluOp::Sub => 0b000,
            AluOp::Sll => 0b001,
            AluOp::Slt => 0b010,
            AluOp::Sltu => 0b011,
            AluOp::Xor => 0b100,
            AluOp::Srl | AluOp::Sra => 0b101,
            AluOp::Or => 0b110,
            AluOp::And => 0b111,
        }
    }

    pub fn funct7(self) -> u32 {
        match self {
            AluOp::Sub | AluOp::Sra => 0b0100000,
            _ => 0,
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, AluOp::Sll | AluOp::Srl | AluOp::Sra)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

impl CsrOp {
    fn funct3(self) -> u32 {
        match self {
            CsrOp::ReadWrite => 0b001,
            CsrOp::ReadSet => 0b010,
            CsrOp::ReadClear => 0b011,
        }
    }

    /// New CSR value after applying `operand` to `old`.
    pub fn apply(self, old: u32, operand: u32) -> u32 {
        match self {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old | operand,
            CsrOp::ReadClear => old & !operand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrSource {
    Register(u8),
    /// 5-bit zero-extended immediate.
    Immediate(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Op {
        op: AluOp,
        rd: u8,
        rs1: u8,
        rs2: u8,
    },
    /// Register-immediate ALU operation; `imm` is the shift amount for shifts.
    OpImm {
        op: AluOp,
        rd: u8,
        rs1: u8,
        imm: i32,
    },
    Lui {
        rd: u8,
        imm: u32,
    },
    Load {
        width: Width,
        unsigned: bool,
        rd: u8,
        rs1: u8,
        offset: i32,
    },
    Store {
        width: Width,
        rs2: u8,
        rs1: u8,
        offset: i32,
    },
    Jal {
        rd: u8,
        offset: i32,
    },
    Csr {
        op: CsrOp,
        rd: u8,
        csr: u16,
        src: CsrSource,
    },
    Mret,
}

fn signed_field(field: &'static str, value: i32, bits: u8) -> Result<u32, EncodeError> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if (min..=max).contains(&i64::from(value)) {
        Ok(value as u32 & ((1u32 << bits) - 1))
    } else {
        Err(EncodeError::ImmediateOutOfRange {
            field,
            value: i64::from(value),
            bits,
        })
    }
}

fn unsigned_field(field: &'static str, value: u32, bits: u8) -> Result<u32, EncodeError> {
    if u64::from(value) < (1u64 << bits) {
        Ok(value)
    } else {
        Err(EncodeError::ImmediateOutOfRange {
            field,
            value: i64::from(value),
            bits,
        })
    }
}

impl Instr {
    /// `addi x0, x0, 0`
    pub fn nop() -> Self {
        Instr::OpImm {
            op: AluOp::Add,
            rd: 0,
            rs1: 0,
            imm: 0,
        }
    }

    /// Destination register, if the instruction writes one.
    pub fn rd(&self) -> Option<u8> {
        match *self {
            Instr::Op { rd, .. }
            | Instr::OpImm { rd, .. }
            | Instr::Lui { rd, .. }
            | Instr::Load { rd, .. }
            | Instr::Jal { rd, .. }
            | Instr::Csr { rd, .. } => Some(rd),
            Instr::Store { .. } | Instr::Mret => None,
        }
    }

    pub fn encode(&self, variant: Variant) -> Result<u32, EncodeError> {
        let reg = |r: u8| variant.check_register(r);
        match *self {
            Instr::Op { op, rd, rs1, rs2 } => Ok((op.funct7() << 25)
                | (reg(rs2)? << 20)
                | (reg(rs1)? << 15)
                | (op.funct3() << 12)
                | (reg(rd)? << 7)
                | opcode::OP),
            Instr::OpImm { op, rd, rs1, imm } => {
                let field = if op.is_shift() {
                    let shamt = u32::try_from(imm).map_err(|_| EncodeError::ImmediateOutOfRange {
                        field: "shift amount",
                        value: i64::from(imm),
                        bits: 5,
                    })?;
                    (op.funct7() << 5) | unsigned_field("shift amount", shamt, 5)?
                } else if op == AluOp::Sub {
                    return Err(EncodeError::UnsupportedForm("subtract-immediate"));
                } else {
                    signed_field("I-immediate", imm, 12)?
                };
                Ok((field << 20)
                    | (reg(rs1)? << 15)
                    | (op.funct3() << 12)
                    | (reg(rd)? << 7)
                    | opcode::OP_IMM)
            }
            Instr::Lui { rd, imm } => {
                Ok((unsigned_field("U-immediate", imm, 20)? << 12) | (reg(rd)? << 7) | opcode::LUI)
            }
            Instr::Load {
                width,
                unsigned,
                rd,
                rs1,
                offset,
            } => {
                let funct3 = match (width, unsigned) {
                    (Width::Byte, false) => 0b000,
                    (Width::Half, false) => 0b001,
                    (Width::Word, false) => 0b010,
                    (Width::Byte, true) => 0b100,
                    (Width::Half, true) => 0b101,
                    (Width::Word, true) => return Err(EncodeError::UnsupportedForm("lwu on RV32")),
                };
                Ok((signed_field("load offset", offset, 12)? << 20)
                    | (reg(rs1)? << 15)
                    | (funct3 << 12)
                    | (reg(rd)? << 7)
                    | opcode::LOAD)
            }
            Instr::Store {
                width,
                rs2,
                rs1,
                offset,
            } => {
                let funct3 = match width {
                    Width::Byte => 0b000,
                    Width::Half => 0b001,
                    Width::Word => 0b010,
                };
                let imm = signed_field("store offset", offset, 12)?;
                Ok(((imm >> 5) << 25)
                    | (reg(rs2)? << 20)
                    | (reg(rs1)? << 15)
                    | (funct3 << 12)
                    | ((imm & 0x1f) << 7)
                    | opcode::STORE)
            }
            Instr::Jal { rd, offset } => {
                if offset & 1 != 0 {
                    return Err(EncodeError::MisalignedOffset(offset));
                }
                let imm = signed_field("J-immediate", offset, 21)?;
                Ok((((imm >> 20) & 1) << 31)
                    | (((imm >> 1) & 0x3ff) << 21)
                    | (((imm >> 11) & 1) << 20)
                    | (((imm >> 12) & 0xff) << 12)
                    | (reg(rd)? << 7)
                    | opcode::JAL)
            }
            Instr::Csr { op, rd, csr, src } => {
                let csr = unsigned_field("CSR address", u32::from(csr), 12)?;
                let (source, immediate) = match src {
                    CsrSource::Register(rs1) => (reg(rs1)?, 0),
                    CsrSource::Immediate(uimm) => {
                        (unsigned_field("CSR immediate", u32::from(uimm), 5)?, 0b100)
                    }
                };
                Ok((csr << 20)
                    | (source << 15)
                    | ((op.funct3() | immediate) << 12)
                    | (reg(rd)? << 7)
                    | opcode::SYSTEM)
            }
            Instr::Mret => Ok(MRET),
        }
    }
}

/// Field extraction from an encoded instruction.
pub trait InstructionBits {
    fn opcode(&self) -> u32;
    fn rd(&self) -> u8;
    fn rs1(&self) -> u8;
    fn rs2(&self) -> u8;
    fn funct3(&self) -> u32;
    fn funct7(&self) -> u32;
    /// Sign-extended I-type immediate.
    fn imm_i(&self) -> i32;
    /// Sign-extended S-type immediate.
    fn imm_s(&self) -> i32;
    /// Sign-extended J-type immediate.
    fn imm_j(&self) -> i32;
    /// U-type immediate, already in bits 31:12.
    fn imm_u(&self) -> u32;
    fn csr(&self) -> u16;
}

impl InstructionBits for u32 {
    fn opcode(&self) -> u32 {
        self & 0x7f
    }

    fn rd(&self) -> u8 {
        ((self >> 7) & 0x1f) as u8
    }

    fn rs1(&self) -> u8 {
        ((self >> 15) & 0x1f) as u8
    }

    fn rs2(&self) -> u8 {
        ((self >> 20) & 0x1f) as u8
    }

    fn funct3(&self) -> u32 {
        (self >> 12) & 0x7
    }

    fn funct7(&self) -> u32 {
        self >> 25
    }

    fn imm_i(&self) -> i32 {
        (*self as i32) >> 20
    }

    fn imm_s(&self) -> i32 {
        (((*self as i32) >> 25) << 5) | ((self >> 7) & 0x1f) as i32
    }

    fn imm_j(&self) -> i32 {
        let imm = ((self >> 31) & 1) << 20
            | ((self >> 12) & 0xff) << 12
            | ((self >> 20) & 1) << 11
            | ((self >> 21) & 0x3ff) << 1;
        ((imm << 11) as i32) >> 11
    }

    fn imm_u(&self) -> u32 {
        self & 0xffff_f000
    }

    fn csr(&self) -> u16 {
        (self >> 20) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        // addi x8, x0, 0
        let addi = Instr::OpImm {
            op: AluOp::Add,
            rd: 8,
            rs1: 0,
            imm: 0,
        };
        assert_eq!(addi.encode(Variant::Rv32E), Ok(0x0000_0413));

        // add x3, x1, x2
        let add = Instr::Op {
            op: AluOp::Add,
            rd: 3,
            rs1: 1,
            rs2: 2,
        };
        assert_eq!(add.encode(Variant::Rv32I), Ok(0x0020_81b3));

        // sub x3, x1, x2
        let sub = Instr::Op {
            op: AluOp::Sub,
            rd: 3,
            rs1: 1,
            rs2: 2,
        };
        assert_eq!(sub.encode(Variant::Rv32I), Ok(0x4020_81b3));

        // lbu a1, 0(a0)  -- first loop body instruction of the boot ROM
        let lbu = Instr::Load {
            width: Width::Byte,
            unsigned: true,
            rd: 11,
            rs1: 10,
            offset: 0,
        };
        assert_eq!(lbu.encode(Variant::Rv32I), Ok(0x0005_4583));

        // sb a1, 0(a2)
        let sb = Instr::Store {
            width: Width::Byte,
            rs2: 11,
            rs1: 12,
            offset: 0,
        };
        assert_eq!(sb.encode(Variant::Rv32I), Ok(0x00b6_0023));

        // jal x0, -16
        let jal = Instr::Jal { rd: 0, offset: -16 };
        assert_eq!(jal.encode(Variant::Rv32I), Ok(0xff1f_f06f));

        // lui a0, 0x7a
        let lui = Instr::Lui { rd: 10, imm: 0x7a };
        assert_eq!(lui.encode(Variant::Rv32I), Ok(0x0007_a537));

        assert_eq!(Instr::Mret.encode(Variant::Rv32E), Ok(0x3020_0073));
    }

    #[test]
    fn test_srai_sets_arithmetic_bit() {
        let srai = Instr::OpImm {
            op: AluOp::Sra,
            rd: 1,
            rs1: 2,
            imm: 31,
        };
        let word = srai.encode(Variant::Rv32I).unwrap();
        assert_eq!(word.funct7(), 0b0100000);
        assert_eq!(word.rs2(), 31);
        assert_eq!(word.funct3(), 0b101);
    }

    #[test]
    fn test_range_violations() {
        let wide = Instr::OpImm {
            op: AluOp::Add,
            rd: 1,
            rs1: 1,
            imm: 2048,
        };
        assert!(matches!(
            wide.encode(Variant::Rv32I),
            Err(EncodeError::ImmediateOutOfRange { bits: 12, .. })
        ));

        let shift = Instr::OpImm {
            op: AluOp::Sll,
            rd: 1,
            rs1: 1,
            imm: 32,
        };
        assert!(shift.encode(Variant::Rv32I).is_err());

        let high = Instr::Op {
            op: AluOp::Xor,
            rd: 16,
            rs1: 1,
            rs2: 2,
        };
        assert!(high.encode(Variant::Rv32I).is_ok());
        assert_eq!(
            high.encode(Variant::Rv32E),
            Err(EncodeError::RegisterOutOfRange {
                reg: 16,
                variant: Variant::Rv32E
            })
        );

        let subi = Instr::OpImm {
            op: AluOp::Sub,
            rd: 1,
            rs1: 1,
            imm: 1,
        };
        assert!(matches!(
            subi.encode(Variant::Rv32I),
            Err(EncodeError::UnsupportedForm(_))
        ));
    }

    #[test]
    fn test_immediates_decode_back() {
        let store = Instr::Store {
            width: Width::Word,
            rs2: 5,
            rs1: 0,
            offset: -4,
        }
        .encode(Variant::Rv32I)
        .unwrap();
        assert_eq!(store.imm_s(), -4);
        assert_eq!(store.rs2(), 5);

        let jal = Instr::Jal {
            rd: 1,
            offset: 0x7_fffe,
        }
        .encode(Variant::Rv32I)
        .unwrap();
        assert_eq!(jal.imm_j(), 0x7_fffe);

        let csr = Instr::Csr {
            op: CsrOp::ReadSet,
            rd: 5,
            csr: csr::MCAUSE,
            src: CsrSource::Register(0),
        }
        .encode(Variant::Rv32I)
        .unwrap();
        assert_eq!(csr.csr(), csr::MCAUSE);
        assert_eq!(csr.funct3(), 0b010);
    }
}
