//! Behavioral RV32 core speaking the half-word bus.
//!
//! Cycle-level but not microarchitectural: one bus access at a time, each
//! instruction executes on the rising edge that completes its fetch, and a
//! load or store issued by it starts on the next rising edge. Faults can be
//! injected to exercise every failure path of the checker.

use log::warn;

use crate::config::BenchConfig;
use crate::isa::{csr, opcode, CsrOp, InstructionBits, Variant, MRET};
use crate::signals::{BusInputs, BusOutputs, ByteLanes, Dut, Edge};
use crate::transaction::Width;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    pub reset_address: u32,
    pub interrupt_vector: u32,
    pub interrupt_cause: u32,
    pub variant: Variant,
}

impl From<&BenchConfig> for CoreConfig {
    fn from(config: &BenchConfig) -> Self {
        Self {
            reset_address: config.reset_address,
            interrupt_vector: config.interrupt_vector,
            interrupt_cause: config.interrupt_cause,
            variant: config.variant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// XOR `mask` into the result of the `nth` ALU instruction since reset.
    CorruptAlu { nth: u64, mask: u32 },
    /// Put the second beat of a word at `base + stride`.
    BeatStride(u32),
    IgnoreWait,
    /// Keep data-output-enable high one cycle past the final write beat.
    LateOutputEnable,
    /// Enable both lanes on byte stores.
    WideByteStores,
    IgnoreInterrupts,
    /// Raise the write strobe alongside the read strobe in the data phase
    /// of every fetch beat.
    ConflictingStrobes,
    /// Invert the write lane mask between the address and data phases of
    /// every store beat.
    LaneGlitch,
    /// Stay idle after reset.
    NeverFetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    Fetch,
    Load { rd: u8, unsigned: bool },
    Store,
}

#[derive(Debug, Clone, Copy)]
struct Access {
    kind: AccessKind,
    width: Width,
    base: u32,
    beat: usize,
    data_phase: bool,
    value: u32,
}

impl Access {
    fn new(kind: AccessKind, width: Width, base: u32, value: u32) -> Self {
        Self {
            kind,
            width,
            base,
            beat: 0,
            data_phase: false,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Reset,
    Idle,
    Busy(Access),
}

pub struct BehavioralCore {
    config: CoreConfig,
    faults: Vec<Fault>,
    inputs: BusInputs,
    outputs: BusOutputs,
    state: State,
    pending: Option<Access>,
    regs: [u32; 32],
    pc: u32,
    mstatus: u32,
    mepc: u32,
    mcause: u32,
    alu_ops: u64,
    retired: u64,
    oe_linger: bool,
}

impl BehavioralCore {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            faults: Vec::new(),
            inputs: BusInputs::default(),
            outputs: BusOutputs::IDLE,
            state: State::Reset,
            pending: None,
            regs: [0; 32],
            pc: config.reset_address,
            mstatus: 0,
            mepc: 0,
            mcause: 0,
            alu_ops: 0,
            retired: 0,
            oe_linger: false,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn register(&self, reg: u8) -> u32 {
        self.regs[usize::from(reg & 0x1f)]
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Instructions executed since reset.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn enter_reset(&mut self) {
        self.state = State::Reset;
        self.pending = None;
        self.outputs = BusOutputs::IDLE;
        self.regs = [0; 32];
        self.pc = self.config.reset_address;
        self.mstatus = 0;
        self.mepc = 0;
        self.mcause = 0;
        self.alu_ops = 0;
        self.retired = 0;
        self.oe_linger = false;
    }

    fn rising(&mut self) {
        if self.inputs.reset {
            self.enter_reset();
            return;
        }
        if self.oe_linger {
            self.outputs.data_oe = false;
            self.oe_linger = false;
        }
        match self.state {
            State::Reset | State::Idle => self.begin_next(),
            State::Busy(access) => self.advance(access),
        }
    }

    fn begin_next(&mut self) {
        if let Some(access) = self.pending.take() {
            self.start(access);
            return;
        }
        if self.has(Fault::NeverFetch) {
            self.state = State::Idle;
            return;
        }
        let enabled = self.mstatus & csr::MSTATUS_MIE != 0;
        if self.inputs.interrupt && enabled && !self.has(Fault::IgnoreInterrupts) {
            self.mepc = self.pc;
            self.mcause = self.config.interrupt_cause;
            self.mstatus = csr::MSTATUS_MPIE;
            self.pc = self.config.interrupt_vector;
        }
        self.start(Access::new(AccessKind::Fetch, Width::Word, self.pc, 0));
    }

    fn start(&mut self, access: Access) {
        self.state = State::Busy(access);
        self.drive_beat(&access);
    }

    fn beat_address(&self, access: &Access) -> u32 {
        let stride = self
            .faults
            .iter()
            .find_map(|f| match f {
                Fault::BeatStride(stride) => Some(*stride),
                _ => None,
            })
            .unwrap_or(2);
        access.base.wrapping_add(stride * access.beat as u32)
    }

    fn drive_beat(&mut self, access: &Access) {
        let addr = self.beat_address(access);
        self.outputs = match access.kind {
            AccessKind::Fetch => BusOutputs {
                addr,
                rd_n: false,
                ..BusOutputs::IDLE
            },
            AccessKind::Load { .. } => BusOutputs {
                addr,
                rd_n: false,
                mreq_n: false,
                ..BusOutputs::IDLE
            },
            AccessKind::Store => {
                let (lanes, data_out) = match access.width {
                    Width::Word => (ByteLanes::BOTH, (access.value >> (16 * access.beat)) as u16),
                    Width::Half => (ByteLanes::BOTH, access.value as u16),
                    Width::Byte => {
                        let byte = access.value as u8 as u16;
                        let lanes = if self.has(Fault::WideByteStores) {
                            ByteLanes::BOTH
                        } else {
                            Width::Byte.lanes_at(access.base)
                        };
                        (lanes, byte | (byte << 8))
                    }
                };
                BusOutputs {
                    addr,
                    data_out,
                    data_oe: true,
                    wr_n: false,
                    mreq_n: false,
                    wrm_n: lanes.to_wrm_n(),
                    ..BusOutputs::IDLE
                }
            }
        };
    }

    fn advance(&mut self, mut access: Access) {
        if !access.data_phase {
            access.data_phase = true;
            match access.kind {
                AccessKind::Fetch if self.has(Fault::ConflictingStrobes) => {
                    self.outputs.wr_n = false;
                }
                AccessKind::Store if self.has(Fault::LaneGlitch) => {
                    self.outputs.wrm_n ^= 0b11;
                }
                _ => {}
            }
            self.state = State::Busy(access);
            return;
        }
        if self.inputs.wait && !self.has(Fault::IgnoreWait) {
            return;
        }
        if access.kind != AccessKind::Store {
            let data = self.inputs.data_in.unwrap_or(0);
            access.value = match access.width {
                Width::Word => access.value | (u32::from(data) << (16 * access.beat)),
                Width::Half => u32::from(data),
                Width::Byte if access.base & 1 == 1 => u32::from(data >> 8),
                Width::Byte => u32::from(data & 0xff),
            };
        }
        access.beat += 1;
        if access.beat < access.width.beat_count() {
            access.data_phase = false;
            self.start(access);
        } else {
            self.finish(access);
        }
    }

    fn finish(&mut self, access: Access) {
        let linger = access.kind == AccessKind::Store && self.has(Fault::LateOutputEnable);
        self.outputs = BusOutputs {
            addr: self.outputs.addr,
            data_out: self.outputs.data_out,
            data_oe: linger,
            ..BusOutputs::IDLE
        };
        self.oe_linger = linger;
        self.state = State::Idle;

        match access.kind {
            AccessKind::Fetch => self.execute(access.value),
            AccessKind::Load { rd, unsigned } => {
                let value = match (access.width, unsigned) {
                    (Width::Byte, false) => access.value as u8 as i8 as i32 as u32,
                    (Width::Half, false) => access.value as u16 as i16 as i32 as u32,
                    _ => access.value,
                };
                self.write(rd, value);
            }
            AccessKind::Store => {}
        }
    }

    fn read(&self, reg: u8) -> u32 {
        self.regs[usize::from(reg)]
    }

    fn write(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.regs[usize::from(reg)] = value;
        }
    }

    fn write_alu(&mut self, reg: u8, mut value: u32) {
        for fault in &self.faults {
            if let Fault::CorruptAlu { nth, mask } = *fault {
                if nth == self.alu_ops {
                    value ^= mask;
                }
            }
        }
        self.alu_ops += 1;
        self.write(reg, value);
    }

    fn read_csr(&self, addr: u16) -> u32 {
        match addr {
            csr::MSTATUS => self.mstatus,
            csr::MTVEC => self.config.interrupt_vector,
            csr::MEPC => self.mepc,
            csr::MCAUSE => self.mcause,
            _ => 0,
        }
    }

    fn write_csr(&mut self, addr: u16, value: u32) {
        match addr {
            csr::MSTATUS => self.mstatus = value & (csr::MSTATUS_MIE | csr::MSTATUS_MPIE),
            csr::MEPC => self.mepc = value & !3,
            csr::MCAUSE => self.mcause = value,
            _ => {}
        }
    }

    fn illegal(&self, word: u32) {
        warn!(
            "illegal instruction {word:#010x} at {:#010x}, executed as nop",
            self.pc
        );
    }

    fn execute(&mut self, word: u32) {
        let pc = self.pc;
        let mut next = pc.wrapping_add(4);
        let limit = self.config.variant.register_count();
        let (rd, rs1, rs2) = (word.rd(), word.rs1(), word.rs2());
        self.retired += 1;

        // register fields that hold immediates on other formats are not checked
        let op = word.opcode();
        let csr_register = op == opcode::SYSTEM && word != MRET && word.funct3() & 0b100 == 0;
        let uses_rd = op != opcode::STORE && word != MRET;
        let uses_rs1 = matches!(op, opcode::OP | opcode::OP_IMM | opcode::LOAD | opcode::STORE)
            || csr_register;
        let uses_rs2 = matches!(op, opcode::OP | opcode::STORE);
        if (uses_rd && rd >= limit) || (uses_rs1 && rs1 >= limit) || (uses_rs2 && rs2 >= limit) {
            self.illegal(word);
            self.pc = next;
            return;
        }

        match word.opcode() {
            opcode::OP => {
                let (a, b) = (self.read(rs1), self.read(rs2));
                let shamt = b & 0x1f;
                let value = match (word.funct3(), word.funct7()) {
                    (0b000, 0) => a.wrapping_add(b),
                    (0b000, 0b0100000) => a.wrapping_sub(b),
                    (0b001, 0) => a << shamt,
                    (0b010, 0) => u32::from((a as i32) < (b as i32)),
                    (0b011, 0) => u32::from(a < b),
                    (0b100, 0) => a ^ b,
                    (0b101, 0) => a >> shamt,
                    (0b101, 0b0100000) => ((a as i32) >> shamt) as u32,
                    (0b110, 0) => a | b,
                    (0b111, 0) => a & b,
                    _ => return self.skip(word, next),
                };
                self.write_alu(rd, value);
            }
            opcode::OP_IMM => {
                let a = self.read(rs1);
                let imm = word.imm_i();
                let shamt = u32::from(word.rs2());
                let value = match (word.funct3(), word.funct7()) {
                    (0b000, _) => a.wrapping_add(imm as u32),
                    (0b001, 0) => a << shamt,
                    (0b010, _) => u32::from((a as i32) < imm),
                    (0b011, _) => u32::from(a < imm as u32),
                    (0b100, _) => a ^ imm as u32,
                    (0b101, 0) => a >> shamt,
                    (0b101, 0b0100000) => ((a as i32) >> shamt) as u32,
                    (0b110, _) => a | imm as u32,
                    (0b111, _) => a & imm as u32,
                    _ => return self.skip(word, next),
                };
                self.write_alu(rd, value);
            }
            opcode::LUI => self.write_alu(rd, word.imm_u()),
            opcode::AUIPC => self.write(rd, pc.wrapping_add(word.imm_u())),
            opcode::LOAD => {
                let address = self.read(rs1).wrapping_add(word.imm_i() as u32);
                let (width, unsigned) = match word.funct3() {
                    0b000 => (Width::Byte, false),
                    0b001 => (Width::Half, false),
                    0b010 => (Width::Word, false),
                    0b100 => (Width::Byte, true),
                    0b101 => (Width::Half, true),
                    _ => return self.skip(word, next),
                };
                self.pending = Some(Access::new(
                    AccessKind::Load { rd, unsigned },
                    width,
                    address,
                    0,
                ));
            }
            opcode::STORE => {
                let address = self.read(rs1).wrapping_add(word.imm_s() as u32);
                let width = match word.funct3() {
                    0b000 => Width::Byte,
                    0b001 => Width::Half,
                    0b010 => Width::Word,
                    _ => return self.skip(word, next),
                };
                let value = self.read(rs2) & width.value_mask();
                self.pending = Some(Access::new(AccessKind::Store, width, address, value));
            }
            opcode::JAL => {
                self.write(rd, next);
                next = pc.wrapping_add(word.imm_j() as u32);
            }
            opcode::SYSTEM if word == MRET => {
                next = self.mepc;
                let previous = self.mstatus & csr::MSTATUS_MPIE != 0;
                self.mstatus = csr::MSTATUS_MPIE;
                if previous {
                    self.mstatus |= csr::MSTATUS_MIE;
                }
            }
            opcode::SYSTEM => {
                let op = match word.funct3() & 0b011 {
                    0b01 => CsrOp::ReadWrite,
                    0b10 => CsrOp::ReadSet,
                    0b11 => CsrOp::ReadClear,
                    _ => return self.skip(word, next),
                };
                let immediate = word.funct3() & 0b100 != 0;
                let operand = if immediate {
                    u32::from(rs1)
                } else {
                    self.read(rs1)
                };
                let old = self.read_csr(word.csr());
                if op == CsrOp::ReadWrite || rs1 != 0 {
                    self.write_csr(word.csr(), op.apply(old, operand));
                }
                self.write(rd, old);
            }
            _ => return self.skip(word, next),
        }
        self.pc = next;
    }

    fn skip(&mut self, word: u32, next: u32) {
        self.illegal(word);
        self.pc = next;
    }
}

impl Dut for BehavioralCore {
    fn drive(&mut self, inputs: &BusInputs) {
        self.inputs = *inputs;
    }

    fn edge(&mut self, edge: Edge) {
        if edge == Edge::Rising {
            self.rising();
        }
    }

    fn outputs(&self) -> BusOutputs {
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{AluOp, Instr};

    fn core() -> BehavioralCore {
        BehavioralCore::new(CoreConfig::from(&BenchConfig::default()))
    }

    fn tick(core: &mut BehavioralCore, inputs: BusInputs) {
        core.drive(&inputs);
        core.edge(Edge::Rising);
        core.edge(Edge::Falling);
    }

    /// Serve a fetch without any checking, two cycles per beat.
    fn feed(core: &mut BehavioralCore, instr: Instr) {
        let word = instr.encode(Variant::Rv32I).unwrap();
        let mut inputs = BusInputs::default();
        while core.outputs().rd_n {
            tick(core, inputs);
        }
        for half in [word as u16, (word >> 16) as u16] {
            tick(core, inputs);
            inputs.data_in = Some(half);
            tick(core, inputs);
        }
    }

    #[test]
    fn test_reset_holds_bus_idle() {
        let mut core = core();
        let reset = BusInputs {
            reset: true,
            ..BusInputs::default()
        };
        for _ in 0..4 {
            tick(&mut core, reset);
            assert!(core.outputs().is_quiescent());
        }
        tick(&mut core, BusInputs::default());
        assert!(!core.outputs().rd_n);
        assert!(core.outputs().mreq_n);
        assert_eq!(core.outputs().addr, 0);
    }

    #[test]
    fn test_executes_fed_instructions() {
        let mut core = core();
        feed(
            &mut core,
            Instr::OpImm {
                op: AluOp::Add,
                rd: 1,
                rs1: 0,
                imm: -5,
            },
        );
        feed(
            &mut core,
            Instr::OpImm {
                op: AluOp::Srl,
                rd: 2,
                rs1: 1,
                imm: 28,
            },
        );
        assert_eq!(core.register(1), -5i32 as u32);
        assert_eq!(core.register(2), 0xf);
        assert_eq!(core.pc(), 8);
        assert_eq!(core.retired(), 2);
    }

    #[test]
    fn test_corrupt_alu_hits_only_nth() {
        let mut core = core().with_fault(Fault::CorruptAlu { nth: 1, mask: 0x100 });
        for rd in 1..=3 {
            feed(
                &mut core,
                Instr::OpImm {
                    op: AluOp::Add,
                    rd,
                    rs1: 0,
                    imm: 1,
                },
            );
        }
        assert_eq!(core.register(1), 1);
        assert_eq!(core.register(2), 0x101);
        assert_eq!(core.register(3), 1);
    }
}
