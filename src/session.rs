//! Verification scenarios composed from bus transactions.
//!
//! A session tracks the address the DUT must fetch from next and a sparse
//! byte memory backing its loads and stores, so every fetch address and
//! every data value on the bus is checked against an expectation.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;

use crate::config::BenchConfig;
use crate::driver::Bus;
use crate::error::{Result, Target, VerifyError};
use crate::isa::{csr, AluOp, CsrOp, CsrSource, Instr};
use crate::oracle::{extend_load, GeneratedInstruction, Oracle, ReferenceRegisterFile, TraceStep};
use crate::sequencer::Sequencer;
use crate::signals::Dut;
use crate::transaction::{BusTransaction, Width};

/// Outcome of one fuzz round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub initial: ReferenceRegisterFile,
    pub trace: Vec<TraceStep>,
    pub final_state: ReferenceRegisterFile,
}

impl RoundReport {
    /// Final state recomputed from the initial state and the trace.
    pub fn replayed(&self) -> ReferenceRegisterFile {
        ReferenceRegisterFile::replay(&self.initial, &self.trace)
    }
}

/// What the interrupt scenario observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptReport {
    pub handler_address: u32,
    pub cause: u32,
    pub return_address: u32,
    pub resumed_at: u32,
}

/// Run a scenario under a wall-clock limit.
pub async fn run_with_timeout<T, F>(limit: Duration, scenario: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, scenario).await {
        Ok(result) => result,
        Err(_) => Err(VerifyError::Timeout(limit)),
    }
}

pub struct Session<D> {
    bus: Bus<D>,
    sequencer: Sequencer,
    oracle: Oracle,
    config: BenchConfig,
    memory: BTreeMap<u32, u8>,
    /// Sequential address of the next fetch; `None` before reset.
    pc: Option<u32>,
    wait_cycles: u32,
}

impl<D: Dut> Session<D> {
    pub fn new(dut: D, config: BenchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bus: Bus::new(dut, &config),
            sequencer: Sequencer::new(&config),
            oracle: Oracle::new(config.seed, config.variant, config.fuzz_register_limit),
            config,
            memory: BTreeMap::new(),
            pc: None,
            wait_cycles: 0,
        })
    }

    pub fn bus(&self) -> &Bus<D> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus<D> {
        &mut self.bus
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut Oracle {
        &mut self.oracle
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn pc(&self) -> Option<u32> {
        self.pc
    }

    pub fn into_dut(self) -> D {
        self.bus.into_dut()
    }

    /// Wait cycles inserted into every data beat from now on.
    pub fn set_wait_cycles(&mut self, cycles: u32) {
        self.wait_cycles = cycles;
    }

    pub fn assert_interrupt(&mut self) {
        self.sequencer.assert_interrupt(&mut self.bus);
    }

    pub fn deassert_interrupt(&mut self) {
        self.sequencer.deassert_interrupt(&mut self.bus);
    }

    pub async fn reset(&mut self) -> Result<()> {
        let first = self.sequencer.perform_reset(&mut self.bus).await?;
        debug!("DUT requested {first:#010x} after reset");
        self.oracle.reset();
        self.pc = Some(self.config.reset_address);
        Ok(())
    }

    /// Feed one instruction to the DUT and serve the load or store it
    /// issues. Returns the address the instruction was fetched from.
    pub async fn execute(&mut self, instr: &Instr) -> Result<u32> {
        let address = self.fetch(instr).await?;
        match *instr {
            Instr::Load {
                width,
                unsigned,
                rd,
                rs1,
                offset,
            } => {
                let target = self.effective_address(rs1, offset);
                let raw = self.peek(target, width);
                let tx = BusTransaction::read(width, Some(target), raw).with_wait(self.wait_cycles);
                self.bus.drive_data_read(&tx).await?;
                let value = extend_load(width, unsigned, raw);
                self.oracle.registers_mut().set(rd, i64::from(value));
            }
            Instr::Store {
                width,
                rs2,
                rs1,
                offset,
            } => {
                let target = self.effective_address(rs1, offset);
                let expected = self.oracle.registers().get_u32(rs2) & width.value_mask();
                let tx = BusTransaction::write(width, target, expected).with_wait(self.wait_cycles);
                let observed = self.bus.capture_write(&tx).await?;
                if observed != expected {
                    return Err(VerifyError::ValueMismatch {
                        target: Target::Register(rs2),
                        expected,
                        observed,
                    });
                }
                self.poke(target, width, observed);
            }
            _ => {
                if let Some(generated) = GeneratedInstruction::from_instr(*instr, self.config.variant)? {
                    self.oracle.apply_reference(&generated);
                }
            }
        }
        Ok(address)
    }

    /// Feed a generated ALU instruction, returning its reference result.
    pub async fn execute_generated(&mut self, instr: &GeneratedInstruction) -> Result<i32> {
        self.fetch(&instr.instr).await?;
        Ok(self.oracle.apply_reference(instr))
    }

    /// Serve the fetch of `instr` at the address the DUT must request, then
    /// track its effect on control flow and the interrupt shadow.
    async fn fetch(&mut self, instr: &Instr) -> Result<u32> {
        let encoding = instr.encode(self.config.variant)?;
        let sequential = self.pc.ok_or_else(|| {
            VerifyError::Scenario("instruction issued before the DUT was reset".into())
        })?;
        let expected = self.sequencer.next_fetch(sequential);
        let address = self.bus.drive_fetch(encoding, Some(expected)).await?;
        let next = address.wrapping_add(4);

        let following = match *instr {
            Instr::Jal { rd, offset } => {
                self.oracle.registers_mut().set_word(rd, next);
                address.wrapping_add(offset as u32)
            }
            Instr::Mret => self.sequencer.return_from_interrupt().ok_or_else(|| {
                VerifyError::Scenario("mret issued with no interrupt taken".into())
            })?,
            Instr::Csr { op, rd, csr, src } => {
                self.track_csr(op, rd, csr, src);
                next
            }
            _ => next,
        };
        self.pc = Some(following);
        Ok(address)
    }

    /// Shadow value the DUT returns for a CSR read.
    fn csr_shadow(&self, csr: u16) -> u32 {
        let irq = self.sequencer.interrupt();
        match csr {
            csr::MSTATUS => irq.mstatus(),
            csr::MTVEC => irq.vector,
            csr::MCAUSE => irq.last_cause,
            csr::MEPC => irq.return_address.unwrap_or(0),
            _ => 0,
        }
    }

    fn track_csr(&mut self, op: CsrOp, rd: u8, csr: u16, src: CsrSource) {
        let old = self.csr_shadow(csr);
        let (operand, source_field) = match src {
            CsrSource::Register(reg) => (self.oracle.registers().get_u32(reg), reg),
            CsrSource::Immediate(imm) => (u32::from(imm), imm),
        };
        // set and clear with x0 or a zero immediate are pure reads
        let writes = op == CsrOp::ReadWrite || source_field != 0;
        if writes && csr == csr::MSTATUS {
            self.sequencer.write_mstatus(op.apply(old, operand));
        }
        self.oracle.registers_mut().set_word(rd, old);
    }

    fn effective_address(&self, rs1: u8, offset: i32) -> u32 {
        self.oracle.registers().get_u32(rs1).wrapping_add(offset as u32)
    }

    /// Little-endian read of the backing memory; unwritten bytes are zero.
    fn peek(&self, address: u32, width: Width) -> u32 {
        (0..width.bytes()).fold(0, |value, i| {
            let byte = self.memory.get(&address.wrapping_add(i)).copied().unwrap_or(0);
            value | (u32::from(byte) << (8 * i))
        })
    }

    fn poke(&mut self, address: u32, width: Width, value: u32) {
        for i in 0..width.bytes() {
            self.memory.insert(address.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    }

    /// Load `value` into `reg` through the scratch word.
    pub async fn load_register(&mut self, reg: u8, value: u32) -> Result<()> {
        self.poke(self.config.scratch_address(), Width::Word, value);
        self.execute(&Instr::Load {
            width: Width::Word,
            unsigned: false,
            rd: reg,
            rs1: 0,
            offset: self.config.scratch_offset,
        })
        .await?;
        Ok(())
    }

    /// Store `reg` to the scratch word and compare it with the reference.
    pub async fn check_register(&mut self, reg: u8) -> Result<()> {
        self.execute(&Instr::Store {
            width: Width::Word,
            rs2: reg,
            rs1: 0,
            offset: self.config.scratch_offset,
        })
        .await?;
        Ok(())
    }

    /// Read back every architectural register, `x0` included.
    pub async fn check_all(&mut self) -> Result<()> {
        for reg in 0..self.config.variant.register_count() {
            self.check_register(reg).await?;
        }
        Ok(())
    }

    /// Seed every register but `x0` with a random value and verify it.
    pub async fn seed_registers(&mut self) -> Result<()> {
        for reg in 1..self.config.variant.register_count() {
            let value = self.oracle.rng().gen::<u32>();
            self.load_register(reg, value).await?;
        }
        self.check_all().await
    }

    /// Seed, run `instructions_per_round` random ALU instructions, then read
    /// back the whole register file.
    pub async fn fuzz_round(&mut self) -> Result<RoundReport> {
        self.seed_registers().await?;
        let initial = self.oracle.registers().clone();
        self.oracle.take_trace();

        for _ in 0..self.config.instructions_per_round {
            let generated = self.oracle.random_instruction();
            self.execute_generated(&generated).await?;
        }
        self.check_all().await?;

        Ok(RoundReport {
            initial,
            trace: self.oracle.take_trace(),
            final_state: self.oracle.registers().clone(),
        })
    }

    pub async fn run_rounds(&mut self) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::with_capacity(self.config.rounds as usize);
        for round in 0..self.config.rounds {
            let report = self.fuzz_round().await?;
            info!(
                "round {round}: {} instructions verified (cycle {})",
                report.trace.len(),
                self.bus.cycle()
            );
            reports.push(report);
        }
        Ok(reports)
    }

    /// Sign- and zero-extending loads and masked stores at every lane.
    pub async fn sub_word_round(&mut self) -> Result<()> {
        let limit = self.config.fuzz_register_limit;
        let scratch = self.config.scratch_offset;
        for _ in 0..32 {
            let rng = self.oracle.rng();
            let width = if rng.gen() { Width::Byte } else { Width::Half };
            let lane = match width {
                Width::Byte => rng.gen_range(0..4),
                _ => 2 * rng.gen_range(0..2),
            };
            let unsigned = rng.gen();
            let rd = rng.gen_range(0..=limit);
            let rs2 = rng.gen_range(0..=limit);
            let fill = rng.gen::<u32>();

            self.poke(self.config.scratch_address(), Width::Word, fill);
            self.execute(&Instr::Load {
                width,
                unsigned,
                rd,
                rs1: 0,
                offset: scratch + lane,
            })
            .await?;
            self.execute(&Instr::Store {
                width,
                rs2,
                rs1: 0,
                offset: scratch + lane,
            })
            .await?;
            self.check_register(rd).await?;
        }
        info!("sub-word accesses verified");
        Ok(())
    }

    /// Loads and stores of every width with `cycles` wait cycles per beat.
    pub async fn wait_state_round(&mut self, cycles: u32) -> Result<()> {
        let previous = self.wait_cycles;
        self.wait_cycles = cycles;
        let scratch = self.config.scratch_offset;
        let value = self.oracle.rng().gen::<u32>();

        let result = async {
            self.load_register(1, value).await?;
            self.check_register(1).await?;
            for (width, lane) in [(Width::Half, 2), (Width::Byte, 1), (Width::Byte, 2)] {
                self.execute(&Instr::Load {
                    width,
                    unsigned: false,
                    rd: 2,
                    rs1: 0,
                    offset: scratch + lane,
                })
                .await?;
                self.execute(&Instr::Store {
                    width,
                    rs2: 2,
                    rs1: 0,
                    offset: scratch + lane,
                })
                .await?;
            }
            Ok::<(), VerifyError>(())
        }
        .await;

        self.wait_cycles = previous;
        result?;
        info!("{cycles} wait cycle(s) per beat verified");
        Ok(())
    }

    /// Interrupt delivery: ignored while disabled, vectored once enabled,
    /// cause and return address readable in the handler, `mret` resumes.
    ///
    /// Does not reset the DUT. It must be out of reset with interrupts
    /// disabled and the line deasserted, which is the state after
    /// [`Session::reset`] and after any of the other rounds.
    pub async fn interrupt_scenario(&mut self) -> Result<InterruptReport> {
        if self.sequencer.interrupt().enabled {
            return Err(VerifyError::Scenario(
                "interrupt scenario needs interrupts disabled".into(),
            ));
        }
        let nop = Instr::nop();

        self.assert_interrupt();
        self.execute(&nop).await?;
        self.execute(&Instr::Jal { rd: 0, offset: 0x40 }).await?;
        self.execute(&nop).await?;
        debug!("asserted line ignored while disabled");

        self.execute(&Instr::Csr {
            op: CsrOp::ReadSet,
            rd: 0,
            csr: csr::MSTATUS,
            src: CsrSource::Immediate(csr::MSTATUS_MIE as u8),
        })
        .await?;
        let return_address = self.pc.unwrap_or_default();

        let handler_address = self
            .execute(&Instr::Csr {
                op: CsrOp::ReadSet,
                rd: 1,
                csr: csr::MCAUSE,
                src: CsrSource::Register(0),
            })
            .await?;
        self.check_register(1).await?;
        self.execute(&Instr::Csr {
            op: CsrOp::ReadSet,
            rd: 2,
            csr: csr::MEPC,
            src: CsrSource::Register(0),
        })
        .await?;
        self.check_register(2).await?;

        self.deassert_interrupt();
        self.execute(&Instr::Mret).await?;
        let resumed_at = self
            .execute(&Instr::OpImm {
                op: AluOp::Add,
                rd: 3,
                rs1: 0,
                imm: 1,
            })
            .await?;
        self.check_register(3).await?;

        let report = InterruptReport {
            handler_address,
            cause: self.oracle.registers().get_u32(1),
            return_address,
            resumed_at,
        };
        info!(
            "interrupt taken at {:#010x} with cause {:#010x}, resumed at {:#010x}",
            report.handler_address, report.cause, report.resumed_at
        );
        Ok(report)
    }
}
