//! Reset sequencing and the shadow of the DUT's interrupt state.

use log::{debug, info};

use crate::config::BenchConfig;
use crate::driver::Bus;
use crate::error::{Result, VerifyError};
use crate::isa::csr;
use crate::signals::{Dut, Edge, Request};
use crate::transaction::Phase;

/// `PowerOn → HeldInReset → Released → AwaitingFirstFetch → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    PowerOn,
    HeldInReset,
    Released,
    AwaitingFirstFetch,
    Idle,
}

/// What the testbench knows about interrupts. The enable bits shadow the
/// DUT's `mstatus`; they are never read from the DUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptState {
    pub line_asserted: bool,
    pub enabled: bool,
    pub previous_enabled: bool,
    pub vector: u32,
    pub cause: u32,
    /// Cause of the last interrupt taken, as `mcause` reads back.
    pub last_cause: u32,
    /// Address the DUT returns to on `mret`.
    pub return_address: Option<u32>,
}

impl InterruptState {
    fn new(config: &BenchConfig) -> Self {
        Self {
            line_asserted: false,
            enabled: false,
            previous_enabled: false,
            vector: config.interrupt_vector,
            cause: config.interrupt_cause,
            last_cause: 0,
            return_address: None,
        }
    }

    /// Reset leaves interrupts disabled with nothing pending.
    fn clear(&mut self) {
        self.line_asserted = false;
        self.enabled = false;
        self.previous_enabled = false;
        self.last_cause = 0;
        self.return_address = None;
    }

    /// Shadow value of `mstatus` as the DUT reports it.
    pub fn mstatus(&self) -> u32 {
        let mut value = 0;
        if self.enabled {
            value |= csr::MSTATUS_MIE;
        }
        if self.previous_enabled {
            value |= csr::MSTATUS_MPIE;
        }
        value
    }
}

pub struct Sequencer {
    state: ResetState,
    interrupt: InterruptState,
    pre_reset_cycles: u32,
    reset_cycles: u32,
}

impl Sequencer {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            state: ResetState::PowerOn,
            interrupt: InterruptState::new(config),
            pre_reset_cycles: config.pre_reset_cycles,
            reset_cycles: config.reset_cycles,
        }
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    pub fn interrupt(&self) -> &InterruptState {
        &self.interrupt
    }

    /// Bring the DUT out of reset and wait for its first fetch request.
    ///
    /// The request is left pending for the next `drive_fetch`; its address
    /// is returned.
    pub async fn perform_reset<D: Dut>(&mut self, bus: &mut Bus<D>) -> Result<u32> {
        let clock = bus.clock_mut();
        self.state = ResetState::PowerOn;
        clock.set_wait(false);
        clock.set_interrupt(false);
        clock.set_data(None);
        clock.set_reset(false);
        clock.cycles(self.pre_reset_cycles, Edge::Rising).await;

        clock.set_reset(true);
        self.state = ResetState::HeldInReset;
        clock.cycles(self.reset_cycles, Edge::Rising).await;

        let snapshot = *clock.snapshot();
        if !snapshot.outputs.is_quiescent() {
            return Err(VerifyError::violation(
                "reset",
                Phase::Reset,
                "bus",
                "quiescent (no strobe, no lane, no data)",
                snapshot.outputs.request(),
                &snapshot,
            ));
        }
        if snapshot.inputs.wait {
            return Err(VerifyError::violation("reset", Phase::Reset, "wait", 0, 1, &snapshot));
        }

        clock.set_reset(false);
        self.state = ResetState::Released;
        clock.falling().await;

        self.state = ResetState::AwaitingFirstFetch;
        let snapshot = clock
            .wait_until(Edge::Falling, |snap| match snap.outputs.request() {
                Request::Fetch => Ok(true),
                Request::Idle => Ok(false),
                other => Err(VerifyError::violation(
                    "reset",
                    Phase::AwaitRequest,
                    "request",
                    Request::Fetch,
                    other,
                    snap,
                )),
            })
            .await?;

        self.interrupt.clear();
        self.state = ResetState::Idle;
        info!(
            "out of reset, first fetch at {:#010x} (cycle {})",
            snapshot.outputs.addr, snapshot.cycle
        );
        Ok(snapshot.outputs.addr)
    }

    pub fn assert_interrupt<D: Dut>(&mut self, bus: &mut Bus<D>) {
        debug!("interrupt line asserted");
        self.interrupt.line_asserted = true;
        bus.clock_mut().set_interrupt(true);
    }

    pub fn deassert_interrupt<D: Dut>(&mut self, bus: &mut Bus<D>) {
        debug!("interrupt line deasserted");
        self.interrupt.line_asserted = false;
        bus.clock_mut().set_interrupt(false);
    }

    /// Track a write to `mstatus`.
    pub fn write_mstatus(&mut self, value: u32) {
        self.interrupt.enabled = value & csr::MSTATUS_MIE != 0;
        self.interrupt.previous_enabled = value & csr::MSTATUS_MPIE != 0;
    }

    /// Address the next fetch must target, given its sequential successor.
    ///
    /// An asserted line with interrupts enabled is taken here: the
    /// sequential address becomes the return address and the fetch goes to
    /// the vector.
    pub fn next_fetch(&mut self, sequential: u32) -> u32 {
        let irq = &mut self.interrupt;
        if irq.line_asserted && irq.enabled {
            debug!(
                "interrupt due, vectoring to {:#010x} (return to {sequential:#010x})",
                irq.vector
            );
            irq.return_address = Some(sequential);
            irq.previous_enabled = true;
            irq.enabled = false;
            irq.last_cause = irq.cause;
            irq.vector
        } else {
            sequential
        }
    }

    /// Track `mret`, returning where the DUT must fetch next.
    pub fn return_from_interrupt(&mut self) -> Option<u32> {
        let irq = &mut self.interrupt;
        irq.enabled = irq.previous_enabled;
        irq.previous_enabled = true;
        irq.return_address
    }
}
