//! Clocked transaction driver and checker.
//!
//! Each operation realizes exactly one [`BusTransaction`]: it waits for the
//! DUT's request, checks every line at every falling edge of every beat,
//! and returns only once the final beat has been consumed. The first
//! deviation aborts with a [`VerifyError::ProtocolViolation`].

use log::debug;

use crate::clock::Clock;
use crate::config::BenchConfig;
use crate::error::{Result, Target, VerifyError};
use crate::signals::{ByteLanes, Dut, Edge, Request, SignalSnapshot};
use crate::transaction::{Beat, BusTransaction, Direction, Phase};

/// Pattern driven on read lanes the transaction does not select.
pub const JUNK_LANE: u16 = 0xa5a5;

pub struct Bus<D> {
    clock: Clock<D>,
}

fn expected_request(direction: Direction) -> Request {
    match direction {
        Direction::Fetch => Request::Fetch,
        Direction::DataRead => Request::DataRead,
        Direction::DataWrite => Request::DataWrite,
    }
}

impl<D: Dut> Bus<D> {
    pub fn new(dut: D, config: &BenchConfig) -> Self {
        Self {
            clock: Clock::new(dut, config),
        }
    }

    pub fn clock(&self) -> &Clock<D> {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Clock<D> {
        &mut self.clock
    }

    pub fn cycle(&self) -> u64 {
        self.clock.cycle()
    }

    pub fn snapshot(&self) -> &SignalSnapshot {
        self.clock.snapshot()
    }

    pub fn into_dut(self) -> D {
        self.clock.into_dut()
    }

    /// Serve one instruction fetch, returning the address it was fetched from.
    pub async fn drive_fetch(&mut self, instruction: u32, expected_address: Option<u32>) -> Result<u32> {
        let tx = BusTransaction::fetch(instruction, expected_address);
        self.serve_read(&tx).await
    }

    /// Serve one data read, returning the address the DUT read from.
    pub async fn drive_data_read(&mut self, tx: &BusTransaction) -> Result<u32> {
        debug_assert_eq!(tx.direction, Direction::DataRead);
        self.serve_read(tx).await
    }

    /// Accept one write and compare the masked lanes with `tx.data`.
    pub async fn expect_write(&mut self, tx: &BusTransaction) -> Result<()> {
        let observed = self.capture_write(tx).await?;
        let expected = tx.expected_value();
        if observed != expected {
            return Err(VerifyError::ValueMismatch {
                target: Target::Address(tx.address.unwrap_or(self.snapshot().outputs.addr)),
                expected,
                observed,
            });
        }
        Ok(())
    }

    /// Accept one write and return the value carried by its masked lanes.
    pub async fn capture_write(&mut self, tx: &BusTransaction) -> Result<u32> {
        debug_assert_eq!(tx.direction, Direction::DataWrite);
        let base = self.await_request(tx).await?;
        let beats = tx.beats(base);
        let mut value = 0;

        for beat in &beats {
            if beat.index > 0 {
                self.check_beat(tx, Phase::Address, beat)?;
            }
            self.clock.falling().await;
            self.check_beat(tx, Phase::Data, beat)?;
            let data = self.clock.snapshot().outputs.data_out;
            self.hold(tx, beat, Some(data)).await?;
            value = tx.merge(value, beat, data);
            self.clock.falling().await;
        }

        let snapshot = self.clock.snapshot();
        if snapshot.outputs.data_oe {
            return Err(VerifyError::violation(tx, Phase::Release, "data-output-enable", 0, 1, snapshot));
        }
        debug!("{tx}: captured {value:#010x} at {base:#010x}");
        Ok(value)
    }

    async fn serve_read(&mut self, tx: &BusTransaction) -> Result<u32> {
        let base = self.await_request(tx).await?;
        let beats = tx.beats(base);

        for beat in &beats {
            if beat.index > 0 {
                self.check_beat(tx, Phase::Address, beat)?;
            }
            self.clock.falling().await;
            self.check_beat(tx, Phase::Data, beat)?;
            self.hold(tx, beat, None).await?;
            let driven = (beat.data & beat.lanes.mask()) | (JUNK_LANE & !beat.lanes.mask());
            self.clock.set_data(Some(driven));
            self.clock.falling().await;
        }
        self.clock.set_data(None);
        debug!("{tx}: served at {base:#010x}");
        Ok(base)
    }

    /// Wait for the request of `tx` and check its address phase.
    async fn await_request(&mut self, tx: &BusTransaction) -> Result<u32> {
        let wanted = expected_request(tx.direction);
        let snapshot = self
            .clock
            .wait_until(Edge::Falling, |snap| {
                let outputs = &snap.outputs;
                match outputs.request() {
                    Request::Idle if outputs.wrm_n != 0b11 => Err(VerifyError::violation(
                        tx,
                        Phase::AwaitRequest,
                        "byte-lane-mask",
                        ByteLanes::NONE,
                        outputs.lanes(),
                        snap,
                    )),
                    Request::Idle => Ok(false),
                    request if request == wanted => Ok(true),
                    request => Err(VerifyError::violation(
                        tx,
                        Phase::AwaitRequest,
                        "request",
                        wanted,
                        request,
                        snap,
                    )),
                }
            })
            .await?;

        let base = snapshot.outputs.addr;
        if let Some(expected) = tx.address {
            if expected != base {
                return Err(VerifyError::violation(
                    tx,
                    Phase::Address,
                    "address",
                    format_args!("{expected:#010x}"),
                    format_args!("{base:#010x}"),
                    &snapshot,
                ));
            }
        }
        if !tx.width.is_aligned(base) {
            return Err(VerifyError::violation(
                tx,
                Phase::Address,
                "address alignment",
                format_args!("even address for a {} access", tx.width),
                format_args!("{base:#010x}"),
                &snapshot,
            ));
        }
        let first = tx.beats(base)[0];
        self.check_beat(tx, Phase::Address, &first)?;
        Ok(base)
    }

    /// Insert the transaction's wait cycles, re-checking the beat each cycle.
    async fn hold(&mut self, tx: &BusTransaction, beat: &Beat, write_data: Option<u16>) -> Result<()> {
        if tx.wait_cycles == 0 {
            return Ok(());
        }
        self.clock.set_wait(true);
        for _ in 0..tx.wait_cycles {
            self.clock.falling().await;
            if let Err(e) = self.check_beat(tx, Phase::Wait, beat) {
                self.clock.set_wait(false);
                return Err(e);
            }
            if let Some(data) = write_data {
                let snapshot = *self.clock.snapshot();
                let mask = beat.lanes.mask();
                let now = snapshot.outputs.data_out;
                if now & mask != data & mask {
                    self.clock.set_wait(false);
                    return Err(VerifyError::violation(
                        tx,
                        Phase::Wait,
                        "data-out",
                        format_args!("{:#06x}", data & mask),
                        format_args!("{:#06x}", now & mask),
                        &snapshot,
                    ));
                }
            }
        }
        self.clock.set_wait(false);
        Ok(())
    }

    /// Every line the DUT owns must match the beat for its whole duration.
    fn check_beat(&self, tx: &BusTransaction, phase: Phase, beat: &Beat) -> Result<()> {
        let snapshot = self.clock.snapshot();
        let outputs = &snapshot.outputs;
        let wanted = expected_request(tx.direction);

        let request = outputs.request();
        if request != wanted {
            return Err(VerifyError::violation(tx, phase, "request", wanted, request, snapshot));
        }
        if outputs.addr != beat.address {
            return Err(VerifyError::violation(
                tx,
                phase,
                "address",
                format_args!("{:#010x} (beat {})", beat.address, beat.index),
                format_args!("{:#010x}", outputs.addr),
                snapshot,
            ));
        }

        let lanes = outputs.lanes();
        let expected_lanes = match tx.direction {
            Direction::DataWrite => beat.lanes,
            Direction::Fetch | Direction::DataRead => ByteLanes::NONE,
        };
        if lanes != expected_lanes {
            return Err(VerifyError::violation(
                tx,
                phase,
                "byte-lane-mask",
                expected_lanes,
                lanes,
                snapshot,
            ));
        }

        let driving = tx.direction == Direction::DataWrite;
        if outputs.data_oe != driving {
            return Err(VerifyError::violation(
                tx,
                phase,
                "data-output-enable",
                u8::from(driving),
                u8::from(outputs.data_oe),
                snapshot,
            ));
        }
        Ok(())
    }
}
