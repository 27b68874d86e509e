//! Edge-advance primitive.
//!
//! Every suspension point of the testbench goes through [`Clock`]: pending
//! input changes are applied, the DUT is evaluated on the edge, a
//! [`SignalSnapshot`] is taken, and the task yields so an outer timeout can
//! fire. Nothing here bounds a wait; that belongs to the scenario runner.

use log::trace;

use crate::config::BenchConfig;
use crate::signals::{BusInputs, Dut, Edge, SignalSnapshot};

pub struct Clock<D> {
    dut: D,
    inputs: BusInputs,
    level: Edge,
    half_period_ns: u64,
    settle_ns: u64,
    time_ns: u64,
    cycle: u64,
    snapshot: SignalSnapshot,
}

impl<D: Dut> Clock<D> {
    pub fn new(mut dut: D, config: &BenchConfig) -> Self {
        let inputs = BusInputs::default();
        dut.drive(&inputs);
        dut.edge(Edge::Falling);
        let snapshot = SignalSnapshot {
            time_ns: config.settle_ns,
            cycle: 0,
            edge: Edge::Falling,
            inputs,
            outputs: dut.outputs(),
        };
        Self {
            dut,
            inputs,
            level: Edge::Falling,
            half_period_ns: (config.clock_period_ns / 2).max(1),
            settle_ns: config.settle_ns,
            time_ns: 0,
            cycle: 0,
            snapshot,
        }
    }

    pub fn snapshot(&self) -> &SignalSnapshot {
        &self.snapshot
    }

    /// Completed rising edges since construction.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn time_ns(&self) -> u64 {
        self.time_ns
    }

    pub fn inputs(&self) -> &BusInputs {
        &self.inputs
    }

    pub fn set_reset(&mut self, asserted: bool) {
        self.inputs.reset = asserted;
    }

    pub fn set_wait(&mut self, asserted: bool) {
        self.inputs.wait = asserted;
    }

    /// Takes effect on the DUT's next sampling edge, whatever the clock does.
    pub fn set_interrupt(&mut self, asserted: bool) {
        self.inputs.interrupt = asserted;
    }

    pub fn set_data(&mut self, data: Option<u16>) {
        self.inputs.data_in = data;
    }

    pub fn dut(&self) -> &D {
        &self.dut
    }

    pub fn dut_mut(&mut self) -> &mut D {
        &mut self.dut
    }

    pub fn into_dut(self) -> D {
        self.dut
    }

    fn step(&mut self, edge: Edge) {
        self.dut.drive(&self.inputs);
        self.dut.edge(edge);
        self.time_ns += self.half_period_ns;
        if edge == Edge::Rising {
            self.cycle += 1;
        }
        self.level = edge;
        self.snapshot = SignalSnapshot {
            time_ns: self.time_ns + self.settle_ns,
            cycle: self.cycle,
            edge,
            inputs: self.inputs,
            outputs: self.dut.outputs(),
        };
        trace!("{}", self.snapshot);
    }

    /// Advance to the next edge of the given kind.
    pub async fn edge(&mut self, edge: Edge) -> &SignalSnapshot {
        if self.level == edge {
            self.step(edge.opposite());
        }
        self.step(edge);
        tokio::task::yield_now().await;
        &self.snapshot
    }

    pub async fn rising(&mut self) -> &SignalSnapshot {
        self.edge(Edge::Rising).await
    }

    pub async fn falling(&mut self) -> &SignalSnapshot {
        self.edge(Edge::Falling).await
    }

    pub async fn cycles(&mut self, count: u32, edge: Edge) {
        for _ in 0..count {
            self.edge(edge).await;
        }
    }

    /// Poll `check` on the current snapshot, then at every `edge`, until it
    /// reports `true` or an error.
    pub async fn wait_until<F, E>(&mut self, edge: Edge, mut check: F) -> Result<SignalSnapshot, E>
    where
        F: FnMut(&SignalSnapshot) -> Result<bool, E>,
    {
        loop {
            if check(&self.snapshot)? {
                return Ok(self.snapshot);
            }
            self.edge(edge).await;
        }
    }
}
