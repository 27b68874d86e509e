//! Bus signal contract shared by the driver and every DUT backend.
//!
//! Input lines are held at their semantic level (`true` = asserted) and only
//! converted to the pin polarity at the backend boundary. Output lines are
//! kept at pin level, exactly as a waveform viewer would show them.

use std::fmt;

/// Clock edge selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn opposite(self) -> Self {
        match self {
            Edge::Rising => Edge::Falling,
            Edge::Falling => Edge::Rising,
        }
    }

    /// Level of the clock line right after this edge.
    pub fn level(self) -> u8 {
        match self {
            Edge::Rising => 1,
            Edge::Falling => 0,
        }
    }
}

/// Active byte lanes of one half-word beat.
///
/// Bit 0 selects bits 7:0 of the data bus, bit 1 selects bits 15:8. On the
/// wire the mask is active-low (`wrm_n`), so `0b11` means no lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteLanes(u8);

impl ByteLanes {
    pub const NONE: Self = Self(0b00);
    pub const LOW: Self = Self(0b01);
    pub const HIGH: Self = Self(0b10);
    pub const BOTH: Self = Self(0b11);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b11)
    }

    pub fn from_wrm_n(wrm_n: u8) -> Self {
        Self(!wrm_n & 0b11)
    }

    pub fn to_wrm_n(self) -> u8 {
        !self.0 & 0b11
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Data-bus bits covered by these lanes.
    pub fn mask(self) -> u16 {
        let mut mask = 0;
        if self.0 & 0b01 != 0 {
            mask |= 0x00ff;
        }
        if self.0 & 0b10 != 0 {
            mask |= 0xff00;
        }
        mask
    }
}

impl fmt::Display for ByteLanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0b00 => "none",
            0b01 => "low",
            0b10 => "high",
            _ => "both",
        };
        write!(f, "{name} (wrm_n={:02b})", self.to_wrm_n())
    }
}

/// Lines driven by the testbench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusInputs {
    pub reset: bool,
    pub wait: bool,
    pub interrupt: bool,
    /// `None` releases the data bus to high impedance.
    pub data_in: Option<u16>,
}

impl BusInputs {
    pub fn rst_n(&self) -> u8 {
        u8::from(!self.reset)
    }

    pub fn wait_n(&self) -> u8 {
        u8::from(!self.wait)
    }

    pub fn irq_n(&self) -> u8 {
        u8::from(!self.interrupt)
    }
}

/// Lines driven by the DUT, at pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusOutputs {
    pub addr: u32,
    pub data_out: u16,
    pub data_oe: bool,
    pub rd_n: bool,
    pub wr_n: bool,
    pub mreq_n: bool,
    pub wrm_n: u8,
}

impl Default for BusOutputs {
    fn default() -> Self {
        Self::IDLE
    }
}

/// What the DUT is currently asking the bus for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Idle,
    Fetch,
    DataRead,
    DataWrite,
    /// Strobes that can never be active together.
    Conflict,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Request::Idle => "idle",
            Request::Fetch => "fetch",
            Request::DataRead => "data-read",
            Request::DataWrite => "data-write",
            Request::Conflict => "conflicting strobes",
        };
        f.write_str(name)
    }
}

impl BusOutputs {
    pub const IDLE: Self = Self {
        addr: 0,
        data_out: 0,
        data_oe: false,
        rd_n: true,
        wr_n: true,
        mreq_n: true,
        wrm_n: 0b11,
    };

    pub fn read_strobe(&self) -> bool {
        !self.rd_n
    }

    pub fn write_strobe(&self) -> bool {
        !self.wr_n
    }

    pub fn memory_request(&self) -> bool {
        !self.mreq_n
    }

    pub fn lanes(&self) -> ByteLanes {
        ByteLanes::from_wrm_n(self.wrm_n)
    }

    pub fn request(&self) -> Request {
        match (self.read_strobe(), self.write_strobe(), self.memory_request()) {
            (false, false, false) => Request::Idle,
            (true, false, false) => Request::Fetch,
            (true, false, true) => Request::DataRead,
            (false, true, true) => Request::DataWrite,
            _ => Request::Conflict,
        }
    }

    /// No strobe, no lane and no data driven.
    pub fn is_quiescent(&self) -> bool {
        self.request() == Request::Idle && self.wrm_n == 0b11 && !self.data_oe
    }
}

/// Every bus line, sampled a fixed settle delay after a clock edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSnapshot {
    pub time_ns: u64,
    pub cycle: u64,
    pub edge: Edge,
    pub inputs: BusInputs,
    pub outputs: BusOutputs,
}

impl fmt::Display for SignalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.outputs;
        let i = &self.inputs;
        write!(
            f,
            "t={}ns cycle={} {:?}: addr={:#010x} rd_n={} wr_n={} mreq_n={} wrm_n={:02b} \
             data_out={:#06x} data_oe={} | rst_n={} wait_n={} irq_n={} data_in=",
            self.time_ns,
            self.cycle,
            self.edge,
            o.addr,
            u8::from(o.rd_n),
            u8::from(o.wr_n),
            u8::from(o.mreq_n),
            o.wrm_n,
            o.data_out,
            u8::from(o.data_oe),
            i.rst_n(),
            i.wait_n(),
            i.irq_n(),
        )?;
        match i.data_in {
            Some(data) => write!(f, "{data:#06x}"),
            None => f.write_str("Z"),
        }
    }
}

/// A clocked design exposing the bus signal contract.
pub trait Dut {
    /// Latch the testbench-driven lines; they take effect on the next edge.
    fn drive(&mut self, inputs: &BusInputs);

    /// Evaluate the design on a clock edge.
    fn edge(&mut self, edge: Edge);

    fn outputs(&self) -> BusOutputs;
}

impl<D: Dut + ?Sized> Dut for Box<D> {
    fn drive(&mut self, inputs: &BusInputs) {
        (**self).drive(inputs)
    }

    fn edge(&mut self, edge: Edge) {
        (**self).edge(edge)
    }

    fn outputs(&self) -> BusOutputs {
        (**self).outputs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_polarity() {
        assert_eq!(ByteLanes::NONE.to_wrm_n(), 0b11);
        assert_eq!(ByteLanes::LOW.to_wrm_n(), 0b10);
        assert_eq!(ByteLanes::HIGH.to_wrm_n(), 0b01);
        assert_eq!(ByteLanes::BOTH.to_wrm_n(), 0b00);
        assert_eq!(ByteLanes::from_wrm_n(0b01), ByteLanes::HIGH);
        assert_eq!(ByteLanes::HIGH.mask(), 0xff00);
        assert_eq!(ByteLanes::BOTH.mask(), 0xffff);
    }

    #[test]
    fn test_request_classification() {
        let fetch = BusOutputs {
            rd_n: false,
            ..BusOutputs::IDLE
        };
        assert_eq!(fetch.request(), Request::Fetch);

        let read = BusOutputs {
            mreq_n: false,
            ..fetch
        };
        assert_eq!(read.request(), Request::DataRead);

        let write = BusOutputs {
            wr_n: false,
            mreq_n: false,
            ..BusOutputs::IDLE
        };
        assert_eq!(write.request(), Request::DataWrite);

        // A write without a memory request has no meaning on this bus.
        let bogus = BusOutputs {
            wr_n: false,
            ..BusOutputs::IDLE
        };
        assert_eq!(bogus.request(), Request::Conflict);
        assert!(BusOutputs::IDLE.is_quiescent());
    }
}
