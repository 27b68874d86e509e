//! One bus transaction and the half-word beats that realize it.

use std::fmt;

use crate::signals::ByteLanes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fetch,
    DataRead,
    DataWrite,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Fetch => "fetch",
            Direction::DataRead => "data-read",
            Direction::DataWrite => "data-write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    /// Bits of a register value carried by an access of this width.
    pub fn value_mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Half => 0xffff,
            Width::Word => 0xffff_ffff,
        }
    }

    /// Beats needed on the half-word bus.
    pub fn beat_count(self) -> usize {
        match self {
            Width::Word => 2,
            Width::Byte | Width::Half => 1,
        }
    }

    /// Lanes an access of this width uses when it starts at `address`.
    pub fn lanes_at(self, address: u32) -> ByteLanes {
        match self {
            Width::Byte if address & 1 == 1 => ByteLanes::HIGH,
            Width::Byte => ByteLanes::LOW,
            Width::Half | Width::Word => ByteLanes::BOTH,
        }
    }

    /// Byte accesses may start anywhere; wider ones sit on even addresses.
    pub fn is_aligned(self, address: u32) -> bool {
        self == Width::Byte || address & 1 == 0
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Width::Byte => "byte",
            Width::Half => "half-word",
            Width::Word => "word",
        };
        f.write_str(name)
    }
}

/// Where in a transaction a check was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reset,
    AwaitRequest,
    Address,
    Wait,
    Data,
    Release,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Reset => "reset",
            Phase::AwaitRequest => "request",
            Phase::Address => "address phase",
            Phase::Wait => "wait state",
            Phase::Data => "data phase",
            Phase::Release => "release",
        };
        f.write_str(name)
    }
}

/// One half-word transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    pub index: usize,
    pub address: u32,
    pub lanes: ByteLanes,
    /// Payload already shifted into its lanes.
    pub data: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTransaction {
    pub direction: Direction,
    pub width: Width,
    /// `None` when the DUT supplies the address.
    pub address: Option<u32>,
    pub data: u32,
    /// Overrides the lanes derived from width and address.
    pub lane_mask: Option<ByteLanes>,
    pub wait_cycles: u32,
}

impl BusTransaction {
    pub fn fetch(instruction: u32, address: Option<u32>) -> Self {
        Self {
            direction: Direction::Fetch,
            width: Width::Word,
            address,
            data: instruction,
            lane_mask: None,
            wait_cycles: 0,
        }
    }

    pub fn read(width: Width, address: Option<u32>, value: u32) -> Self {
        Self {
            direction: Direction::DataRead,
            width,
            address,
            data: value,
            lane_mask: None,
            wait_cycles: 0,
        }
    }

    pub fn write(width: Width, address: u32, value: u32) -> Self {
        Self {
            direction: Direction::DataWrite,
            width,
            address: Some(address),
            data: value,
            lane_mask: None,
            wait_cycles: 0,
        }
    }

    pub fn with_wait(mut self, cycles: u32) -> Self {
        self.wait_cycles = cycles;
        self
    }

    pub fn with_lanes(mut self, lanes: ByteLanes) -> Self {
        self.lane_mask = Some(lanes);
        self
    }

    pub fn lanes_at(&self, address: u32) -> ByteLanes {
        self.lane_mask
            .unwrap_or_else(|| self.width.lanes_at(address))
    }

    /// Beats for a transaction whose first beat sits at `base`.
    ///
    /// A word is always two half-word beats at `base` and `base + 2`.
    pub fn beats(&self, base: u32) -> Vec<Beat> {
        let lanes = self.lanes_at(base);
        (0..self.width.beat_count())
            .map(|index| {
                let data = match self.width {
                    Width::Word => (self.data >> (16 * index)) as u16,
                    Width::Half => self.data as u16,
                    Width::Byte if lanes == ByteLanes::HIGH => ((self.data & 0xff) as u16) << 8,
                    Width::Byte => (self.data & 0xff) as u16,
                };
                Beat {
                    index,
                    address: base.wrapping_add(2 * index as u32),
                    lanes,
                    data,
                }
            })
            .collect()
    }

    /// Fold the lanes of one captured beat into a transaction value.
    pub fn merge(&self, value: u32, beat: &Beat, raw: u16) -> u32 {
        let masked = raw & beat.lanes.mask();
        match self.width {
            Width::Word => value | (u32::from(masked) << (16 * beat.index)),
            Width::Half => u32::from(masked),
            Width::Byte if beat.lanes == ByteLanes::HIGH => u32::from(masked >> 8),
            Width::Byte => u32::from(masked),
        }
    }

    /// Expected value restricted to the bits the transaction carries.
    pub fn expected_value(&self) -> u32 {
        self.data & self.width.value_mask()
    }
}

impl fmt::Display for BusTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.width, self.direction)?;
        match self.address {
            Some(address) => write!(f, " @{address:#010x}")?,
            None => f.write_str(" @<dut>")?,
        }
        write!(f, " data={:#010x}", self.data)?;
        if self.wait_cycles > 0 {
            write!(f, " wait={}", self.wait_cycles)?;
        }
        Ok(())
    }
}
