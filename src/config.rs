//! Run configuration.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::error::{Result, VerifyError};
use crate::isa::Variant;

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub clock_period_ns: u64,
    /// Delay between a clock edge and the moment lines are sampled.
    pub settle_ns: u64,
    /// Cycles with reset deasserted before the reset pulse.
    pub pre_reset_cycles: u32,
    /// Cycles reset is held asserted.
    pub reset_cycles: u32,
    pub reset_address: u32,
    pub interrupt_vector: u32,
    /// `mcause` value of an external interrupt.
    pub interrupt_cause: u32,
    /// Scratch word used for register seeding and readback, relative to `x0`.
    pub scratch_offset: i32,
    pub variant: Variant,
    /// Highest register index the fuzzer picks for `rd` and `rs1`.
    pub fuzz_register_limit: u8,
    pub rounds: u32,
    pub instructions_per_round: u32,
    /// Largest wait-state count the wait-state round inserts.
    pub max_wait_cycles: u32,
    pub seed: u64,
    pub timeout: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            clock_period_ns: 40,
            settle_ns: 1,
            pre_reset_cycles: 2,
            reset_cycles: 10,
            reset_address: 0x0000_0000,
            interrupt_vector: 0x0000_0010,
            interrupt_cause: 0x8000_000b,
            scratch_offset: 0x7f0,
            variant: Variant::Rv32I,
            fuzz_register_limit: 15,
            rounds: 4,
            instructions_per_round: 200,
            max_wait_cycles: 3,
            seed: 0x5eed,
            timeout: Duration::from_secs(60),
        }
    }
}

impl BenchConfig {
    pub fn scratch_address(&self) -> u32 {
        self.scratch_offset as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock_period_ns < 2 {
            return Err(VerifyError::Config(format!(
                "clock period {}ns cannot be split into two phases",
                self.clock_period_ns
            )));
        }
        if !(-2048..=2047).contains(&self.scratch_offset) || self.scratch_offset & 3 != 0 {
            return Err(VerifyError::Config(format!(
                "scratch offset {} must be a word-aligned 12-bit signed value",
                self.scratch_offset
            )));
        }
        if self.fuzz_register_limit >= self.variant.register_count() {
            return Err(VerifyError::Config(format!(
                "fuzz register limit x{} is outside the {} register file",
                self.fuzz_register_limit, self.variant
            )));
        }
        if self.reset_address & 3 != 0 || self.interrupt_vector & 3 != 0 {
            return Err(VerifyError::Config(
                "reset address and interrupt vector must be word-aligned".into(),
            ));
        }
        Ok(())
    }
}

/// Where the Verilator backend finds the RTL and puts its build products.
#[derive(Debug, Clone)]
pub struct VerilatorOptions {
    pub artifacts_dir: Utf8PathBuf,
    pub sources: Vec<Utf8PathBuf>,
    pub include_dirs: Vec<Utf8PathBuf>,
}

impl Default for VerilatorOptions {
    fn default() -> Self {
        Self {
            artifacts_dir: Utf8PathBuf::from("artifacts"),
            sources: vec![Utf8PathBuf::from("rtl/femtorv_tb.sv")],
            include_dirs: vec![Utf8PathBuf::from("rtl"), Utf8PathBuf::from(".")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scratch_address(), 0x7f0);
    }

    #[test]
    fn test_rejects_fuzz_range_beyond_variant() {
        let config = BenchConfig {
            variant: Variant::Rv32E,
            fuzz_register_limit: 16,
            ..BenchConfig::default()
        };
        assert!(matches!(config.validate(), Err(VerifyError::Config(_))));
    }

    #[test]
    fn test_rejects_unaligned_scratch() {
        let config = BenchConfig {
            scratch_offset: 0x7f2,
            ..BenchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
