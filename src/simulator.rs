use camino::Utf8Path;
use marlin::{
    verilator::{VerilatorRuntime, VerilatorRuntimeOptions},
    verilog::prelude::*,
};

use crate::config::VerilatorOptions;
use crate::error::{Result, VerifyError};
use crate::signals::{BusInputs, BusOutputs, Dut, Edge};

// Processor testbench top; the RTL sources are listed in VerilatorOptions
#[verilog(src = "rtl/femtorv_tb.sv", name = "femtorv_tb")]
pub struct FemtoRvTestbench;

pub fn create_femtorv_runtime(options: &VerilatorOptions) -> Result<VerilatorRuntime> {
    let sources: Vec<&Utf8Path> = options.sources.iter().map(|p| p.as_path()).collect();
    let include_dirs: Vec<&Utf8Path> = options.include_dirs.iter().map(|p| p.as_path()).collect();

    VerilatorRuntime::new(
        &options.artifacts_dir,
        &sources,
        &include_dirs,
        [],
        VerilatorRuntimeOptions::default_logging(),
    )
    .map_err(|e| VerifyError::Backend(format!("failed to create Verilator runtime: {e}")))
}

// Verilator is two-state: a released data bus reads as zero.
impl Dut for FemtoRvTestbench<'_> {
    fn drive(&mut self, inputs: &BusInputs) {
        self.rst_n = inputs.rst_n();
        self.wait_n = inputs.wait_n();
        self.irq_n = inputs.irq_n();
        self.data_in = inputs.data_in.unwrap_or(0);
        self.eval();
    }

    fn edge(&mut self, edge: Edge) {
        self.clk = edge.level();
        self.eval();
    }

    fn outputs(&self) -> BusOutputs {
        BusOutputs {
            addr: self.addr,
            data_out: self.data_out,
            data_oe: self.data_oe != 0,
            rd_n: self.rd_n != 0,
            wr_n: self.wr_n != 0,
            mreq_n: self.mreq_n != 0,
            wrm_n: self.wrm_n & 0b11,
        }
    }
}
