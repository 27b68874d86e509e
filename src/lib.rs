pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod isa;
pub mod model;
pub mod oracle;
pub mod sequencer;
pub mod session;
pub mod signals;
pub mod transaction;

#[cfg(feature = "verilator")]
pub mod simulator;

pub use config::{BenchConfig, VerilatorOptions};
pub use driver::Bus;
pub use error::{Result, Target, VerifyError, Violation};
pub use isa::{AluOp, CsrOp, CsrSource, Instr, Variant};
pub use model::{BehavioralCore, CoreConfig, Fault};
pub use oracle::{GeneratedInstruction, Oracle, ReferenceRegisterFile};
pub use session::{run_with_timeout, InterruptReport, RoundReport, Session};
pub use signals::{BusInputs, BusOutputs, ByteLanes, Dut, Edge, Request, SignalSnapshot};
pub use transaction::{BusTransaction, Direction, Phase, Width};

#[cfg(feature = "verilator")]
pub use simulator::{create_femtorv_runtime, FemtoRvTestbench};
