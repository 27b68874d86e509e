use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use eyre::Result;
use log::info;
use rvbus_verify::{
    run_with_timeout, BehavioralCore, BenchConfig, CoreConfig, Dut, Session, Variant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Built-in behavioral RV32 core
    Model,
    /// Verilator build of the RTL under rtl/
    Verilator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Fuzz,
    SubWord,
    WaitStates,
    Interrupt,
}

impl Scenario {
    fn includes(self, other: Scenario) -> bool {
        self == Scenario::All || self == other
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Bus protocol and ALU verifier for a femtorv-style core", long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Backend::Model)]
    backend: Backend,

    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Seed for register values and generated instructions
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    rounds: Option<u32>,

    /// Generated instructions per fuzz round
    #[arg(long)]
    instructions: Option<u32>,

    /// rv32i or rv32e
    #[arg(long)]
    variant: Option<Variant>,

    /// Highest register index picked for fuzzed rd and rs1
    #[arg(long)]
    fuzz_registers: Option<u8>,

    /// Largest wait-state count exercised
    #[arg(long)]
    max_wait: Option<u32>,

    /// Overall scenario timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Verilator build directory
    #[cfg_attr(not(feature = "verilator"), allow(dead_code))]
    #[arg(long)]
    artifacts: Option<Utf8PathBuf>,

    /// Extra RTL source for the Verilator backend (repeatable)
    #[cfg_attr(not(feature = "verilator"), allow(dead_code))]
    #[arg(long)]
    rtl: Vec<Utf8PathBuf>,
}

impl Cli {
    fn bench_config(&self) -> BenchConfig {
        let mut config = BenchConfig::default();
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(rounds) = self.rounds {
            config.rounds = rounds;
        }
        if let Some(instructions) = self.instructions {
            config.instructions_per_round = instructions;
        }
        if let Some(variant) = self.variant {
            config.variant = variant;
            config.fuzz_register_limit = config
                .fuzz_register_limit
                .min(variant.register_count() - 1);
        }
        if let Some(limit) = self.fuzz_registers {
            config.fuzz_register_limit = limit;
        }
        if let Some(max_wait) = self.max_wait {
            config.max_wait_cycles = max_wait;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

async fn run<D: Dut>(dut: D, config: BenchConfig, scenario: Scenario) -> Result<()> {
    let limit = config.timeout;
    let max_wait = config.max_wait_cycles;
    let mut session = Session::new(dut, config)?;

    run_with_timeout(limit, async {
        session.reset().await?;

        if scenario.includes(Scenario::Fuzz) {
            println!("🎲 Fuzzing ALU instructions...");
            let reports = session.run_rounds().await?;
            let instructions: usize = reports.iter().map(|r| r.trace.len()).sum();
            println!(
                "✅ Register file matches the reference after {} round(s), {instructions} instruction(s)",
                reports.len()
            );
        }

        if scenario.includes(Scenario::SubWord) {
            println!("🔍 Testing byte and half-word accesses...");
            session.sub_word_round().await?;
            println!("✅ Sub-word accesses verified");
        }

        if scenario.includes(Scenario::WaitStates) {
            println!("⏳ Testing wait states...");
            for cycles in 0..=max_wait {
                session.wait_state_round(cycles).await?;
            }
            println!("✅ Wait states verified up to {max_wait} cycle(s)");
        }

        if scenario.includes(Scenario::Interrupt) {
            println!("🔔 Testing interrupt delivery...");
            let report = session.interrupt_scenario().await?;
            println!(
                "✅ Interrupt vectored to {:#010x}, cause {:#010x}, resumed at {:#010x}",
                report.handler_address, report.cause, report.resumed_at
            );
        }
        Ok(())
    })
    .await?;

    info!("finished at cycle {}", session.bus().cycle());
    Ok(())
}

#[cfg(feature = "verilator")]
async fn run_verilator(cli: &Cli, config: BenchConfig) -> Result<()> {
    use rvbus_verify::{create_femtorv_runtime, FemtoRvTestbench, VerilatorOptions};

    let mut options = VerilatorOptions::default();
    if let Some(dir) = &cli.artifacts {
        options.artifacts_dir = dir.clone();
    }
    options.sources.extend(cli.rtl.iter().cloned());

    let runtime = create_femtorv_runtime(&options)?;
    let model = runtime
        .create_model_simple::<FemtoRvTestbench>()
        .map_err(|e| eyre::eyre!("Failed to create femtorv model: {:?}", e))?;
    println!("✅ femtorv model created!");

    run(model, config, cli.scenario).await
}

#[cfg(not(feature = "verilator"))]
async fn run_verilator(_cli: &Cli, _config: BenchConfig) -> Result<()> {
    Err(eyre::eyre!(
        "this binary was built without the `verilator` feature"
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.bench_config();
    config.validate()?;

    println!(
        "🚀 Bus verifier starting ({}, seed {:#x})...",
        config.variant, config.seed
    );

    match cli.backend {
        Backend::Model => {
            let core = BehavioralCore::new(CoreConfig::from(&config));
            run(core, config, cli.scenario).await?;
        }
        Backend::Verilator => run_verilator(&cli, config).await?,
    }

    println!("🎉 All scenarios passed!");
    Ok(())
}
