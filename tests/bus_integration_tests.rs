use std::time::Duration;

use rvbus_verify::isa::csr;
use rvbus_verify::sequencer::Sequencer;
use rvbus_verify::{
    run_with_timeout, AluOp, BehavioralCore, BenchConfig, Bus, BusTransaction, CoreConfig,
    CsrOp, CsrSource, Fault, Instr, Phase, ReferenceRegisterFile, Session, Target, Variant,
    VerifyError, Width,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> BenchConfig {
    BenchConfig {
        rounds: 1,
        instructions_per_round: 40,
        ..BenchConfig::default()
    }
}

fn core_with(config: &BenchConfig, faults: &[Fault]) -> BehavioralCore {
    faults
        .iter()
        .fold(BehavioralCore::new(CoreConfig::from(config)), |core, fault| {
            core.with_fault(*fault)
        })
}

async fn reset_session(faults: &[Fault]) -> Session<BehavioralCore> {
    init_logging();
    let config = small_config();
    let mut session = Session::new(core_with(&config, faults), config).unwrap();
    session.reset().await.unwrap();
    session
}

fn addi(rd: u8, rs1: u8, imm: i32) -> Instr {
    Instr::OpImm {
        op: AluOp::Add,
        rd,
        rs1,
        imm,
    }
}

fn load(width: Width, rd: u8, offset: i32) -> Instr {
    Instr::Load {
        width,
        unsigned: false,
        rd,
        rs1: 0,
        offset,
    }
}

fn store(width: Width, rs2: u8, offset: i32) -> Instr {
    Instr::Store {
        width,
        rs2,
        rs1: 0,
        offset,
    }
}

fn violation_of(err: &VerifyError) -> (Phase, &'static str) {
    let violation = err
        .as_violation()
        .unwrap_or_else(|| panic!("expected a protocol violation, got {err}"));
    (violation.phase, violation.signal)
}

#[tokio::test]
async fn test_reset_then_sequential_fetches() {
    let mut session = reset_session(&[]).await;
    let reset_address = session.config().reset_address;

    let start = session.bus().cycle();
    assert_eq!(session.execute(&Instr::nop()).await.unwrap(), reset_address);
    // two beats, each an address and a data cycle
    assert_eq!(session.bus().cycle() - start, 4);

    assert_eq!(
        session.execute(&Instr::nop()).await.unwrap(),
        reset_address + 4
    );
    assert_eq!(session.pc(), Some(reset_address + 8));
}

#[tokio::test]
async fn test_execute_before_reset_is_rejected() {
    init_logging();
    let config = small_config();
    let mut session = Session::new(core_with(&config, &[]), config).unwrap();
    let err = session.execute(&Instr::nop()).await.unwrap_err();
    assert!(matches!(err, VerifyError::Scenario(_)));
}

#[tokio::test]
async fn test_register_round_trip_through_scratch_word() {
    let mut session = reset_session(&[]).await;
    session.load_register(7, 0xdead_beef).await.unwrap();
    session.check_register(7).await.unwrap();
    session.execute(&addi(8, 7, 1)).await.unwrap();
    session.check_register(8).await.unwrap();
    assert_eq!(session.oracle().registers().get_u32(8), 0xdead_bef0);
    assert_eq!(session.into_dut().register(8), 0xdead_bef0);
}

#[tokio::test]
async fn test_x0_reads_zero_after_load() {
    let mut session = reset_session(&[]).await;
    session.load_register(0, 0x1234_5678).await.unwrap();
    session.check_register(0).await.unwrap();
}

#[tokio::test]
async fn test_jal_redirects_fetch_and_links() {
    let mut session = reset_session(&[]).await;
    let at = session
        .execute(&Instr::Jal { rd: 1, offset: 0x20 })
        .await
        .unwrap();
    let target = session.execute(&Instr::nop()).await.unwrap();
    assert_eq!(target, at + 0x20);
    session.check_register(1).await.unwrap();
    assert_eq!(session.oracle().registers().get_u32(1), at + 4);
}

#[tokio::test]
async fn test_wait_cycles_extend_each_beat() {
    let mut session = reset_session(&[]).await;
    let scratch = session.config().scratch_offset;
    // the first fetch after reset is already pending, so settle first
    session.execute(&Instr::nop()).await.unwrap();

    let mut measure = Vec::new();
    for (width, wait) in [
        (Width::Word, 0),
        (Width::Word, 3),
        (Width::Byte, 0),
        (Width::Byte, 3),
    ] {
        session.set_wait_cycles(wait);
        let start = session.bus().cycle();
        session.execute(&load(width, 4, scratch)).await.unwrap();
        measure.push(session.bus().cycle() - start);
    }
    session.set_wait_cycles(0);

    assert_eq!(measure[1] - measure[0], 6);
    assert_eq!(measure[3] - measure[2], 3);
}

#[tokio::test]
async fn test_stores_hold_data_through_wait_cycles() {
    let mut session = reset_session(&[]).await;
    session.load_register(3, 0x8081_8283).await.unwrap();
    session.set_wait_cycles(2);
    let scratch = session.config().scratch_offset;
    for (width, offset) in [(Width::Word, 0), (Width::Half, 2), (Width::Byte, 3)] {
        session
            .execute(&store(width, 3, scratch + offset))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_sub_word_loads_extend() {
    let mut session = reset_session(&[]).await;
    let scratch = session.config().scratch_offset;
    session.load_register(1, 0x80ff_7f01).await.unwrap();

    // bytes at scratch: 01 7f ff 80, rewritten before each load because
    // the readback overwrites the scratch word
    let cases = [
        (Width::Byte, false, 3, 0xffff_ff80u32),
        (Width::Byte, true, 3, 0x0000_0080),
        (Width::Byte, false, 1, 0x0000_007f),
        (Width::Half, false, 2, 0xffff_80ff),
        (Width::Half, true, 2, 0x0000_80ff),
    ];
    for (width, unsigned, offset, expected) in cases {
        session.execute(&store(Width::Word, 1, scratch)).await.unwrap();
        session
            .execute(&Instr::Load {
                width,
                unsigned,
                rd: 2,
                rs1: 0,
                offset: scratch + offset,
            })
            .await
            .unwrap();
        assert_eq!(session.oracle().registers().get_u32(2), expected);
        session.check_register(2).await.unwrap();
    }
}

#[tokio::test]
async fn test_sub_word_and_wait_state_rounds_pass() {
    let mut session = reset_session(&[]).await;
    session.sub_word_round().await.unwrap();
    for cycles in 0..=3 {
        session.wait_state_round(cycles).await.unwrap();
    }
}

#[tokio::test]
async fn test_byte_write_uses_high_lane_at_odd_address() {
    init_logging();
    let config = BenchConfig::default();
    let mut bus = Bus::new(core_with(&config, &[]), &config);
    let mut sequencer = Sequencer::new(&config);
    sequencer.perform_reset(&mut bus).await.unwrap();

    let sb = store(Width::Byte, 0, 0x21).encode(Variant::Rv32I).unwrap();
    bus.drive_fetch(sb, Some(0)).await.unwrap();
    let tx = BusTransaction::write(Width::Byte, 0x21, 0x5a);
    match bus.expect_write(&tx).await {
        Err(VerifyError::ValueMismatch {
            target,
            expected,
            observed,
        }) => {
            assert_eq!(target, Target::Address(0x21));
            assert_eq!(expected, 0x5a);
            assert_eq!(observed, 0);
        }
        other => panic!("expected a value mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_detects_wrong_second_beat_address() {
    let mut session = reset_session(&[Fault::BeatStride(4)]).await;
    let err = session.execute(&Instr::nop()).await.unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Address, "address"));
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.snapshot.outputs.addr, 4);
}

#[tokio::test]
async fn test_detects_ignored_wait() {
    let mut session = reset_session(&[Fault::IgnoreWait]).await;
    session.set_wait_cycles(2);
    let scratch = session.config().scratch_offset;
    let err = session
        .execute(&load(Width::Word, 1, scratch))
        .await
        .unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Wait, "address"));
}

#[tokio::test]
async fn test_detects_output_enable_held_after_write() {
    let mut session = reset_session(&[Fault::LateOutputEnable]).await;
    let err = session.check_register(0).await.unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Release, "data-output-enable"));
}

#[tokio::test]
async fn test_detects_both_lanes_on_byte_store() {
    let mut session = reset_session(&[Fault::WideByteStores]).await;
    let scratch = session.config().scratch_offset;
    let err = session
        .execute(&store(Width::Byte, 0, scratch + 1))
        .await
        .unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Address, "byte-lane-mask"));
}

#[tokio::test]
async fn test_detects_write_strobe_during_fetch() {
    let mut session = reset_session(&[Fault::ConflictingStrobes]).await;
    let err = session.execute(&Instr::nop()).await.unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Data, "request"));
    let outputs = err.as_violation().unwrap().snapshot.outputs;
    assert!(!outputs.rd_n && !outputs.wr_n);
}

#[tokio::test]
async fn test_detects_lane_mask_change_within_write_beat() {
    let mut session = reset_session(&[Fault::LaneGlitch]).await;
    let err = session.check_register(0).await.unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Data, "byte-lane-mask"));
    assert_eq!(err.as_violation().unwrap().snapshot.outputs.wrm_n, 0b11);
}

#[tokio::test]
async fn test_detects_half_word_load_at_odd_address() {
    let mut session = reset_session(&[]).await;
    let scratch = session.config().scratch_offset;
    let err = session
        .execute(&load(Width::Half, 1, scratch + 1))
        .await
        .unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Address, "address alignment"));
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.snapshot.outputs.addr, scratch as u32 + 1);
}

#[tokio::test]
async fn test_detects_corrupted_alu_result() {
    let mut session = reset_session(&[Fault::CorruptAlu { nth: 0, mask: 1 }]).await;
    session.execute(&addi(5, 0, 7)).await.unwrap();
    match session.check_register(5).await {
        Err(VerifyError::ValueMismatch {
            target,
            expected,
            observed,
        }) => {
            assert_eq!(target, Target::Register(5));
            assert_eq!(expected, 7);
            assert_eq!(observed, 6);
        }
        other => panic!("expected a value mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_interrupt_scenario() {
    init_logging();
    let config = small_config();
    let vector = config.interrupt_vector;
    let cause = config.interrupt_cause;
    let mut session = Session::new(core_with(&config, &[]), config).unwrap();
    session.reset().await.unwrap();

    let report = session.interrupt_scenario().await.unwrap();
    assert_eq!(report.handler_address, vector);
    assert_eq!(report.cause, cause);
    assert_eq!(report.resumed_at, report.return_address);
    assert!(session.sequencer().interrupt().enabled);
}

#[tokio::test]
async fn test_disabled_interrupt_is_not_taken() {
    let mut session = reset_session(&[]).await;
    session.assert_interrupt();
    for expected in [0, 4, 8] {
        assert_eq!(session.execute(&Instr::nop()).await.unwrap(), expected);
    }
    // reading mstatus shows interrupts still disabled
    session
        .execute(&Instr::Csr {
            op: CsrOp::ReadSet,
            rd: 6,
            csr: csr::MSTATUS,
            src: CsrSource::Register(0),
        })
        .await
        .unwrap();
    session.check_register(6).await.unwrap();
    assert_eq!(session.oracle().registers().get_u32(6), 0);
}

#[tokio::test]
async fn test_detects_ignored_interrupt() {
    init_logging();
    let config = small_config();
    let mut session =
        Session::new(core_with(&config, &[Fault::IgnoreInterrupts]), config).unwrap();
    session.reset().await.unwrap();
    let err = session.interrupt_scenario().await.unwrap_err();
    assert_eq!(violation_of(&err), (Phase::Address, "address"));
}

#[tokio::test]
async fn test_interrupt_scenario_keeps_earlier_state() {
    let mut session = reset_session(&[]).await;
    session.fuzz_round().await.unwrap();
    let before = session.oracle().registers().clone();
    let cycle = session.bus().cycle();

    session.interrupt_scenario().await.unwrap();
    assert!(session.bus().cycle() > cycle);
    // only the handler's scratch registers changed
    for reg in 4..32 {
        assert_eq!(session.oracle().registers().get(reg), before.get(reg), "x{reg}");
    }
    session.check_all().await.unwrap();
}

#[tokio::test]
async fn test_interrupt_scenario_needs_interrupts_disabled() {
    let mut session = reset_session(&[]).await;
    session.interrupt_scenario().await.unwrap();
    let err = session.interrupt_scenario().await.unwrap_err();
    assert!(matches!(err, VerifyError::Scenario(_)), "{err}");
}

#[tokio::test]
async fn test_interrupt_scenario_before_reset_is_rejected() {
    init_logging();
    let config = small_config();
    let mut session = Session::new(core_with(&config, &[]), config).unwrap();
    let err = session.interrupt_scenario().await.unwrap_err();
    assert!(matches!(err, VerifyError::Scenario(_)), "{err}");
}

#[tokio::test]
async fn test_mret_without_interrupt_is_rejected() {
    let mut session = reset_session(&[]).await;
    let err = session.execute(&Instr::Mret).await.unwrap_err();
    assert!(matches!(err, VerifyError::Scenario(_)));
}

#[tokio::test]
async fn test_dut_that_never_fetches_times_out() {
    init_logging();
    let config = small_config();
    let mut session = Session::new(core_with(&config, &[Fault::NeverFetch]), config).unwrap();
    let limit = Duration::from_millis(200);
    let err = run_with_timeout(limit, session.reset()).await.unwrap_err();
    assert!(matches!(err, VerifyError::Timeout(d) if d == limit));
}

#[tokio::test]
async fn test_fuzz_round_matches_reference() {
    let mut session = reset_session(&[]).await;
    let report = session.fuzz_round().await.unwrap();
    assert_eq!(report.trace.len(), 40);
    assert_eq!(report.replayed(), report.final_state);
    assert_eq!(
        ReferenceRegisterFile::replay_recorded(&report.initial, &report.trace),
        report.final_state
    );
}

#[tokio::test]
async fn test_round_final_state_matches_core_registers() {
    let mut session = reset_session(&[]).await;
    let report = session.fuzz_round().await.unwrap();
    let core = session.into_dut();
    for reg in 0..32 {
        assert_eq!(core.register(reg), report.final_state.get_u32(reg), "x{reg}");
    }
}

#[tokio::test]
async fn test_fuzz_rounds_are_deterministic_per_seed() {
    let mut first = reset_session(&[]).await;
    let mut second = reset_session(&[]).await;
    let a = first.fuzz_round().await.unwrap();
    let b = second.fuzz_round().await.unwrap();
    assert_eq!(a.initial, b.initial);
    assert_eq!(a.trace, b.trace);
    assert_eq!(a.final_state, b.final_state);
}

#[tokio::test]
async fn test_corrupted_recorded_result_never_matches() {
    let mut session = reset_session(&[]).await;
    let report = session.fuzz_round().await.unwrap();

    // the last writer of a register is never masked by a later write
    let index = report
        .trace
        .iter()
        .rposition(|step| step.instruction.rd != 0)
        .unwrap();
    let mut corrupted = report.trace.clone();
    corrupted[index].result ^= 1;
    assert_ne!(
        ReferenceRegisterFile::replay_recorded(&report.initial, &corrupted),
        report.final_state
    );
}

#[tokio::test]
async fn test_fuzz_round_detects_corrupted_dut_result() {
    let mut clean = reset_session(&[]).await;
    let report = clean.fuzz_round().await.unwrap();
    let nth = report
        .trace
        .iter()
        .rposition(|step| step.instruction.rd != 0)
        .unwrap() as u64;

    let mut faulty = reset_session(&[Fault::CorruptAlu { nth, mask: 0x8000 }]).await;
    let err = faulty.fuzz_round().await.unwrap_err();
    assert!(matches!(err, VerifyError::ValueMismatch { .. }), "{err}");
}

#[tokio::test]
async fn test_rv32e_round() {
    init_logging();
    let config = BenchConfig {
        variant: Variant::Rv32E,
        fuzz_register_limit: 15,
        ..small_config()
    };
    let mut session = Session::new(core_with(&config, &[]), config).unwrap();
    session.reset().await.unwrap();
    let report = session.fuzz_round().await.unwrap();
    assert!(report
        .trace
        .iter()
        .all(|step| step.instruction.rd < 16 && step.instruction.rs1 < 16));
}
