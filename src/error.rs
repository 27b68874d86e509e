//! Failure taxonomy of a verification run.
//!
//! Protocol violations and value mismatches abort the scenario; nothing is
//! retried. Encoding violations are recovered by the fuzzer and only reach
//! callers that encode instructions by hand.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::isa::EncodeError;
use crate::signals::SignalSnapshot;
use crate::transaction::Phase;

/// What a mismatching value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Register(u8),
    Address(u32),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Register(reg) => write!(f, "x{reg}"),
            Target::Address(address) => write!(f, "address {address:#010x}"),
        }
    }
}

/// A signal that diverged from the bus contract, with the full bus state.
#[derive(Debug, Clone)]
pub struct Violation {
    pub transaction: String,
    pub phase: Phase,
    pub signal: &'static str,
    pub expected: String,
    pub observed: String,
    pub snapshot: SignalSnapshot,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} during {} of {}: expected {}, observed {}\n  {}",
            self.signal, self.phase, self.transaction, self.expected, self.observed, self.snapshot
        )
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(Box<Violation>),

    #[error("value mismatch at {target}: expected {expected:#010x}, observed {observed:#010x}")]
    ValueMismatch {
        target: Target,
        expected: u32,
        observed: u32,
    },

    #[error("scenario timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Encoding(#[from] EncodeError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scenario cannot continue: {0}")]
    Scenario(String),

    #[error("simulator backend: {0}")]
    Backend(String),
}

impl VerifyError {
    pub fn violation(
        transaction: impl fmt::Display,
        phase: Phase,
        signal: &'static str,
        expected: impl fmt::Display,
        observed: impl fmt::Display,
        snapshot: &SignalSnapshot,
    ) -> Self {
        VerifyError::ProtocolViolation(Box::new(Violation {
            transaction: transaction.to_string(),
            phase,
            signal,
            expected: expected.to_string(),
            observed: observed.to_string(),
            snapshot: *snapshot,
        }))
    }

    pub fn as_violation(&self) -> Option<&Violation> {
        match self {
            VerifyError::ProtocolViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

pub type Result<T, E = VerifyError> = std::result::Result<T, E>;
