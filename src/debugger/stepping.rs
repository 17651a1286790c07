use super::classify::Instruction;
use crate::error::Result;
use crate::parser::RegisterSnapshot;
use crate::target::{CompletionReason, RunMode, StepKind, Target, TransportCapability};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Where the session's cursor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Live,
    Historical,
}

/// Why an operation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Step,
    Breakpoint { address: u16 },
    ReachedStartOfHistory,
    ReachedLiveEdge,
    Paused,
    CallStackEmpty,
    Target(String),
}

impl From<CompletionReason> for StopReason {
    fn from(reason: CompletionReason) -> Self {
        match reason {
            CompletionReason::Breakpoint { address } => StopReason::Breakpoint { address },
            CompletionReason::ReachedAddress => StopReason::Step,
            CompletionReason::Paused => StopReason::Paused,
            CompletionReason::Message(text) => StopReason::Target(text),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Step => write!(f, "step"),
            StopReason::Breakpoint { address } => write!(f, "breakpoint at {:04X}h", address),
            StopReason::ReachedStartOfHistory => write!(f, "start of history reached"),
            StopReason::ReachedLiveEdge => write!(f, "end of history reached"),
            StopReason::Paused => write!(f, "paused"),
            StopReason::CallStackEmpty => write!(f, "call stack empty"),
            StopReason::Target(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub reason: StopReason,
    /// Disassembly of the instruction the cursor stopped on.
    pub instruction: Option<String>,
}

/// Live step-over, picked once by what the target can do.
pub trait LiveStepping {
    fn step_over(
        &self,
        target: &mut dyn Target,
        current: &RegisterSnapshot,
        instruction: &Instruction,
    ) -> Result<StopReason>;
}

/// Calls cannot be skipped without target help, they are stepped into.
pub struct BasicStepping;

impl LiveStepping for BasicStepping {
    fn step_over(
        &self,
        target: &mut dyn Target,
        _current: &RegisterSnapshot,
        instruction: &Instruction,
    ) -> Result<StopReason> {
        let kind = if instruction.class.is_call() {
            StepKind::Into
        } else {
            StepKind::Over
        };
        target.step_live(kind)?;
        Ok(StopReason::Step)
    }
}

/// Runs over calls with a temporary breakpoint behind them.
pub struct FastBreakpointStepping;

impl LiveStepping for FastBreakpointStepping {
    fn step_over(
        &self,
        target: &mut dyn Target,
        current: &RegisterSnapshot,
        instruction: &Instruction,
    ) -> Result<StopReason> {
        if !instruction.class.is_call() {
            target.step_live(StepKind::Over)?;
            return Ok(StopReason::Step);
        }
        let address = instruction.next_pc(current.pc);
        debug!(address, sp = current.sp, "running over call");
        let reason = target.run_live(RunMode::Until {
            address,
            stack_pointer: Some(current.sp),
        })?;
        Ok(reason.into())
    }
}

pub fn live_stepping_for(capability: TransportCapability) -> Box<dyn LiveStepping> {
    match capability {
        TransportCapability::Basic => Box::new(BasicStepping),
        TransportCapability::FastBreakpoints => Box::new(FastBreakpointStepping),
    }
}
