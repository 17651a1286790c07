mod breakpoints;
mod classify;
mod frame;
mod history;
mod reconstruct;
mod session;
mod stepping;

pub use breakpoints::{BreakpointPredicate, Breakpoints};
pub use classify::{
    find_call_site, CallSite, Classifier, Condition, Instruction, InstructionClass, ReturnKind,
    SpSource, StackOperand, Z80Classifier,
};
pub use frame::{Frame, LocalValue, VirtualCallStack, CURRENT, INTERRUPT, UNKNOWN_CALLER};
pub use history::HistoryCursor;
pub use reconstruct::{InterruptHeuristic, Reconstructor, DEFAULT_INTERRUPT_VECTORS};
pub use session::{DebugSession, SessionEvent};
pub use stepping::{
    live_stepping_for, BasicStepping, FastBreakpointStepping, LiveStepping, Mode, StepOutcome,
    StopReason,
};
