mod queue;
mod remote;
mod trace;
mod transport;

pub use queue::{CommandQueue, Pending};
pub use remote::SimulatorTarget;
pub use trace::TraceTarget;
pub use transport::{LineTransport, Transport, PROMPT_PREFIX, PROMPT_SUFFIX};

use crate::debugger::Frame;
use crate::error::Result;
use crate::parser::RegisterSnapshot;
use std::fmt;
use std::sync::Arc;

/// How the target's live execution primitives are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCapability {
    Basic,
    /// Breakpoints that can be set and cleared without occupying a slot.
    FastBreakpoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continue,
    /// Run until PC equals `address`, optionally only once SP is at least `stack_pointer`.
    Until {
        address: u16,
        stack_pointer: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
}

/// Why a live run returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReason {
    Breakpoint { address: u16 },
    ReachedAddress,
    Paused,
    Message(String),
}

/// Interrupts a running target from another thread.
#[derive(Clone)]
pub struct PauseHandle {
    signal: Arc<dyn Fn() -> Result<()> + Send + Sync>,
}

impl PauseHandle {
    pub fn new(signal: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn pause(&self) -> Result<()> {
        (self.signal)()
    }
}

impl fmt::Debug for PauseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PauseHandle")
    }
}

/// The machine being debugged.
pub trait Target {
    fn capability(&self) -> TransportCapability;

    /// Entry `index` of the trace log, 0 being the most recently executed
    /// instruction. `Ok(None)` when no such entry was recorded.
    fn fetch_snapshot(&mut self, index: usize) -> Result<Option<RegisterSnapshot>>;

    /// Live registers.
    fn registers(&mut self) -> Result<RegisterSnapshot>;

    fn run_live(&mut self, mode: RunMode) -> Result<CompletionReason>;

    fn step_live(&mut self, kind: StepKind) -> Result<RegisterSnapshot>;

    /// Innermost first, index 0 being the current position.
    fn real_call_stack(&mut self) -> Result<Vec<Frame>>;

    fn read_memory(&mut self, address: u16, len: usize) -> Result<Vec<u8>>;

    /// Replaces the breakpoints the target stops at while running live.
    fn sync_breakpoints(&mut self, _addresses: &[u16]) -> Result<()> {
        Ok(())
    }

    fn pause_handle(&self) -> Option<PauseHandle> {
        None
    }
}
