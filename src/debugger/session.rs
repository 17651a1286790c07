use super::breakpoints::{BreakpointPredicate, Breakpoints};
use super::classify::{find_call_site, CallSite, Classifier, Instruction};
use super::frame::{Frame, VirtualCallStack};
use super::history::HistoryCursor;
use super::reconstruct::{InterruptHeuristic, Reconstructor};
use super::stepping::{live_stepping_for, LiveStepping, Mode, StepOutcome, StopReason};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::parser::{RegisterSnapshot, SymbolResolver};
use crate::target::{PauseHandle, RunMode, StepKind, Target};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The walked history changed; PCs most recent first, empty when live.
    HistoryChanged { addresses: Vec<u16> },
    Stopped { reason: StopReason },
}

/// One instruction replayed forward.
struct Transition {
    older: RegisterSnapshot,
    instruction: Instruction,
    newer: Option<RegisterSnapshot>,
}

/// One debug session: the target plus everything needed to replay its history.
pub struct DebugSession {
    target: Box<dyn Target>,
    classifier: Box<dyn Classifier>,
    reconstructor: Reconstructor,
    history: HistoryCursor,
    stack: Option<VirtualCallStack>,
    /// Live registers, refreshed whenever the target ran.
    registers: RegisterSnapshot,
    breakpoints: Breakpoints,
    stepping: Box<dyn LiveStepping>,
    events: Option<Sender<SessionEvent>>,
    pause_requested: Arc<AtomicBool>,
}

impl DebugSession {
    pub fn new(
        mut target: Box<dyn Target>,
        classifier: Box<dyn Classifier>,
        symbols: Box<dyn SymbolResolver>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let registers = target.registers()?;
        let capability = target.capability();
        info!(?capability, pc = registers.pc, "debug session started");
        Ok(Self {
            target,
            classifier,
            reconstructor: Reconstructor::new(
                symbols,
                InterruptHeuristic::new(config.interrupt_vectors.clone()),
            ),
            history: HistoryCursor::with_limit(config.history.reverse_debug_instruction_count),
            stack: None,
            registers,
            breakpoints: Breakpoints::new(),
            stepping: live_stepping_for(capability),
            events: None,
            pause_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_event_sender(&mut self, sender: Sender<SessionEvent>) {
        self.events = Some(sender);
    }

    pub fn mode(&self) -> Mode {
        if self.history.is_historical() {
            Mode::Historical
        } else {
            Mode::Live
        }
    }

    pub fn is_historical(&self) -> bool {
        self.history.is_historical()
    }

    pub fn history(&self) -> &HistoryCursor {
        &self.history
    }

    pub fn symbols(&self) -> &dyn SymbolResolver {
        self.reconstructor.symbols()
    }

    /// Registers at the cursor: historical while replaying, live otherwise.
    pub fn current_registers(&self) -> RegisterSnapshot {
        self.history.current().copied().unwrap_or(self.registers)
    }

    /// The call stack at the cursor, innermost first.
    pub fn current_frames(&mut self) -> Result<Vec<Frame>> {
        match &self.stack {
            Some(stack) => Ok(stack.to_vec()),
            None => self.target.real_call_stack(),
        }
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    pub fn add_breakpoint(&mut self, address: u16) {
        self.breakpoints.add(address);
    }

    pub fn remove_breakpoint(&mut self, address: u16) {
        self.breakpoints.remove(address);
    }

    pub fn set_breakpoints(&mut self, addresses: &[u16]) {
        self.breakpoints.clear();
        for &address in addresses {
            self.breakpoints.add(address);
        }
    }

    /// Stops a running operation from another thread: replay loops end at
    /// the next instruction, a live run is interrupted at the target.
    pub fn pause_handle(&self) -> PauseHandle {
        let flag = Arc::clone(&self.pause_requested);
        let target = self.target.pause_handle();
        PauseHandle::new(move || {
            flag.store(true, Ordering::SeqCst);
            match &target {
                Some(handle) => handle.pause(),
                None => Ok(()),
            }
        })
    }

    pub fn step_into(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        if self.is_historical() {
            let transition = self.replay_forward()?;
            self.history_changed();
            let reason = match transition.newer {
                Some(_) => StopReason::Step,
                None => StopReason::ReachedLiveEdge,
            };
            return Ok(self.stopped(reason));
        }

        self.leave_history();
        self.registers = self.target.step_live(StepKind::Into)?;
        Ok(self.stopped(StopReason::Step))
    }

    pub fn step_over(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        if self.is_historical() {
            let start = self.current_registers();
            let instruction = self.instruction_at(&start)?;
            // A call is over once its return restores SP.
            let expected_sp = if instruction.class.is_call() {
                Some(start.sp)
            } else {
                instruction.predict_sp(&start)
            };
            let Some(expected_sp) = expected_sp else {
                return self.step_into();
            };
            trace!(expected_sp, "historical step over");
            let reason = self.replay_forward_until(|t| {
                t.newer.map_or(false, |newer| newer.sp == expected_sp)
            })?;
            return Ok(self.stopped(reason));
        }

        self.leave_history();
        let current = self.registers;
        let instruction = self.instruction_at(&current)?;
        let reason = self
            .stepping
            .step_over(self.target.as_mut(), &current, &instruction)?;
        self.registers = self.target.registers()?;
        Ok(self.stopped(reason))
    }

    pub fn step_out(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        if self.is_historical() {
            let start = self.current_registers();
            let threshold = match self.stack.as_ref().and_then(VirtualCallStack::enclosing) {
                Some(caller) => caller.caller_stack_pointer,
                None => start.sp.wrapping_add(1),
            };
            trace!(threshold, "historical step out");
            let reason = self.replay_forward_until(|t| match t.newer {
                Some(newer) => {
                    t.instruction.class.is_return()
                        && t.instruction.is_taken(&t.older)
                        && newer.sp >= threshold
                }
                None => false,
            })?;
            return Ok(self.stopped(reason));
        }

        self.leave_history();
        let frames = self.target.real_call_stack()?;
        let Some(caller) = frames.get(1) else {
            return Ok(self.stopped(StopReason::CallStackEmpty));
        };
        let caller_sp = caller.caller_stack_pointer;
        let bytes = self.target.read_memory(caller_sp.wrapping_sub(2), 2)?;
        let return_address = match bytes.as_slice() {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => return Ok(self.stopped(StopReason::CallStackEmpty)),
        };
        debug!(return_address, caller_sp, "running to return address");
        let completion = self.target.run_live(RunMode::Until {
            address: return_address,
            stack_pointer: Some(caller_sp),
        })?;
        self.registers = self.target.registers()?;
        Ok(self.stopped(completion.into()))
    }

    /// Historical: replays towards the live edge. Live: runs the target.
    pub fn continue_(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        if self.is_historical() {
            let reason = self.replay_forward_until(|_| false)?;
            return Ok(self.stopped(reason));
        }

        self.leave_history();
        let addresses = self.breakpoints.addresses();
        self.target.sync_breakpoints(&addresses)?;
        let completion = self.target.run_live(RunMode::Continue)?;
        self.registers = self.target.registers()?;
        Ok(self.stopped(completion.into()))
    }

    pub fn step_back(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        let reason = match self.replay_backward()? {
            Some(_) => StopReason::Step,
            None => StopReason::ReachedStartOfHistory,
        };
        self.history_changed();
        Ok(self.stopped(reason))
    }

    /// Walks back until a breakpoint or the start of the history. Never runs the target.
    pub fn reverse_continue(&mut self) -> Result<StepOutcome> {
        self.begin_operation();
        let reason = loop {
            if self.pause_requested.load(Ordering::SeqCst) {
                break StopReason::Paused;
            }
            match self.replay_backward()? {
                None => break StopReason::ReachedStartOfHistory,
                Some(snapshot) if self.breakpoints.matches(&snapshot) => {
                    break StopReason::Breakpoint {
                        address: snapshot.pc,
                    }
                }
                Some(_) => {}
            }
        };
        self.history_changed();
        Ok(self.stopped(reason))
    }

    /// Ends the session's replay state. The history is invalid afterwards.
    pub fn terminate(&mut self) {
        self.leave_history();
        info!("debug session terminated");
    }

    fn begin_operation(&mut self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    fn leave_history(&mut self) {
        let was_historical = self.history.is_historical();
        self.history.clear();
        self.stack = None;
        if was_historical {
            self.history_changed();
        }
    }

    fn instruction_at(&mut self, snapshot: &RegisterSnapshot) -> Result<Instruction> {
        let bytes = match snapshot.opcodes {
            Some(opcodes) => opcodes.to_vec(),
            None => self.target.read_memory(snapshot.pc, 4)?,
        };
        Ok(self.classifier.classify(&bytes, snapshot.pc))
    }

    /// The call in front of `return_address`. Unreadable memory means no caller.
    fn caller_site(&mut self, return_address: u16) -> Option<CallSite> {
        match self.target.read_memory(return_address.wrapping_sub(3), 3) {
            Ok(bytes) => find_call_site(self.classifier.as_ref(), return_address, &bytes),
            Err(e) => {
                debug!(return_address, error = %e, "caller lookup failed");
                None
            }
        }
    }

    fn replay_forward(&mut self) -> Result<Transition> {
        let older = self.current_registers();
        let instruction = self.instruction_at(&older)?;
        let newer = self.history.step_forward();
        self.reconstructor
            .forward(&mut self.stack, &older, newer.as_ref(), &instruction);
        if newer.is_none() {
            debug!("back at the live edge");
            self.registers = self.target.registers()?;
        }
        Ok(Transition {
            older,
            instruction,
            newer,
        })
    }

    /// Replays forward until `done` holds, a breakpoint is hit, a pause is
    /// requested or the live edge is reached.
    fn replay_forward_until(
        &mut self,
        done: impl Fn(&Transition) -> bool,
    ) -> Result<StopReason> {
        let reason = loop {
            if self.pause_requested.load(Ordering::SeqCst) {
                break StopReason::Paused;
            }
            let transition = self.replay_forward()?;
            let Some(newer) = transition.newer else {
                break StopReason::ReachedLiveEdge;
            };
            if done(&transition) {
                break StopReason::Step;
            }
            if self.breakpoints.matches(&newer) {
                break StopReason::Breakpoint { address: newer.pc };
            }
        };
        self.history_changed();
        Ok(reason)
    }

    /// One instruction back. `None` at the start of the recorded history.
    fn replay_backward(&mut self) -> Result<Option<RegisterSnapshot>> {
        let newer = self.current_registers();
        let entering = !self.history.is_historical();
        if entering && self.stack.is_none() {
            let real = self.target.real_call_stack()?;
            self.stack = Some(VirtualCallStack::materialize(&newer, real));
            debug!("virtual call stack materialized from target");
        }

        let older = match self.history.step_back(self.target.as_mut()) {
            Ok(Some(older)) => older,
            Ok(None) => {
                if entering {
                    self.stack = None;
                }
                return Ok(None);
            }
            Err(e) => {
                if entering {
                    self.stack = None;
                }
                return Err(e);
            }
        };

        let instruction = match self.instruction_at(&older) {
            Ok(instruction) => instruction,
            Err(e) => {
                // The stack still describes `newer`, so the cursor goes back there.
                self.history.step_forward();
                if entering {
                    self.stack = None;
                }
                debug!(pc = older.pc, error = %e, "cannot classify history entry");
                return Err(e);
            }
        };
        let caller = if instruction.class.is_return() && instruction.is_taken(&older) {
            self.caller_site(newer.pc)
        } else {
            None
        };
        self.reconstructor
            .backward(&mut self.stack, &older, &newer, &instruction, caller);
        Ok(Some(older))
    }

    fn describe_current(&mut self) -> Option<String> {
        let current = self.current_registers();
        match self.instruction_at(&current) {
            Ok(instruction) => Some(instruction.render(current.pc)),
            Err(e) => {
                debug!(error = %e, "cannot disassemble current instruction");
                None
            }
        }
    }

    fn history_changed(&self) {
        let addresses = if self.history.is_historical() {
            self.history.visited_addresses()
        } else {
            Vec::new()
        };
        self.send(SessionEvent::HistoryChanged { addresses });
    }

    fn stopped(&mut self, reason: StopReason) -> StepOutcome {
        debug!(%reason, mode = ?self.mode(), "stopped");
        self.send(SessionEvent::Stopped {
            reason: reason.clone(),
        });
        StepOutcome {
            reason,
            instruction: self.describe_current(),
        }
    }

    fn send(&self, event: SessionEvent) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                trace!("event receiver gone");
            }
        }
    }
}
