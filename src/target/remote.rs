use super::queue::{CommandQueue, Pending};
use super::transport::LineTransport;
use super::{CompletionReason, PauseHandle, RunMode, StepKind, Target, TransportCapability};
use crate::config::RemoteConfig;
use crate::debugger::{find_call_site, Frame, LocalValue, Z80Classifier, INTERRUPT, UNKNOWN_CALLER};
use crate::error::{DebugError, Result};
use crate::parser::{LabelTable, RegisterSnapshot, SnapshotDecoder, SymbolResolver};
use tracing::{debug, info, warn};

/// Breakpoint slot reserved for run-until.
const STEP_BREAKPOINT_ID: usize = 1;
const FIRST_USER_BREAKPOINT_ID: usize = 2;
const MAX_BREAKPOINT_ID: usize = 100;
const MAX_STACK_ITEMS: usize = 100;

/// A CPU simulator speaking the remote command protocol.
pub struct SimulatorTarget {
    queue: CommandQueue,
    interrupter: Option<PauseHandle>,
    decoder: SnapshotDecoder,
    capability: TransportCapability,
    labels: LabelTable,
    top_of_stack: Option<u16>,
    breakpoints: Vec<u16>,
}

impl SimulatorTarget {
    pub fn connect(remote: &RemoteConfig, history_size: usize) -> Result<Self> {
        let transport = LineTransport::connect(&remote.address())?;
        let interrupter = transport.interrupter();
        let queue = CommandQueue::spawn(transport);
        Self::with_queue(queue, Some(interrupter), history_size)
    }

    /// Checks the simulator behind `queue` and prepares it for debugging.
    pub fn with_queue(
        queue: CommandQueue,
        interrupter: Option<PauseHandle>,
        history_size: usize,
    ) -> Result<Self> {
        let answer = queue.run("check-extensions")?;
        let capability = if answer.trim() == "Extensions available." {
            TransportCapability::FastBreakpoints
        } else {
            TransportCapability::Basic
        };
        info!(?capability, "simulator capability detected");

        let mut setup = vec![
            "enter-cpu-step".to_string(),
            "cpu-history enabled yes".to_string(),
        ];
        if history_size > 0 {
            setup.push(format!("cpu-history set-max-size {}", history_size));
        }
        setup.extend(
            [
                "cpu-history clear",
                "cpu-history started yes",
                "extended-stack enabled yes",
                "enable-breakpoints",
            ]
            .map(String::from),
        );
        if capability == TransportCapability::FastBreakpoints {
            setup.push("clear-all-fast-breakpoints".to_string());
        }
        let pending = setup
            .iter()
            .map(|command| queue.submit(command))
            .collect::<Result<Vec<Pending>>>()?;
        for p in pending {
            let command = p.command().to_string();
            if let Err(e) = checked(&command, p.wait()?) {
                warn!(error = %e, "simulator setup command failed");
            }
        }

        Ok(Self {
            queue,
            interrupter,
            decoder: SnapshotDecoder::new(),
            capability,
            labels: LabelTable::new(),
            top_of_stack: None,
            breakpoints: Vec::new(),
        })
    }

    /// Labels used to name the frames of the real call stack.
    pub fn with_labels(mut self, labels: LabelTable) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_top_of_stack(mut self, top_of_stack: Option<u16>) -> Self {
        self.top_of_stack = top_of_stack;
        self
    }

    fn command(&self, command: &str) -> Result<String> {
        checked(command, self.queue.run(command)?)
    }

    /// Runs several commands back to back and checks all answers.
    fn batch(&self, commands: &[String]) -> Result<()> {
        let pending = commands
            .iter()
            .map(|command| self.queue.submit(command))
            .collect::<Result<Vec<Pending>>>()?;
        for p in pending {
            let command = p.command().to_string();
            checked(&command, p.wait()?)?;
        }
        Ok(())
    }

    fn run_until(&mut self, address: u16, stack_pointer: Option<u16>) -> Result<String> {
        match self.capability {
            TransportCapability::FastBreakpoints => {
                let condition = stack_pointer
                    .map(|sp| format!(" SP>={}", sp))
                    .unwrap_or_default();
                self.command(&format!("set-fast-breakpoint {}{}", address, condition))?;
                let response = self.queue.run("run");
                self.command(&format!("clear-fast-breakpoint {}", address))?;
                response
            }
            TransportCapability::Basic => {
                let mut condition = format!("PC=0{:04X}h", address);
                if let Some(sp) = stack_pointer {
                    condition.push_str(&format!(" and SP>={}", sp));
                }
                self.batch(&[
                    format!("set-breakpointaction {} prints run-until", STEP_BREAKPOINT_ID),
                    format!("set-breakpoint {} {}", STEP_BREAKPOINT_ID, condition),
                    format!("enable-breakpoint {}", STEP_BREAKPOINT_ID),
                ])?;
                let response = self.queue.run("run");
                self.command(&format!("disable-breakpoint {}", STEP_BREAKPOINT_ID))?;
                response
            }
        }
    }

    /// Names the frame a return address on the stack belongs to.
    fn caller_frame(&mut self, return_address: u16, caller_sp: u16, is_rst: bool) -> Frame {
        let bytes = self
            .read_memory(return_address.wrapping_sub(3), 3)
            .unwrap_or_default();
        match find_call_site(&Z80Classifier, return_address, &bytes) {
            Some(site) => Frame::new(site.address, caller_sp, self.labels.name_or_hex(site.target)),
            None => {
                let length = if is_rst { 1 } else { 3 };
                Frame::new(return_address.wrapping_sub(length), caller_sp, UNKNOWN_CALLER)
            }
        }
    }
}

impl Target for SimulatorTarget {
    fn capability(&self) -> TransportCapability {
        self.capability
    }

    fn fetch_snapshot(&mut self, index: usize) -> Result<Option<RegisterSnapshot>> {
        let line = self.queue.run(&format!("cpu-history get {}", index))?;
        if is_error(&line) {
            debug!(index, "no history entry");
            return Ok(None);
        }
        self.decoder.decode_at(line.trim(), index).map(Some)
    }

    fn registers(&mut self) -> Result<RegisterSnapshot> {
        let line = self.command("get-registers")?;
        self.decoder.decode(line.trim())
    }

    fn run_live(&mut self, mode: RunMode) -> Result<CompletionReason> {
        let response = match mode {
            RunMode::Continue => self.queue.run("run")?,
            RunMode::Until {
                address,
                stack_pointer,
            } => self.run_until(address, stack_pointer)?,
        };
        let pc = self.registers()?.pc;
        let reason = match (mode, break_reason(&response)) {
            (RunMode::Until { address, .. }, _) if pc == address => CompletionReason::ReachedAddress,
            (_, Some(_)) if self.breakpoints.contains(&pc) => {
                CompletionReason::Breakpoint { address: pc }
            }
            (_, Some(text)) => CompletionReason::Message(text.to_string()),
            (_, None) => CompletionReason::Paused,
        };
        debug!(?reason, pc, "run finished");
        Ok(reason)
    }

    fn step_live(&mut self, kind: StepKind) -> Result<RegisterSnapshot> {
        let command = match kind {
            StepKind::Into => "cpu-step",
            StepKind::Over => "cpu-step-over",
        };
        self.command(command)?;
        self.registers()
    }

    fn real_call_stack(&mut self) -> Result<Vec<Frame>> {
        let registers = self.registers()?;
        let depth = match self.top_of_stack {
            Some(top) => (top.saturating_sub(registers.sp) / 2) as usize,
            None => MAX_STACK_ITEMS,
        }
        .min(MAX_STACK_ITEMS);
        let mut frames = Vec::new();
        let mut level = Frame::current(&registers, Vec::new());
        if depth == 0 {
            frames.push(level);
            return Ok(frames);
        }

        let text = self.command(&format!("extended-stack get {}", depth))?;
        let mut locals = Vec::new();
        let mut slot = registers.sp;
        for line in text.lines() {
            let Some((value, kind)) = parse_stack_entry(line) else {
                continue;
            };
            slot = slot.wrapping_add(2);
            match kind {
                "call" | "rst" => {
                    level.local_values = locals.drain(..).rev().collect();
                    frames.push(level);
                    level = self.caller_frame(value, slot, kind == "rst");
                }
                k if k.contains("interrupt") => {
                    level.local_values = locals.drain(..).rev().collect();
                    frames.push(level);
                    level = Frame::new(value, slot, INTERRUPT);
                }
                _ => locals.push(LocalValue::Known(value)),
            }
        }
        level.local_values = locals.into_iter().rev().collect();
        frames.push(level);
        Ok(frames)
    }

    fn read_memory(&mut self, address: u16, len: usize) -> Result<Vec<u8>> {
        let text = self.command(&format!("read-memory {} {}", address, len))?;
        let text = text.trim();
        if text.len() < len * 2 {
            return Err(DebugError::Target(format!(
                "short memory read at {:04X}h: '{}'",
                address, text
            )));
        }
        (0..len)
            .map(|i| {
                u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                    .map_err(|_| DebugError::Target(format!("bad memory dump '{}'", text)))
            })
            .collect()
    }

    fn sync_breakpoints(&mut self, addresses: &[u16]) -> Result<()> {
        let mut commands = Vec::new();
        match self.capability {
            TransportCapability::FastBreakpoints => {
                for old in self.breakpoints.iter().filter(|a| !addresses.contains(*a)) {
                    commands.push(format!("clear-fast-breakpoint {}", old));
                }
                for new in addresses.iter().filter(|a| !self.breakpoints.contains(*a)) {
                    commands.push(format!("set-fast-breakpoint {}", new));
                }
            }
            TransportCapability::Basic => {
                let slots = MAX_BREAKPOINT_ID - FIRST_USER_BREAKPOINT_ID + 1;
                if addresses.len() > slots {
                    return Err(DebugError::Target(format!(
                        "only {} breakpoints available",
                        slots
                    )));
                }
                for (i, address) in addresses.iter().enumerate() {
                    let id = FIRST_USER_BREAKPOINT_ID + i;
                    commands.push(format!(
                        "set-breakpointaction {} prints breakpoint {} hit",
                        id, id
                    ));
                    commands.push(format!("set-breakpoint {} PC=0{:04X}h", id, address));
                    commands.push(format!("enable-breakpoint {}", id));
                }
                for i in addresses.len()..self.breakpoints.len() {
                    commands.push(format!("disable-breakpoint {}", FIRST_USER_BREAKPOINT_ID + i));
                }
            }
        }
        self.batch(&commands)?;
        self.breakpoints = addresses.to_vec();
        Ok(())
    }

    fn pause_handle(&self) -> Option<PauseHandle> {
        self.interrupter.clone()
    }
}

fn is_error(response: &str) -> bool {
    response
        .get(..5)
        .map_or(false, |head| head.eq_ignore_ascii_case("error"))
}

fn checked(command: &str, response: String) -> Result<String> {
    if is_error(&response) {
        return Err(DebugError::Target(format!("{}: {}", command, response.trim())));
    }
    Ok(response)
}

/// The reason is the second line of a `run` response.
fn break_reason(response: &str) -> Option<&str> {
    response
        .lines()
        .nth(1)
        .map(str::trim)
        .filter(|line| line.starts_with("Break"))
}

/// `15E1H call` -> (0x15E1, "call")
fn parse_stack_entry(line: &str) -> Option<(u16, &str)> {
    let mut parts = line.split_whitespace();
    let value = parts.next()?.trim_end_matches(['H', 'h']);
    let value = u16::from_str_radix(value, 16).ok()?;
    Some((value, parts.next().unwrap_or("default")))
}
