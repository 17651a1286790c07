use crate::debugger::{DebugSession, Mode, SessionEvent, StepOutcome};
use crate::error::Result;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    Continue,
    Quit,
}

const HELP: &str = "Commands: (s)tep, (n)ext, (o)ut, (b)ack, (c)ontinue, (rc) reverse, (bt) stack [--json], (r)egs, break <addr>, delete <addr>, (q)uit";

/// Interactive prompt on stdin, output on stderr.
pub fn run_console(session: &mut DebugSession, labels: &BTreeMap<String, u16>) -> Result<()> {
    let (sender, events) = mpsc::channel();
    session.set_event_sender(sender);

    let mut err = io::stderr();
    print_position(session, &mut err)?;
    loop {
        writeln!(err, "\n{}", HELP)?;
        write!(err, "> ")?;
        err.flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let action = execute_command(session, labels, &input, &mut err)?;
        report_events(&events, &mut err)?;
        if action == ConsoleAction::Quit {
            break;
        }
    }
    Ok(())
}

/// Runs one console line. Errors of the debug operations are printed, only
/// failures to write the output are returned.
pub fn execute_command(
    session: &mut DebugSession,
    labels: &BTreeMap<String, u16>,
    line: &str,
    out: &mut dyn Write,
) -> Result<ConsoleAction> {
    let Some(words) = shlex::split(line) else {
        writeln!(out, "Unbalanced quotes: {}", line.trim())?;
        return Ok(ConsoleAction::Continue);
    };
    let command = words.first().map(String::as_str).unwrap_or("s");
    let argument = words.get(1).map(String::as_str);

    let outcome = match command {
        "s" | "step" => session.step_into(),
        "n" | "next" => session.step_over(),
        "o" | "out" => session.step_out(),
        "b" | "back" => session.step_back(),
        "c" | "continue" => session.continue_(),
        "rc" | "reverse" => session.reverse_continue(),
        "bt" | "stack" => {
            print_stack(session, argument == Some("--json"), out)?;
            return Ok(ConsoleAction::Continue);
        }
        "r" | "regs" => {
            print_registers(session, out)?;
            return Ok(ConsoleAction::Continue);
        }
        "break" | "delete" => {
            match argument.and_then(|a| parse_address(a, labels)) {
                Some(address) if command == "break" => session.add_breakpoint(address),
                Some(address) => session.remove_breakpoint(address),
                None => writeln!(out, "Invalid address: {}", argument.unwrap_or(""))?,
            }
            return Ok(ConsoleAction::Continue);
        }
        "pause" => {
            writeln!(out, "Nothing is running.")?;
            return Ok(ConsoleAction::Continue);
        }
        "q" | "quit" => return Ok(ConsoleAction::Quit),
        other => {
            writeln!(out, "Unknown command: {}", other)?;
            return Ok(ConsoleAction::Continue);
        }
    };

    match outcome {
        Ok(outcome) => print_outcome(session, &outcome, out)?,
        Err(e) => writeln!(out, "Error: {}", e)?,
    }
    Ok(ConsoleAction::Continue)
}

/// `8000h`, `0x8000`, `$8000`, a decimal number or a label.
pub fn parse_address(text: &str, labels: &BTreeMap<String, u16>) -> Option<u16> {
    if let Some(address) = labels.get(text) {
        return Some(*address);
    }
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix('$'))
        .or_else(|| text.strip_suffix(['h', 'H']));
    match hex {
        Some(digits) => u16::from_str_radix(digits, 16).ok(),
        None => text.parse().ok(),
    }
}

fn print_outcome(session: &DebugSession, outcome: &StepOutcome, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "Stopped: {}", outcome.reason)?;
    print_position(session, out)?;
    if let Some(instruction) = &outcome.instruction {
        writeln!(out, "  {}", instruction)?;
    }
    Ok(())
}

fn print_position(session: &DebugSession, out: &mut dyn Write) -> io::Result<()> {
    let registers = session.current_registers();
    let name = session.symbols().name_or_hex(registers.pc);
    match session.mode() {
        Mode::Live => writeln!(out, "At {} (live)", name),
        Mode::Historical => writeln!(
            out,
            "At {} (history, {} back)",
            name,
            session.history().position()
        ),
    }
}

fn print_stack(session: &mut DebugSession, json: bool, out: &mut dyn Write) -> Result<()> {
    let frames = match session.current_frames() {
        Ok(frames) => frames,
        Err(e) => {
            writeln!(out, "Error: {}", e)?;
            return Ok(());
        }
    };
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&frames)?)?;
        return Ok(());
    }
    writeln!(out, "=== Call Stack ({} frames) ===", frames.len())?;
    for (i, frame) in frames.iter().enumerate() {
        writeln!(out, "  #{}: {}", i, frame)?;
    }
    Ok(())
}

fn print_registers(session: &DebugSession, out: &mut dyn Write) -> io::Result<()> {
    let r = session.current_registers();
    writeln!(
        out,
        "PC={:04X} SP={:04X} AF={:04X} BC={:04X} DE={:04X} HL={:04X} IX={:04X} IY={:04X}",
        r.pc, r.sp, r.af, r.bc, r.de, r.hl, r.ix, r.iy
    )?;
    writeln!(
        out,
        "AF'={:04X} BC'={:04X} DE'={:04X} HL'={:04X} I={:02X} R={:02X}",
        r.af2, r.bc2, r.de2, r.hl2, r.i, r.r
    )
}

fn report_events(events: &Receiver<SessionEvent>, out: &mut dyn Write) -> io::Result<()> {
    for event in events.try_iter() {
        match event {
            SessionEvent::HistoryChanged { addresses } if !addresses.is_empty() => {
                writeln!(out, "History: {} instructions fetched", addresses.len())?;
            }
            other => debug!(?other, "session event"),
        }
    }
    Ok(())
}
