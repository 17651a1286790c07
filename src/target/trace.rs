use super::{CompletionReason, RunMode, StepKind, Target, TransportCapability};
use crate::debugger::Frame;
use crate::error::{DebugError, Result};
use crate::parser::{RegisterSnapshot, SnapshotDecoder};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Replays a recorded trace.
///
/// The file holds `#` comments, `mem XXXX: bb bb ..` memory lines and
/// register lines. The first register line is the live state, every further
/// line is one history entry, most recent first.
pub struct TraceTarget {
    live: RegisterSnapshot,
    history: Vec<RegisterSnapshot>,
    memory: Vec<u8>,
    call_stack: Vec<Frame>,
    fetches: Arc<AtomicUsize>,
}

impl TraceTarget {
    pub fn new(live: RegisterSnapshot, history: Vec<RegisterSnapshot>) -> Self {
        let history = history
            .into_iter()
            .enumerate()
            .map(|(index, mut snapshot)| {
                snapshot.position = Some(index);
                snapshot
            })
            .collect();
        Self {
            live,
            history,
            memory: vec![0; 0x10000],
            call_stack: Vec::new(),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut decoder = SnapshotDecoder::new();
        let mut snapshots = Vec::new();
        let mut memory = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("mem ") {
                memory.push(parse_memory_line(rest).ok_or_else(|| {
                    DebugError::Config(format!("line {}: bad memory line '{}'", number + 1, line))
                })?);
                continue;
            }
            snapshots.push(decoder.decode(line)?);
        }
        if snapshots.is_empty() {
            return Err(DebugError::Config("trace holds no register line".to_string()));
        }
        let live = snapshots.remove(0);
        debug!(entries = snapshots.len(), "trace loaded");
        let mut target = Self::new(live, snapshots);
        for (address, bytes) in memory {
            target = target.with_memory(address, &bytes);
        }
        Ok(target)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DebugError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn with_memory(mut self, address: u16, bytes: &[u8]) -> Self {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory[address.wrapping_add(i as u16) as usize] = *byte;
        }
        self
    }

    /// The stack reported while live, innermost first.
    pub fn with_call_stack(mut self, frames: Vec<Frame>) -> Self {
        self.call_stack = frames;
        self
    }

    /// Counts `fetch_snapshot` calls; stays valid after the target is boxed.
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

impl Target for TraceTarget {
    fn capability(&self) -> TransportCapability {
        TransportCapability::Basic
    }

    fn fetch_snapshot(&mut self, index: usize) -> Result<Option<RegisterSnapshot>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.history.get(index).copied())
    }

    fn registers(&mut self) -> Result<RegisterSnapshot> {
        Ok(self.live)
    }

    fn run_live(&mut self, _mode: RunMode) -> Result<CompletionReason> {
        Err(DebugError::Unsupported("running a recorded trace"))
    }

    fn step_live(&mut self, _kind: StepKind) -> Result<RegisterSnapshot> {
        Err(DebugError::Unsupported("stepping a recorded trace live"))
    }

    fn real_call_stack(&mut self) -> Result<Vec<Frame>> {
        Ok(self.call_stack.clone())
    }

    fn read_memory(&mut self, address: u16, len: usize) -> Result<Vec<u8>> {
        Ok((0..len)
            .map(|i| self.memory[address.wrapping_add(i as u16) as usize])
            .collect())
    }
}

/// `8000: cd d3 80` -> (0x8000, [0xcd, 0xd3, 0x80])
fn parse_memory_line(text: &str) -> Option<(u16, Vec<u8>)> {
    let (address, bytes) = text.split_once(':')?;
    let address = u16::from_str_radix(address.trim(), 16).ok()?;
    let bytes = bytes
        .split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some((address, bytes))
}
