use crate::parser::RegisterSnapshot;
use serde::Serialize;
use std::fmt;

pub const CURRENT: &str = "current";
pub const INTERRUPT: &str = "interrupt";
pub const UNKNOWN_CALLER: &str = "unknown-caller";

/// A word on the stack that is not a return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LocalValue {
    Known(u16),
    /// Space reserved by a direct SP change; its content was never observed.
    Unknown,
}

impl fmt::Display for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalValue::Known(v) => write!(f, "{:04X}h", v),
            LocalValue::Unknown => write!(f, "????h"),
        }
    }
}

/// One unreturned call or interrupt, or the current position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub entry_address: u16,
    pub caller_stack_pointer: u16,
    pub display_name: String,
    pub local_values: Vec<LocalValue>,
}

impl Frame {
    pub fn new(entry_address: u16, caller_stack_pointer: u16, display_name: impl Into<String>) -> Self {
        Self {
            entry_address,
            caller_stack_pointer,
            display_name: display_name.into(),
            local_values: Vec::new(),
        }
    }

    /// The innermost frame: where `snapshot` is.
    pub fn current(snapshot: &RegisterSnapshot, local_values: Vec<LocalValue>) -> Self {
        Self {
            entry_address: snapshot.pc,
            caller_stack_pointer: snapshot.sp,
            display_name: CURRENT.to_string(),
            local_values,
        }
    }

    pub fn with_locals(mut self, local_values: Vec<LocalValue>) -> Self {
        self.local_values = local_values;
        self
    }

    pub fn is_placeholder(&self) -> bool {
        self.display_name == UNKNOWN_CALLER
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}h {} (SP={:04X}h",
            self.entry_address, self.display_name, self.caller_stack_pointer
        )?;
        if !self.local_values.is_empty() {
            let values: Vec<String> = self.local_values.iter().map(|v| v.to_string()).collect();
            write!(f, ", locals [{}]", values.join(" "))?;
        }
        write!(f, ")")
    }
}

/// Call stack rebuilt while replaying history.
///
/// Index 0 of every innermost-first view is the current position. The frame
/// at depth 1 and beyond each stand for one suspended level: its entry is the
/// call site (or the interrupted address), its `local_values` are what that
/// level had pushed when it was suspended. The innermost frame carries the
/// values of the running level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualCallStack {
    // innermost last
    frames: Vec<Frame>,
}

impl VirtualCallStack {
    /// A stack holding only the current position.
    pub fn new(current: &RegisterSnapshot) -> Self {
        Self {
            frames: vec![Frame::current(current, Vec::new())],
        }
    }

    /// Builds the base for replay from the target's real stack (innermost first).
    pub fn materialize(current: &RegisterSnapshot, real: Vec<Frame>) -> Self {
        let mut frames: Vec<Frame> = real.into_iter().rev().collect();
        match frames.last_mut() {
            Some(top) => {
                top.entry_address = current.pc;
                top.caller_stack_pointer = current.sp;
                top.display_name = CURRENT.to_string();
            }
            None => frames.push(Frame::current(current, Vec::new())),
        }
        Self { frames }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Removes the innermost frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn innermost(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn innermost_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The frame directly below the current position.
    pub fn enclosing(&self) -> Option<&Frame> {
        self.frames.iter().rev().nth(1)
    }

    /// Innermost first.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    pub fn to_vec(&self) -> Vec<Frame> {
        self.iter().cloned().collect()
    }

    pub fn entry_addresses(&self) -> Vec<u16> {
        self.iter().map(|f| f.entry_address).collect()
    }
}
