use super::classify::{CallSite, Instruction, InstructionClass, ReturnKind};
use super::frame::{Frame, LocalValue, VirtualCallStack, INTERRUPT, UNKNOWN_CALLER};
use crate::parser::{RegisterSnapshot, SymbolResolver};
use std::mem;
use tracing::{debug, trace};

pub const DEFAULT_INTERRUPT_VECTORS: [u16; 2] = [0x0038, 0x0066];

/// Recognizes an interrupt that was taken right after an instruction.
///
/// Traces carry no interrupt marker. An interrupt shows up as one more
/// return address on the stack than the instruction accounts for, with PC
/// on an interrupt vector. A legitimate jump to a vector whose code happens
/// to leave SP two below the prediction is misread as an interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptHeuristic {
    vectors: Vec<u16>,
}

impl Default for InterruptHeuristic {
    fn default() -> Self {
        Self::new(DEFAULT_INTERRUPT_VECTORS.to_vec())
    }
}

impl InterruptHeuristic {
    /// An empty list accepts any address as a vector (IM2 tables).
    pub fn new(vectors: Vec<u16>) -> Self {
        Self { vectors }
    }

    pub fn is_vector(&self, address: u16) -> bool {
        self.vectors.is_empty() || self.vectors.contains(&address)
    }

    pub fn is_interrupt_entry(
        &self,
        older: &RegisterSnapshot,
        newer: &RegisterSnapshot,
        instruction: &Instruction,
    ) -> bool {
        if !self.is_vector(newer.pc) {
            return false;
        }
        match instruction.predict_sp(older) {
            Some(predicted) => newer.sp == predicted.wrapping_sub(2),
            None => newer.pc != instruction.next_pc(older.pc),
        }
    }
}

/// Keeps a `VirtualCallStack` in step with the replay cursor.
pub struct Reconstructor {
    symbols: Box<dyn SymbolResolver>,
    interrupts: InterruptHeuristic,
}

impl Reconstructor {
    pub fn new(symbols: Box<dyn SymbolResolver>, interrupts: InterruptHeuristic) -> Self {
        Self {
            symbols,
            interrupts,
        }
    }

    pub fn symbols(&self) -> &dyn SymbolResolver {
        self.symbols.as_ref()
    }

    pub fn interrupts(&self) -> &InterruptHeuristic {
        &self.interrupts
    }

    /// Applies `instruction`, executed at `older`, moving forward in time.
    ///
    /// `newer == None` means the live edge was reached: the stack is dropped
    /// and the target's real call stack applies again.
    pub fn forward(
        &self,
        stack: &mut Option<VirtualCallStack>,
        older: &RegisterSnapshot,
        newer: Option<&RegisterSnapshot>,
        instruction: &Instruction,
    ) {
        let Some(newer) = newer else {
            if stack.take().is_some() {
                debug!("live edge reached, virtual call stack discarded");
            }
            return;
        };
        let stack = stack.get_or_insert_with(|| VirtualCallStack::new(older));
        let mut locals = stack.pop().map(|f| f.local_values).unwrap_or_default();

        let interrupted = self.interrupts.is_interrupt_entry(older, newer, instruction);
        let landed_sp = landed_sp(newer, interrupted);

        match instruction.class {
            InstructionClass::Return { .. } if instruction.is_taken(older) => {
                let caller = stack.pop().unwrap_or_else(|| {
                    debug!(pc = older.pc, "return without enclosing frame");
                    Frame::new(newer.pc, landed_sp, UNKNOWN_CALLER)
                });
                trace!(caller = %caller, "returned");
                locals = caller.local_values;
            }
            InstructionClass::Call { target, .. } | InstructionClass::Rst { target }
                if instruction.is_taken(older) && stack_grew(older.sp, landed_sp) =>
            {
                let frame = Frame::new(older.pc, older.sp, self.symbols.name_or_hex(target))
                    .with_locals(mem::take(&mut locals));
                trace!(frame = %frame, "called");
                stack.push(frame);
            }
            InstructionClass::Push(operand) => {
                locals.push(LocalValue::Known(operand.value_in(older)));
            }
            InstructionClass::Pop(_) => {
                if locals.pop().is_none() {
                    debug!(pc = older.pc, "pop of a value pushed before the recording");
                }
            }
            InstructionClass::LoadStackPointer(_) => adjust_locals(&mut locals, older.sp, landed_sp),
            _ => {}
        }

        if interrupted {
            let return_address = newer
                .sp_content
                .unwrap_or_else(|| pc_after(older, instruction));
            debug!(vector = newer.pc, return_address, "interrupt entry");
            stack.push(
                Frame::new(return_address, landed_sp, INTERRUPT).with_locals(mem::take(&mut locals)),
            );
        }

        stack.push(Frame::current(newer, locals));
    }

    /// Undoes `instruction`, executed at `older`, moving backward in time from `newer`.
    ///
    /// `caller` is the call instruction found in front of the address a
    /// return lands on, when there is one.
    pub fn backward(
        &self,
        stack: &mut Option<VirtualCallStack>,
        older: &RegisterSnapshot,
        newer: &RegisterSnapshot,
        instruction: &Instruction,
        caller: Option<CallSite>,
    ) {
        let stack = stack.get_or_insert_with(|| VirtualCallStack::new(newer));
        let mut locals = stack.pop().map(|f| f.local_values).unwrap_or_default();

        let interrupted = self.interrupts.is_interrupt_entry(older, newer, instruction);
        let landed_sp = landed_sp(newer, interrupted);
        if interrupted {
            debug!(vector = newer.pc, "leaving interrupt backwards");
            locals = match stack.pop() {
                Some(frame) => frame.local_values,
                None => {
                    debug!("no interrupt frame to leave");
                    Vec::new()
                }
            };
        }

        match instruction.class {
            InstructionClass::Return { kind, .. } if instruction.is_taken(older) => {
                let frame = match (caller, kind) {
                    (Some(site), _) => {
                        Frame::new(site.address, landed_sp, self.symbols.name_or_hex(site.target))
                    }
                    (None, ReturnKind::Reti | ReturnKind::Retn) => {
                        Frame::new(newer.pc, landed_sp, INTERRUPT)
                    }
                    (None, ReturnKind::Ret) => {
                        debug!(return_address = newer.pc, "no call in front of return address");
                        Frame::new(newer.pc, landed_sp, UNKNOWN_CALLER)
                    }
                };
                trace!(frame = %frame, "back into call");
                stack.push(frame.with_locals(mem::take(&mut locals)));
            }
            InstructionClass::Call { .. } | InstructionClass::Rst { .. }
                if instruction.is_taken(older) && stack_grew(older.sp, landed_sp) =>
            {
                locals = match stack.pop() {
                    Some(frame) => frame.local_values,
                    None => {
                        debug!(pc = older.pc, "call frame missing while stepping back");
                        Vec::new()
                    }
                };
            }
            InstructionClass::Push(_) => {
                locals.pop();
            }
            InstructionClass::Pop(operand) => {
                locals.push(LocalValue::Known(operand.value_in(newer)));
            }
            InstructionClass::LoadStackPointer(_) => adjust_locals(&mut locals, landed_sp, older.sp),
            _ => {}
        }

        stack.push(Frame::current(older, locals));
    }
}

/// SP the instruction itself left behind, before any interrupt pushed onto it.
fn landed_sp(newer: &RegisterSnapshot, interrupted: bool) -> u16 {
    if interrupted {
        newer.sp.wrapping_add(2)
    } else {
        newer.sp
    }
}

fn stack_grew(before: u16, after: u16) -> bool {
    (before.wrapping_sub(after) as i16) > 0
}

/// PC once `instruction` has executed, as far as it can be known without the newer state.
fn pc_after(older: &RegisterSnapshot, instruction: &Instruction) -> u16 {
    match instruction.class {
        InstructionClass::Call { target, .. } | InstructionClass::Rst { target }
            if instruction.is_taken(older) =>
        {
            target
        }
        InstructionClass::Return { .. } if instruction.is_taken(older) => older
            .sp_content
            .unwrap_or_else(|| instruction.next_pc(older.pc)),
        _ => instruction.next_pc(older.pc),
    }
}

/// A direct SP change from `from` to `to`: growth is unknown data, shrinking drops values.
fn adjust_locals(locals: &mut Vec<LocalValue>, from: u16, to: u16) {
    let words = (i32::from(from) - i32::from(to)) / 2;
    if words > 0 {
        locals.extend(std::iter::repeat(LocalValue::Unknown).take(words as usize));
    } else {
        let remove = (words.unsigned_abs() as usize).min(locals.len());
        locals.truncate(locals.len() - remove);
    }
}
