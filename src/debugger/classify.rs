use crate::parser::RegisterSnapshot;
use tracing::debug;

const FLAG_C: u8 = 0x01;
const FLAG_PV: u8 = 0x04;
const FLAG_Z: u8 = 0x40;
const FLAG_S: u8 = 0x80;

/// Condition code of `CALL cc` / `RET cc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Nz,
    Z,
    Nc,
    C,
    Po,
    Pe,
    P,
    M,
}

impl Condition {
    /// From the `ccc` bits (5..3) of the opcode.
    pub fn from_code(cc: u8) -> Self {
        match cc & 0x07 {
            0 => Condition::Nz,
            1 => Condition::Z,
            2 => Condition::Nc,
            3 => Condition::C,
            4 => Condition::Po,
            5 => Condition::Pe,
            6 => Condition::P,
            _ => Condition::M,
        }
    }

    pub fn holds(self, flags: u8) -> bool {
        match self {
            Condition::Nz => flags & FLAG_Z == 0,
            Condition::Z => flags & FLAG_Z != 0,
            Condition::Nc => flags & FLAG_C == 0,
            Condition::C => flags & FLAG_C != 0,
            Condition::Po => flags & FLAG_PV == 0,
            Condition::Pe => flags & FLAG_PV != 0,
            Condition::P => flags & FLAG_S == 0,
            Condition::M => flags & FLAG_S != 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::Nz => "NZ",
            Condition::Z => "Z",
            Condition::Nc => "NC",
            Condition::C => "C",
            Condition::Po => "PO",
            Condition::Pe => "PE",
            Condition::P => "P",
            Condition::M => "M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Ret,
    Reti,
    Retn,
}

/// What a PUSH reads or a POP writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperand {
    Bc,
    De,
    Hl,
    Af,
    Ix,
    Iy,
    /// ZX Next `PUSH nn`
    Immediate(u16),
}

impl StackOperand {
    fn from_pair(op: u8) -> Self {
        match (op >> 4) & 0x03 {
            0 => StackOperand::Bc,
            1 => StackOperand::De,
            2 => StackOperand::Hl,
            _ => StackOperand::Af,
        }
    }

    pub fn value_in(self, snapshot: &RegisterSnapshot) -> u16 {
        match self {
            StackOperand::Bc => snapshot.bc,
            StackOperand::De => snapshot.de,
            StackOperand::Hl => snapshot.hl,
            StackOperand::Af => snapshot.af,
            StackOperand::Ix => snapshot.ix,
            StackOperand::Iy => snapshot.iy,
            StackOperand::Immediate(value) => value,
        }
    }

    fn mnemonic(self) -> String {
        match self {
            StackOperand::Bc => "BC".to_string(),
            StackOperand::De => "DE".to_string(),
            StackOperand::Hl => "HL".to_string(),
            StackOperand::Af => "AF".to_string(),
            StackOperand::Ix => "IX".to_string(),
            StackOperand::Iy => "IY".to_string(),
            StackOperand::Immediate(value) => format!("{:04X}h", value),
        }
    }
}

/// Where a direct write to SP takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpSource {
    /// INC SP / DEC SP
    Delta(i16),
    Hl,
    Ix,
    Iy,
    Immediate(u16),
    /// LD SP,(nn): the value is in memory and unknown here.
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    Call {
        target: u16,
        condition: Option<Condition>,
    },
    Rst {
        target: u16,
    },
    Return {
        kind: ReturnKind,
        condition: Option<Condition>,
    },
    Push(StackOperand),
    Pop(StackOperand),
    LoadStackPointer(SpSource),
    Other,
}

impl InstructionClass {
    pub fn is_call(&self) -> bool {
        matches!(self, InstructionClass::Call { .. } | InstructionClass::Rst { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, InstructionClass::Return { .. })
    }
}

/// One classified instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub class: InstructionClass,
    pub length: u8,
    pub mnemonic: String,
}

impl Instruction {
    fn new(class: InstructionClass, length: u8, mnemonic: String) -> Self {
        Self {
            class,
            length,
            mnemonic,
        }
    }

    fn other(bytes: &[u8], length: u8) -> Self {
        let mnemonic = match bytes.first() {
            Some(b) => format!("DB {:02X}h", b),
            None => "??".to_string(),
        };
        Self::new(InstructionClass::Other, length, mnemonic)
    }

    /// Whether a conditional CALL/RET branches with the flags of `older`.
    pub fn is_taken(&self, older: &RegisterSnapshot) -> bool {
        match self.class {
            InstructionClass::Call { condition, .. } | InstructionClass::Return { condition, .. } => {
                condition.map_or(true, |cc| cc.holds(older.flags()))
            }
            _ => true,
        }
    }

    /// Address of the instruction following this one.
    pub fn next_pc(&self, pc: u16) -> u16 {
        pc.wrapping_add(self.length as u16)
    }

    /// SP once this instruction has executed from `older`.
    /// `None` when it cannot be known (LD SP,(nn)).
    pub fn predict_sp(&self, older: &RegisterSnapshot) -> Option<u16> {
        let sp = older.sp;
        let predicted = match self.class {
            InstructionClass::Call { .. } if self.is_taken(older) => sp.wrapping_sub(2),
            InstructionClass::Rst { .. } => sp.wrapping_sub(2),
            InstructionClass::Return { .. } if self.is_taken(older) => sp.wrapping_add(2),
            InstructionClass::Push(_) => sp.wrapping_sub(2),
            InstructionClass::Pop(_) => sp.wrapping_add(2),
            InstructionClass::LoadStackPointer(source) => match source {
                SpSource::Delta(delta) => sp.wrapping_add_signed(delta),
                SpSource::Hl => older.hl,
                SpSource::Ix => older.ix,
                SpSource::Iy => older.iy,
                SpSource::Immediate(value) => value,
                SpSource::Indirect => return None,
            },
            _ => sp,
        };
        Some(predicted)
    }

    pub fn render(&self, pc: u16) -> String {
        format!("{:04X} {}", pc, self.mnemonic)
    }
}

/// Minimal disassembly: enough to know what an instruction does to the stack.
pub trait Classifier {
    fn classify(&self, bytes: &[u8], pc: u16) -> Instruction;
}

/// Classifier for the Z80 and the ZX Next extensions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Z80Classifier;

impl Classifier for Z80Classifier {
    fn classify(&self, bytes: &[u8], pc: u16) -> Instruction {
        let Some(&op) = bytes.first() else {
            debug!(pc, "no opcode bytes to classify");
            return Instruction::other(bytes, 1);
        };
        let byte = |i: usize| bytes.get(i).copied();
        let word = |i: usize| Some(u16::from_le_bytes([byte(i)?, byte(i + 1)?]));

        let ambiguous = || {
            debug!(pc, opcode = op, "instruction bytes incomplete, assuming no stack effect");
            Instruction::other(bytes, 1)
        };

        match op {
            0xCD => match word(1) {
                Some(target) => Instruction::new(
                    InstructionClass::Call {
                        target,
                        condition: None,
                    },
                    3,
                    format!("CALL {:04X}h", target),
                ),
                None => ambiguous(),
            },
            0xC9 => Instruction::new(
                InstructionClass::Return {
                    kind: ReturnKind::Ret,
                    condition: None,
                },
                1,
                "RET".to_string(),
            ),
            0x31 => match word(1) {
                Some(value) => Instruction::new(
                    InstructionClass::LoadStackPointer(SpSource::Immediate(value)),
                    3,
                    format!("LD SP,{:04X}h", value),
                ),
                None => ambiguous(),
            },
            0x33 => Instruction::new(
                InstructionClass::LoadStackPointer(SpSource::Delta(1)),
                1,
                "INC SP".to_string(),
            ),
            0x3B => Instruction::new(
                InstructionClass::LoadStackPointer(SpSource::Delta(-1)),
                1,
                "DEC SP".to_string(),
            ),
            0xF9 => Instruction::new(
                InstructionClass::LoadStackPointer(SpSource::Hl),
                1,
                "LD SP,HL".to_string(),
            ),
            0xDD | 0xFD => classify_index(op, byte(1), bytes),
            0xED => classify_extended(byte(1), byte(2), byte(3), bytes),
            op if op & 0xC7 == 0xC4 => {
                let condition = Condition::from_code(op >> 3);
                match word(1) {
                    Some(target) => Instruction::new(
                        InstructionClass::Call {
                            target,
                            condition: Some(condition),
                        },
                        3,
                        format!("CALL {},{:04X}h", condition.mnemonic(), target),
                    ),
                    None => ambiguous(),
                }
            }
            op if op & 0xC7 == 0xC0 => {
                let condition = Condition::from_code(op >> 3);
                Instruction::new(
                    InstructionClass::Return {
                        kind: ReturnKind::Ret,
                        condition: Some(condition),
                    },
                    1,
                    format!("RET {}", condition.mnemonic()),
                )
            }
            op if op & 0xC7 == 0xC7 => {
                let target = (op & 0x38) as u16;
                Instruction::new(
                    InstructionClass::Rst { target },
                    1,
                    format!("RST {:02X}h", target),
                )
            }
            op if op & 0xCF == 0xC5 => {
                let operand = StackOperand::from_pair(op);
                Instruction::new(
                    InstructionClass::Push(operand),
                    1,
                    format!("PUSH {}", operand.mnemonic()),
                )
            }
            op if op & 0xCF == 0xC1 => {
                let operand = StackOperand::from_pair(op);
                Instruction::new(
                    InstructionClass::Pop(operand),
                    1,
                    format!("POP {}", operand.mnemonic()),
                )
            }
            _ => Instruction::other(bytes, main_length(op)),
        }
    }
}

/// Length of an unprefixed opcode without stack effect.
fn main_length(op: u8) -> u8 {
    match op {
        // LD rr,nn / LD (nn),HL / LD HL,(nn) / LD (nn),A / LD A,(nn) / JP nn / JP cc,nn
        0x01 | 0x11 | 0x21 | 0x22 | 0x2A | 0x32 | 0x3A | 0xC3 => 3,
        op if op & 0xC7 == 0xC2 => 3,
        // DJNZ / JR / JR cc / OUT (n),A / IN A,(n) / CB prefix
        0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0xD3 | 0xDB | 0xCB => 2,
        // LD r,n / ALU n
        op if op & 0xC7 == 0x06 || op & 0xC7 == 0xC6 => 2,
        _ => 1,
    }
}

/// Length of a DD/FD opcode without stack effect, prefix included.
fn index_length(op: Option<u8>) -> u8 {
    match op {
        // LD IX,nn / LD (nn),IX / LD IX,(nn) / LD (IX+d),n / DD CB d op
        Some(0x21 | 0x22 | 0x2A | 0x36 | 0xCB) => 4,
        // INC/DEC (IX+d) / LD IXH,n / LD IXL,n
        Some(0x34 | 0x35 | 0x26 | 0x2E) => 3,
        // HALT is not indexed
        Some(0x76) => 2,
        // LD (IX+d),r / LD r,(IX+d) / ALU (IX+d)
        Some(op) if (0x70..=0x77).contains(&op) => 3,
        Some(op) if (0x40..=0xBF).contains(&op) && op & 0x07 == 0x06 => 3,
        _ => 2,
    }
}

/// Length of an ED opcode without stack effect, prefix included.
fn extended_length(op: Option<u8>) -> u8 {
    match op {
        // LD (nn),rr / LD rr,(nn)
        Some(op) if op & 0xC7 == 0x43 => 4,
        // ZX Next NEXTREG n,n
        Some(0x91) => 4,
        // ZX Next NEXTREG n,A / TEST n
        Some(0x92 | 0x27) => 3,
        _ => 2,
    }
}

fn classify_index(prefix: u8, op: Option<u8>, bytes: &[u8]) -> Instruction {
    let (operand, sp_source, name) = if prefix == 0xDD {
        (StackOperand::Ix, SpSource::Ix, "IX")
    } else {
        (StackOperand::Iy, SpSource::Iy, "IY")
    };
    match op {
        Some(0xE5) => Instruction::new(
            InstructionClass::Push(operand),
            2,
            format!("PUSH {}", name),
        ),
        Some(0xE1) => Instruction::new(
            InstructionClass::Pop(operand),
            2,
            format!("POP {}", name),
        ),
        Some(0xF9) => Instruction::new(
            InstructionClass::LoadStackPointer(sp_source),
            2,
            format!("LD SP,{}", name),
        ),
        _ => Instruction::other(bytes, index_length(op)),
    }
}

fn classify_extended(op: Option<u8>, b2: Option<u8>, b3: Option<u8>, bytes: &[u8]) -> Instruction {
    match (op, b2, b3) {
        (Some(0x4D), _, _) => Instruction::new(
            InstructionClass::Return {
                kind: ReturnKind::Reti,
                condition: None,
            },
            2,
            "RETI".to_string(),
        ),
        (Some(op), _, _) if op & 0xC7 == 0x45 => Instruction::new(
            InstructionClass::Return {
                kind: ReturnKind::Retn,
                condition: None,
            },
            2,
            "RETN".to_string(),
        ),
        // PUSH nn stores its operand big endian.
        (Some(0x8A), Some(hi), Some(lo)) => {
            let value = u16::from_be_bytes([hi, lo]);
            Instruction::new(
                InstructionClass::Push(StackOperand::Immediate(value)),
                4,
                format!("PUSH {:04X}h", value),
            )
        }
        (Some(0x7B), Some(lo), Some(hi)) => Instruction::new(
            InstructionClass::LoadStackPointer(SpSource::Indirect),
            4,
            format!("LD SP,({:04X}h)", u16::from_le_bytes([lo, hi])),
        ),
        _ => Instruction::other(bytes, extended_length(op)),
    }
}

/// The instruction that called the subroutine a return lands after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub address: u16,
    pub target: u16,
}

/// Looks for a CALL (3 bytes) or RST (1 byte) directly in front of
/// `return_address`. `bytes_before` are the 3 bytes at `return_address - 3`.
pub fn find_call_site(
    classifier: &dyn Classifier,
    return_address: u16,
    bytes_before: &[u8],
) -> Option<CallSite> {
    if bytes_before.len() < 3 {
        return None;
    }
    let call_address = return_address.wrapping_sub(3);
    let call = classifier.classify(bytes_before, call_address);
    if let InstructionClass::Call { target, .. } = call.class {
        if call.length == 3 {
            return Some(CallSite {
                address: call_address,
                target,
            });
        }
    }
    let rst_address = return_address.wrapping_sub(1);
    if let InstructionClass::Rst { target } = classifier.classify(&bytes_before[2..], rst_address).class
    {
        return Some(CallSite {
            address: rst_address,
            target,
        });
    }
    None
}
