use serde::Serialize;

/// Registers captured immediately before one instruction executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegisterSnapshot {
    /// Index into the target's trace log (0 = most recent). `None` for live registers.
    pub position: Option<usize>,
    pub pc: u16,
    pub sp: u16,
    pub af: u16,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
    pub ix: u16,
    pub iy: u16,
    pub af2: u16,
    pub bc2: u16,
    pub de2: u16,
    pub hl2: u16,
    pub i: u8,
    pub r: u8,
    pub interrupt_mode: Option<u8>,
    /// The four bytes at PC, `(PC)=` in the line.
    pub opcodes: Option<[u8; 4]>,
    /// The word at SP, `(SP)=` in the line.
    pub sp_content: Option<u16>,
    /// Some register other than PC and SP was missing from the line and reads as 0.
    pub incomplete: bool,
}

impl RegisterSnapshot {
    /// The F register.
    pub fn flags(&self) -> u8 {
        (self.af & 0xFF) as u8
    }

    pub fn is_live(&self) -> bool {
        self.position.is_none()
    }
}

/// One named field of a register line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Pc,
    Sp,
    Af,
    Bc,
    De,
    Hl,
    Ix,
    Iy,
    Af2,
    Bc2,
    De2,
    Hl2,
    I,
    R,
    Opcodes,
    SpContent,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Pc,
        Field::Sp,
        Field::Af,
        Field::Bc,
        Field::De,
        Field::Hl,
        Field::Ix,
        Field::Iy,
        Field::Af2,
        Field::Bc2,
        Field::De2,
        Field::Hl2,
        Field::I,
        Field::R,
        Field::Opcodes,
        Field::SpContent,
    ];

    /// The text in front of the value, including the `=`.
    pub fn key(self) -> &'static str {
        match self {
            Field::Pc => "PC=",
            Field::Sp => "SP=",
            Field::Af => "AF=",
            Field::Bc => "BC=",
            Field::De => "DE=",
            Field::Hl => "HL=",
            Field::Ix => "IX=",
            Field::Iy => "IY=",
            Field::Af2 => "AF'=",
            Field::Bc2 => "BC'=",
            Field::De2 => "DE'=",
            Field::Hl2 => "HL'=",
            Field::I => "I=",
            Field::R => "R=",
            Field::Opcodes => "(PC)=",
            Field::SpContent => "(SP)=",
        }
    }

    /// Number of hex digits of the value.
    pub fn width(self) -> usize {
        match self {
            Field::I | Field::R => 2,
            Field::Opcodes => 8,
            _ => 4,
        }
    }

    /// Expected on every line.
    pub fn is_required(self) -> bool {
        !matches!(self, Field::Opcodes | Field::SpContent)
    }

    /// Without these the line cannot be replayed at all.
    pub fn is_essential(self) -> bool {
        matches!(self, Field::Pc | Field::Sp)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.key() == key)
    }
}
