use super::types::{Field, RegisterSnapshot};
use crate::error::{DebugError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{trace, warn};

/// `KEY=hex` pairs, each key preceded by whitespace or the start of the line.
static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)(\(PC\)=|\(SP\)=|[A-Z]{1,2}'?=)([0-9A-Fa-f]+)")
        .expect("field pattern is valid")
});

static IM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)IM([0-2])(?:\s|$)").expect("im pattern is valid"));

/// Decodes register lines of one session.
///
/// All lines of a session come from the same fixed-width emitter, so the
/// byte offset of every value is learned once and reused. When a memoized
/// offset stops matching (another machine profile, a line with a prefix)
/// the whole line is rescanned and the offsets are learned again.
#[derive(Debug, Default)]
pub struct SnapshotDecoder {
    offsets: [Option<usize>; Field::ALL.len()],
    rescans: usize,
}

impl SnapshotDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the offsets had to be relearned.
    pub fn rescans(&self) -> usize {
        self.rescans
    }

    pub fn decode(&mut self, line: &str) -> Result<RegisterSnapshot> {
        let mut values = [None; Field::ALL.len()];
        if !self.read_memoized(line, &mut values) {
            self.learn(line, &mut values);
        }
        build_snapshot(line, &values)
    }

    /// Decodes a history line and stamps its trace position.
    pub fn decode_at(&mut self, line: &str, position: usize) -> Result<RegisterSnapshot> {
        let mut snapshot = self.decode(line)?;
        snapshot.position = Some(position);
        Ok(snapshot)
    }

    fn read_memoized(&self, line: &str, values: &mut [Option<u32>]) -> bool {
        for field in Field::ALL {
            let value = match self.offsets[field.index()] {
                Some(offset) => read_at(line, field, offset),
                None => None,
            };
            match value {
                Some(v) => values[field.index()] = Some(v),
                None if field.is_required() => return false,
                // Optional fields come and go between live and history lines.
                None => values[field.index()] = find_optional(line, field),
            }
        }
        true
    }

    fn learn(&mut self, line: &str, values: &mut [Option<u32>]) {
        self.rescans += 1;
        self.offsets = [None; Field::ALL.len()];
        for cap in FIELD_RE.captures_iter(line) {
            let (Some(key), Some(value)) = (cap.get(1), cap.get(2)) else {
                continue;
            };
            let Some(field) = Field::from_key(key.as_str()) else {
                continue;
            };
            if self.offsets[field.index()].is_some() {
                continue;
            }
            let text = value.as_str();
            if text.len() < field.width() {
                continue;
            }
            if let Ok(v) = u32::from_str_radix(&text[..field.width()], 16) {
                self.offsets[field.index()] = Some(value.start());
                values[field.index()] = Some(v);
            }
        }
        trace!(rescans = self.rescans, "learned snapshot field offsets");
    }
}

fn read_at(line: &str, field: Field, offset: usize) -> Option<u32> {
    let key = field.key();
    let key_start = offset.checked_sub(key.len())?;
    if line.get(key_start..offset)? != key {
        return None;
    }
    if key_start > 0 && !line[..key_start].ends_with(char::is_whitespace) {
        return None;
    }
    let text = line.get(offset..offset + field.width())?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}

fn find_optional(line: &str, field: Field) -> Option<u32> {
    let offset = line.find(field.key())? + field.key().len();
    read_at(line, field, offset)
}

fn build_snapshot(line: &str, values: &[Option<u32>]) -> Result<RegisterSnapshot> {
    let mut incomplete = false;
    let mut word = |field: Field| -> Result<u16> {
        if let Some(v) = values[field.index()] {
            return Ok(v as u16);
        }
        let name = field.key().trim_end_matches('=');
        if field.is_essential() {
            warn!(field = name, "snapshot line lacks PC or SP");
            return Err(DebugError::MalformedSnapshot {
                field: name,
                line: line.to_string(),
            });
        }
        warn!(field = name, "snapshot line lacks a register, reading it as 0");
        incomplete = true;
        Ok(0)
    };

    let interrupt_mode = IM_RE
        .captures(line)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok());

    let mut snapshot = RegisterSnapshot {
        position: None,
        pc: word(Field::Pc)?,
        sp: word(Field::Sp)?,
        af: word(Field::Af)?,
        bc: word(Field::Bc)?,
        de: word(Field::De)?,
        hl: word(Field::Hl)?,
        ix: word(Field::Ix)?,
        iy: word(Field::Iy)?,
        af2: word(Field::Af2)?,
        bc2: word(Field::Bc2)?,
        de2: word(Field::De2)?,
        hl2: word(Field::Hl2)?,
        i: word(Field::I)? as u8,
        r: word(Field::R)? as u8,
        interrupt_mode,
        opcodes: values[Field::Opcodes.index()].map(u32::to_be_bytes),
        sp_content: values[Field::SpContent.index()].map(|v| v as u16),
        incomplete: false,
    };
    snapshot.incomplete = incomplete;
    Ok(snapshot)
}
