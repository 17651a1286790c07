mod decoder;
mod labels;
mod types;

pub use decoder::SnapshotDecoder;
pub use labels::{LabelTable, SymbolResolver};
pub use types::{Field, RegisterSnapshot};
