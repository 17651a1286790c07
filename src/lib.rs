pub mod config;
pub mod debugger;
pub mod error;
pub mod executor;
pub mod logging;
pub mod parser;
pub mod target;

pub use error::{DebugError, Result};
