mod runner;

pub use runner::{execute_command, parse_address, run_console, ConsoleAction};
