//! Turning rtlamr output into publishable readings: line parsing, cycle
//! coordination and value formatting.

pub mod parser;
pub mod cycle;
pub mod formatter;

pub use parser::{parse_line, LineParseError, LineParser};
pub use cycle::{CycleCoordinator, CycleProgress};
pub use formatter::{format_reading, prepare_readings};
