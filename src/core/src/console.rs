//! Per instance console: bounded output history fanned out to live viewers,
//! plus the stdin side of the attached container stream.

pub mod multiplexer;

pub use multiplexer::Console;

/// Prefix marking lines written by the daemon rather than the workload.
pub const SYSTEM_PREFIX: &str = "\x1b[1m\x1b[33m[Berth]\x1b[0m";
