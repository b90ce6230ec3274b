//! Module for the pt-heartbeat handoff during a switchover.
//!
//! The daemon writes a timestamp row on the master every interval. It is found on a host
//! by matching its command line against the process list, and started with the same
//! section and interval on the new master.
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
