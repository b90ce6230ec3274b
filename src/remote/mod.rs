//! Module for running commands on database hosts.
//!
//! Only the heartbeat handoff needs this: listing processes, killing one and starting
//! the daemon. [SshRunner] runs the command through the configured remote shell.
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
