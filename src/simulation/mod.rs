//! Module for the in-memory MariaDB fleet used by the tests.
//!
//! [SimFleet] holds the servers. Connections opened through it understand the statements
//! this crate sends (`SHOW SLAVE STATUS`, `START SLAVE ... UNTIL`, `CHANGE MASTER TO`,
//! `SET GLOBAL read_only`, ...) and every statement is recorded per `host:port`.
//! Replication is applied whenever a statement runs or [SimClock] sleeps, so running
//! replicas look caught up unless they are stalled.
//!
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
