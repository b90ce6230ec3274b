//! Module for the time source used by all polling loops.
//!
//! Every "wait for state X" loop of this crate sleeps and reads time through [Clock],
//! so that the loops can be driven by virtual time in the simulation.
mod functions;

pub use functions::*;
