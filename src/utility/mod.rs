//! Module for the configuration of the command line tools.
//!
//! Every setting is taken from the command line switch, else from its `MDBREPL_*` environment
//! variable (which `.env` can set), else from its default. The settings that were given are
//! collected so they can be written to `.env` with [dotenv_writer].
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
