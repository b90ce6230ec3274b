//! Module for the recursive view of a replica set.
//!
//! The tree is discovered from one instance downwards with [build_tree], through
//! `SHOW SLAVE HOSTS` on every level, and printed with [print_tree].
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
