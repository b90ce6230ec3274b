//! mdbrepl: replication topology tooling for MariaDB/MySQL fleets.
//!
//! The library exposes:
//! - [instance]: connections to a single database server.
//! - [replication]: replication status, thread control and safe topology changes.
//! - [switchover]: the master to direct replica promotion procedure.
//! - [heartbeat] and [remote]: the heartbeat daemon handoff through remote commands.
//! - [replication_tree]: a recursive view of a replica set.
//! - [simulation]: an in-memory fleet that interprets the statements issued by this crate.
#[macro_use]
extern crate serde_derive;

pub mod error;
pub mod clock;
pub mod instance;
pub mod replication;
pub mod remote;
pub mod heartbeat;
pub mod switchover;
pub mod replication_tree;
pub mod utility;
pub mod simulation;

pub use error::{ReplicationError, Result};
