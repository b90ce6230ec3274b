//! Module for connections to a single MariaDB/MySQL server.
//!
//! A [DatabaseInstance] is an authenticated handle to one server. It is identified by its
//! resolved [InstanceAddress] (host, port and, for local connections, the socket).
//! The SQL client itself is behind the [SqlConnection] trait, and instances are opened
//! through a [Connector]:
//! - [MysqlConnector] for real servers, using the `mysql` crate.
//! - [crate::simulation::SimFleet] for the in-memory fleet.
//!
mod structs;
mod functions;
mod mysql_client;

pub use structs::*;
pub use functions::*;
pub use mysql_client::*;
