//! The structs
//!
use std::{fmt, sync::Arc, time::Duration};
use chrono::{DateTime, Local};
use crate::clock::Clock;
use crate::instance::{Connector, Credentials, DatabaseInstance, Resolver};

/// A position in a binary log: ordered by file name first (file names carry a zero padded
/// sequence number), then by position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coordinate {
    pub log_file: String,
    pub log_pos: u64,
}

/// The state of one replication thread as reported by `SHOW SLAVE STATUS`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Yes,
    No,
    /// The IO thread is trying to connect to its master.
    Connecting,
}

/// The thread(s) a START/STOP SLAVE acts on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveThread {
    Both,
    Io,
    Sql,
}

/// `MASTER_USE_GTID` setting of a replica.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidMode {
    No,
    SlavePos,
    CurrentPos,
}

/// Snapshot of `SHOW SLAVE STATUS`.
///
/// The replica coordinate is the executed position in the master's binary log
/// (`Relay_Master_Log_File`, `Exec_Master_Log_Pos`).
/// A status is never cached: every query produces a fresh one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    /// mdbrepl added to allow understanding the timestamp.
    pub timestamp: DateTime<Local>,
    pub io_thread: ThreadState,
    pub sql_thread: ThreadState,
    pub master_host: String,
    pub master_port: u16,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub seconds_behind_master: Option<u64>,
    pub last_io_error: String,
    pub last_sql_error: String,
    pub gtid_mode: GtidMode,
}

/// Snapshot of `SHOW MASTER STATUS`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
}

/// The collaborators shared by every controller of one invocation.
#[derive(Clone)]
pub struct ReplicationContext {
    /// Wait limit for thread start/stop and catch up, and the maximum tolerated lag.
    pub timeout: Duration,
    pub clock: Arc<dyn Clock>,
    pub connector: Arc<dyn Connector>,
    pub resolver: Resolver,
    /// The user and password configured with CHANGE MASTER.
    pub replication_credentials: Credentials,
}

/// Replication control for one instance.
pub struct ReplicationController {
    pub instance: DatabaseInstance,
    pub context: ReplicationContext,
}

impl fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("timeout", &self.timeout)
            .field("clock", &self.clock)
            .field("connector", &self.connector)
            .field("resolver", &self.resolver)
            .finish()
    }
}
