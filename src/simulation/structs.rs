//! The structs
//!
use std::{collections::{BTreeMap, BTreeSet}, sync::{atomic::AtomicU64, Arc, Mutex}};
use crate::replication::{Coordinate, GtidMode, ThreadState};

/// One simulated server.
#[derive(Debug, Clone)]
pub struct SimServer {
    pub host: String,
    pub port: u16,
    pub server_id: u32,
    pub read_only: bool,
    pub log_bin: bool,
    /// The current end of the binary log.
    pub binlog: Coordinate,
    pub binlog_format: String,
    pub version: String,
    pub socket: String,
    pub uptime: u64,
    pub processes: u64,
    /// Binary log growth in bytes per second of simulated time, while writable.
    pub write_rate: u64,
    pub semisync_master: bool,
    pub semisync_slave: bool,
    pub plugins: BTreeSet<String>,
    /// The last `(shard, datacenter)` row of `heartbeat.heartbeat`.
    pub heartbeat: Option<(String, String)>,
    pub replica: Option<SimReplica>,
    pub reachable: bool,
}

/// The replica configuration of a simulated server.
#[derive(Debug, Clone)]
pub struct SimReplica {
    pub master_host: String,
    pub master_port: u16,
    pub io_thread: ThreadState,
    pub sql_thread: ThreadState,
    /// Executed position in the master's binary log.
    pub executed: Coordinate,
    pub until: Option<Coordinate>,
    pub gtid_mode: GtidMode,
    /// Reported `Seconds_Behind_Master` while both threads run.
    pub lag: u64,
    /// The SQL thread runs but applies nothing.
    pub stalled: bool,
    /// The IO thread cannot connect when started, with this error.
    pub io_failure: Option<String>,
    pub last_io_error: String,
    pub last_sql_error: String,
}

#[derive(Debug, Default)]
pub struct FleetState {
    pub servers: BTreeMap<String, SimServer>,
    /// Every statement received, per `host:port`.
    pub statements: BTreeMap<String, Vec<String>>,
    /// `(host:port, statement prefix)` pairs that fail.
    pub failing: Vec<(String, String)>,
    /// Running processes per host: `(pid, command line)`.
    pub processes: BTreeMap<String, Vec<(u32, String)>>,
    /// Every remote command received, per host.
    pub commands: BTreeMap<String, Vec<String>>,
    pub next_pid: u32,
    pub next_server_id: u32,
}

/// A deterministic in-memory fleet of MariaDB servers.
///
/// It opens connections (as a [crate::instance::Connector]) that interpret the statements
/// this crate issues, drives replication from a virtual clock ([SimClock]) and runs the
/// heartbeat process commands ([SimRunner]).
#[derive(Debug, Clone, Default)]
pub struct SimFleet {
    pub(crate) state: Arc<Mutex<FleetState>>,
    pub(crate) now_ms: Arc<AtomicU64>,
}

/// Virtual time: sleeping advances the clock and lets writable servers write.
#[derive(Debug, Clone)]
pub struct SimClock {
    pub(crate) fleet: SimFleet,
}

/// Process commands against the simulated hosts.
#[derive(Debug, Clone)]
pub struct SimRunner {
    pub(crate) fleet: SimFleet,
}

/// A client connection to one simulated server.
#[derive(Debug)]
pub struct SimConnection {
    pub(crate) fleet: SimFleet,
    pub(crate) key: String,
}
