//! The structs
//!
use std::time::Duration;
use chrono::{DateTime, Local};
use crate::heartbeat::HeartbeatParameters;
use crate::instance::InstanceAddress;
use crate::replication::{Coordinate, GtidMode};

/// The switches of a switchover.
#[derive(Debug, Clone)]
pub struct SwitchoverOptions {
    /// Wait limit for every step, and the maximum lag accepted.
    pub timeout: Duration,
    pub skip_slave_move: bool,
    pub only_slave_move: bool,
    pub skip_heartbeat: bool,
    /// The master replicates from another host; that replication is moved to the new master.
    pub replicating_master: bool,
    /// The master is expected read only and is left read only, and so is the new master.
    pub read_only_master: bool,
    /// Workers moving replicas at the same time.
    pub parallel: usize,
}

/// How far the switchover went.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchoverOutcome {
    /// The replica is the new master.
    Promoted,
    /// Stopped after moving the replicas, as requested.
    OnlyReplicasMoved,
    /// The operator did not confirm after the replicas were moved.
    NotConfirmed,
}

/// The replication of an intermediate master, saved to be recreated on the new master.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpstreamReplication {
    pub master: InstanceAddress,
    pub coordinate: Coordinate,
    pub io_running: bool,
    pub sql_running: bool,
    pub gtid_mode: GtidMode,
}

/// The result of a switchover.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SwitchoverReport {
    pub master: String,
    pub replica: String,
    pub started: DateTime<Local>,
    pub outcome: SwitchoverOutcome,
    pub moved_replicas: Vec<String>,
    /// The replica's executed position in the old master's binary log at the switch.
    pub replica_coordinate: Option<Coordinate>,
    /// The new master's binary log position at the switch, where the old master continues.
    pub new_master_coordinate: Option<Coordinate>,
    pub heartbeat: Option<HeartbeatParameters>,
    pub upstream: Option<UpstreamReplication>,
    pub warnings: Vec<String>,
    /// True if every post-switch check passed.
    pub verified: bool,
}
