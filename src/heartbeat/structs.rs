//! The structs
//!

/// The parameters of a pt-heartbeat invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatParameters {
    /// The replication section (shard), for example `s1`.
    pub section: String,
    pub datacenter: String,
    pub interval: String,
    pub socket: String,
}
