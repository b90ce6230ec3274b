//! The structs
//!
use std::time::Duration;
use crate::instance::InstanceAddress;

/// Levels of replicas discovered below the root.
pub const MAX_DEPTH: usize = 10;

/// What is shown for one instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InstanceDetails {
    pub version: String,
    pub binlog_format: String,
    pub read_only: bool,
    /// Seconds.
    pub uptime: Option<u64>,
    pub processes: Option<u64>,
    /// Time taken by a single query.
    pub latency: Duration,
    /// `None` for the root or when unknown.
    pub lag: Option<u64>,
}

/// One instance of the tree and its replicas.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub address: InstanceAddress,
    pub details: Option<InstanceDetails>,
    /// Why the details could not be read.
    pub error: Option<String>,
    pub replicas: Vec<TreeNode>,
    /// Replicas were not discovered, the depth limit was reached or the instance was seen before.
    pub truncated: bool,
}
