//! Module for replication control of a single instance and safe topology changes.
//!
//! The [ReplicationController] wraps one [crate::instance::DatabaseInstance] and provides:
//! - status: [ReplicationController::slave_status], [ReplicationController::master_status].
//! - thread control with wait for convergence: [ReplicationController::start_slave],
//!   [ReplicationController::stop_slave].
//! - relationships: [ReplicationController::is_direct_replica_of],
//!   [ReplicationController::is_sibling_of], [ReplicationController::caught_up_to_master].
//! - topology changes: [ReplicationController::move_to] and
//!   [ReplicationController::stop_in_sync_with_sibling].
//!
//! Topology is never stored: every relationship is derived from a status read at the
//! moment of the question.
//!
mod structs;
mod functions;
mod topology;

pub use structs::*;
pub use functions::*;
pub use topology::*;
