//! Module for the promotion of a direct replica to master.
//!
//! [switchover] runs the whole procedure:
//! 1. preflight checks, no change is made when one fails.
//! 2. the other direct replicas of the master are moved below the promoted replica.
//! 3. the heartbeat daemon is stopped on the master.
//! 4. cutover: the master is made read only, the replica catches up, replication is inverted.
//!    A catch-up timeout or a failure to make the replica writable puts the master back in read-write.
//! 5. semisync roles are swapped and the heartbeat is started on the new master.
//! 6. verification: problems are reported, nothing is rolled back anymore.
//!
//! The result is a [SwitchoverReport].
mod structs;
mod functions;

pub use structs::*;
pub use functions::*;
