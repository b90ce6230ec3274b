//! The topology changes: moving a replica and stopping two siblings at the same coordinate.
//!
//! Every change follows the same discipline: all checks are done on fresh status reads
//! before the first mutating statement. A shape that is not recognised is refused with
//! [ReplicationError::PreconditionFailed] and nothing is changed.
//!
use std::time::Duration;
use log::*;
use crate::{ReplicationError, Result};
use crate::clock::wait_until;
use crate::instance::InstanceAddress;
use crate::replication::{Coordinate, MasterStatus, ReplicationController, ReplicationStatus, SlaveThread};

impl ReplicationController {
    /// Make this instance replicate from `new_master`, keeping the data position consistent.
    ///
    /// Supported shapes:
    /// 1. siblings with both SQL threads stopped at the same coordinate.
    /// 2. the current master replicates from `new_master`, its SQL thread is stopped and this
    ///    instance has executed everything of the current master.
    /// 3. siblings, both replicating with lag below the timeout.
    /// 4. the current master replicates from `new_master`, both replicating with lag below the timeout.
    ///
    /// In shapes 2 and 4 the current master's executed coordinate is used as the position in
    /// `new_master`'s binary log. This requires that the current master does not write
    /// events of its own, which is the normal state of an intermediate master.
    ///
    /// With `start_if_stopped`, replication is running on both hosts afterwards; otherwise the
    /// threads of this instance are left as they were before the move.
    ///
    /// In shapes 3 and 4 a failure after a host was halted puts this instance back on its
    /// previous master and restarts the halted host; the error is then a
    /// [ReplicationError::PartialFailure] naming what was restored.
    pub fn move_to(
        &mut self,
        new_master: &mut ReplicationController,
        start_if_stopped: bool,
    ) -> Result<ReplicationStatus>
    {
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        let current_master = status.master_address(&self.context.resolver);
        if current_master == *new_master.address() {
            return Err(ReplicationError::PreconditionFailed(format!("{} already replicates from {}", self.name(), new_master.name())));
        }
        if self.address() == new_master.address() {
            return Err(ReplicationError::PreconditionFailed(format!("{} cannot replicate from itself", self.name())));
        }
        let new_master_binlog = new_master.master_status()?
            .ok_or_else(|| ReplicationError::PreconditionFailed(format!("binary logging is disabled on {}, it cannot be a master", new_master.name())))?;
        let new_master_status = new_master.slave_status()?;

        info!("{}: moving from {} to {}", self.name(), current_master.name(), new_master.name());

        if let Some(result) = self.move_stopped_sibling(&status, new_master, new_master_status.as_ref(), &new_master_binlog, start_if_stopped) {
            return result;
        }

        let mut intermediate = match self.master() {
            Ok(master) => master,
            Err(e) => {
                warn!("{}: could not connect to the current master: {}", self.name(), e);
                None
            }
        };
        if let Some(intermediate) = intermediate.as_mut() {
            if let Some(result) = self.move_below_stopped_master(&status, intermediate, new_master, start_if_stopped) {
                return result;
            }
        }
        if let Some(result) = self.move_running_sibling(&status, new_master, new_master_status.as_ref()) {
            return result;
        }
        if let Some(intermediate) = intermediate.as_mut() {
            if let Some(result) = self.move_below_running_master(&status, intermediate, new_master) {
                return result;
            }
        }

        error!("{}: no supported topology change to {} in the current state", self.name(), new_master.name());
        Err(ReplicationError::PreconditionFailed(format!(
            "topology change not supported in the current state: {} (master {}, io: {}, sql: {}) to {}",
            self.name(), current_master.name(), status.io_thread, status.sql_thread, new_master.name(),
        )))
    }
    /// Siblings stopped at the same coordinate: reconfigure at the new master's current binlog position.
    fn move_stopped_sibling(
        &mut self,
        status: &ReplicationStatus,
        new_master: &mut ReplicationController,
        new_master_status: Option<&ReplicationStatus>,
        new_master_binlog: &MasterStatus,
        start_if_stopped: bool,
    ) -> Option<Result<ReplicationStatus>>
    {
        let new_master_status = new_master_status?;
        if !status.sql_thread.is_stopped()
            || !new_master_status.sql_thread.is_stopped()
            || status.coordinate() != new_master_status.coordinate()
            || !self.is_sibling_of(new_master)
        {
            return None;
        }
        info!("{}: sibling {} is stopped at the same coordinate {}", self.name(), new_master.name(), status.coordinate());
        let coordinate = new_master_binlog.coordinate();
        Some(self.repoint(new_master, &coordinate).and_then(|_| self.restore_threads(new_master, status, start_if_stopped)))
    }
    /// The current master is stopped and this instance caught up with it: continue from its executed position.
    fn move_below_stopped_master(
        &mut self,
        status: &ReplicationStatus,
        intermediate: &mut ReplicationController,
        new_master: &mut ReplicationController,
        start_if_stopped: bool,
    ) -> Option<Result<ReplicationStatus>>
    {
        let intermediate_status = match intermediate.slave_status() {
            Ok(Some(intermediate_status)) => intermediate_status,
            _ => return None,
        };
        if intermediate_status.master_address(&self.context.resolver) != *new_master.address()
            || !intermediate_status.sql_thread.is_stopped()
            || !self.caught_up_to_master(Some(intermediate))
        {
            return None;
        }
        info!("{}: master {} is stopped at {} and fully applied", self.name(), intermediate.name(), intermediate_status.coordinate());
        let coordinate = intermediate_status.coordinate();
        Some(self.repoint(new_master, &coordinate).and_then(|_| self.restore_threads(new_master, status, start_if_stopped)))
    }
    /// Running siblings: stop both at the same coordinate, then as for stopped siblings.
    fn move_running_sibling(
        &mut self,
        status: &ReplicationStatus,
        new_master: &mut ReplicationController,
        new_master_status: Option<&ReplicationStatus>,
    ) -> Option<Result<ReplicationStatus>>
    {
        let timeout = self.context.timeout;
        let new_master_status = new_master_status?;
        if !status.sql_thread.is_running()
            || !status.lag_below(timeout)
            || !new_master_status.sql_thread.is_running()
            || !new_master_status.lag_below(timeout)
            || !self.is_sibling_of(new_master)
        {
            return None;
        }
        info!("{}: sibling {} is replicating, stopping both in sync", self.name(), new_master.name());
        let original_master = status.master_address(&self.context.resolver);
        Some(self.move_running_sibling_apply(&original_master, new_master))
    }
    /// Once both are stopped in sync, a failure puts this instance back on `original_master`
    /// at the in-sync coordinate and restarts the sibling.
    fn move_running_sibling_apply(
        &mut self,
        original_master: &InstanceAddress,
        new_master: &mut ReplicationController,
    ) -> Result<ReplicationStatus>
    {
        let coordinate = self.stop_in_sync_with_sibling(new_master)?;
        let moved = (|| -> Result<ReplicationStatus> {
            let binlog = new_master.master_status()?
                .ok_or_else(|| ReplicationError::PreconditionFailed(format!("binary logging is disabled on {}", new_master.name())))?;
            self.repoint(new_master, &binlog.coordinate())?;
            self.start_slave(SlaveThread::Both, None)
        })();
        if let Err(e) = moved {
            return Err(self.undo_move(e, original_master, Some(&coordinate), new_master));
        }
        self.restart_after_move(new_master)?;
        self.verify_replicating(Some(new_master))
    }
    /// The current master replicates from the new master: stop it, let this instance catch up,
    /// then continue from the current master's executed position.
    fn move_below_running_master(
        &mut self,
        status: &ReplicationStatus,
        intermediate: &mut ReplicationController,
        new_master: &mut ReplicationController,
    ) -> Option<Result<ReplicationStatus>>
    {
        let timeout = self.context.timeout;
        let intermediate_status = match intermediate.slave_status() {
            Ok(Some(intermediate_status)) => intermediate_status,
            _ => return None,
        };
        if intermediate_status.master_address(&self.context.resolver) != *new_master.address()
            || !status.sql_thread.is_running()
            || !status.lag_below(timeout)
            || !intermediate_status.sql_thread.is_running()
            || !intermediate_status.lag_below(timeout)
        {
            return None;
        }
        info!("{}: master {} is replicating from {}, moving below it", self.name(), intermediate.name(), new_master.name());
        Some(self.move_below_running_master_apply(intermediate, new_master))
    }
    fn move_below_running_master_apply(
        &mut self,
        intermediate: &mut ReplicationController,
        new_master: &mut ReplicationController,
    ) -> Result<ReplicationStatus>
    {
        intermediate.stop_slave(SlaveThread::Both)?;
        let clock = self.context.clock.clone();
        let timeout = self.context.timeout;
        if !wait_until(clock.as_ref(), timeout, || self.caught_up_to_master(Some(&mut *intermediate))) {
            error!("{}: did not catch up with {} in {:?}", self.name(), intermediate.name(), timeout);
            if let Err(e) = intermediate.start_slave(SlaveThread::Both, None) {
                error!("{}: could not restart replication: {}", intermediate.name(), e);
            }
            return Err(ReplicationError::PartialFailure(format!(
                "{} did not catch up with {}, replication restarted on {}",
                self.name(), intermediate.name(), intermediate.name(),
            )));
        }

        let original_master = intermediate.address().clone();
        let mut restore_point = None;
        let moved = (|| -> Result<ReplicationStatus> {
            let stopped = self.stop_slave(SlaveThread::Both)?;
            restore_point = Some(stopped.coordinate());
            let coordinate = intermediate.slave_status()?
                .ok_or_else(|| intermediate.not_configured())?
                .coordinate();
            self.reset_slave()?;
            self.setup(new_master.address(), &coordinate)?;
            self.start_slave(SlaveThread::Both, None)
        })();
        if let Err(e) = moved {
            return Err(self.undo_move(e, &original_master, restore_point.as_ref(), intermediate));
        }
        self.restart_after_move(intermediate)?;
        self.verify_replicating(Some(intermediate))
    }
    /// Put this instance back on `original_master` and restart replication on `stopped`,
    /// which was halted for the move. Returns the failure, with what was restored.
    fn undo_move(
        &mut self,
        cause: ReplicationError,
        original_master: &InstanceAddress,
        restore_point: Option<&Coordinate>,
        stopped: &mut ReplicationController,
    ) -> ReplicationError
    {
        error!("{}: move failed, restoring replication from {}: {}", self.name(), original_master.name(), cause);
        let mut restored = Vec::new();
        match self.replicate_again_from(original_master, restore_point) {
            Ok(()) => restored.push(format!("{} replicates from {} again", self.name(), original_master.name())),
            Err(e) => {
                error!("{}: could not restore replication from {}: {}", self.name(), original_master.name(), e);
                restored.push(format!("{} could not be restored to replicate from {}: {}", self.name(), original_master.name(), e));
            }
        }
        match stopped.start_slave(SlaveThread::Both, None) {
            Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => restored.push(format!("replication restarted on {}", stopped.name())),
            Err(e) => {
                error!("{}: could not restart replication: {}", stopped.name(), e);
                restored.push(format!("replication could not be restarted on {}: {}", stopped.name(), e));
            }
        }
        ReplicationError::PartialFailure(format!("{}: move failed: {}; {}", self.name(), cause, restored.join("; ")))
    }
    /// Make sure this instance replicates from `master` with both threads running, setting it
    /// up again at `coordinate` if its configuration was already changed.
    fn replicate_again_from(
        &mut self,
        master: &InstanceAddress,
        coordinate: Option<&Coordinate>,
    ) -> Result<()>
    {
        let resolver = self.context.resolver.clone();
        match self.slave_status()? {
            Some(status) if status.master_address(&resolver) == *master => {}
            current => {
                let coordinate = coordinate.ok_or_else(|| ReplicationError::PreconditionFailed(format!("no coordinate of {} to restore from", master.name())))?;
                if current.is_some() {
                    match self.stop_slave(SlaveThread::Both) {
                        Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    self.reset_slave()?;
                }
                self.setup(master, coordinate)?;
            }
        }
        match self.start_slave(SlaveThread::Both, None) {
            Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
    /// The instance replicates from its new master: restart the one that was halted for the move.
    fn restart_after_move(
        &mut self,
        stopped: &mut ReplicationController,
    ) -> Result<()>
    {
        match stopped.start_slave(SlaveThread::Both, None) {
            Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => Ok(()),
            Err(e) => {
                error!("{}: could not restart replication: {}", stopped.name(), e);
                Err(ReplicationError::PartialFailure(format!(
                    "{} was moved, but replication could not be restarted on {}: {}",
                    self.name(), stopped.name(), e,
                )))
            }
        }
    }
    /// Stop (whatever runs), reset and set up replication from `new_master` at `coordinate`.
    fn repoint(
        &mut self,
        new_master: &ReplicationController,
        coordinate: &Coordinate,
    ) -> Result<()>
    {
        match self.stop_slave(SlaveThread::Both) {
            Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => {}
            Err(e) => return Err(e),
        }
        self.reset_slave()?;
        self.setup(new_master.address(), coordinate)
    }
    /// Start both hosts, or put back the threads of this instance that were running before.
    fn restore_threads(
        &mut self,
        new_master: &mut ReplicationController,
        before: &ReplicationStatus,
        start_if_stopped: bool,
    ) -> Result<ReplicationStatus>
    {
        if start_if_stopped {
            self.start_slave(SlaveThread::Both, None)?;
            match new_master.start_slave(SlaveThread::Both, None) {
                Ok(_) | Err(ReplicationError::AlreadyInState { .. }) | Err(ReplicationError::NotConfigured { .. }) => {}
                Err(e) => warn!("{}: could not start replication: {}", new_master.name(), e),
            }
        } else {
            let thread = match (before.io_thread.is_running(), before.sql_thread.is_running()) {
                (true, true) => Some(SlaveThread::Both),
                (true, false) => Some(SlaveThread::Io),
                (false, true) => Some(SlaveThread::Sql),
                (false, false) => None,
            };
            if let Some(thread) = thread {
                self.start_slave(thread, None)?;
            }
        }
        self.slave_status()?.ok_or_else(|| self.not_configured())
    }
    /// Wait one timeout period, then require both threads running with lag below the timeout,
    /// here and on `other` when given.
    fn verify_replicating(
        &mut self,
        other: Option<&mut ReplicationController>,
    ) -> Result<ReplicationStatus>
    {
        let timeout = self.context.timeout;
        self.context.clock.sleep(timeout);
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        if !status.is_running(SlaveThread::Both) || !status.lag_below(timeout) {
            return Err(ReplicationError::PartialFailure(format!("{}: replication not healthy after the move: {}", self.name(), self.summary())));
        }
        if let Some(other) = other {
            match other.slave_status()? {
                Some(other_status) if other_status.is_running(SlaveThread::Both) && other_status.lag_below(timeout) => {}
                _ => return Err(ReplicationError::PartialFailure(format!("{}: replication not healthy after the move: {}", other.name(), other.summary()))),
            }
        }
        info!("{}", self.summary());
        Ok(status)
    }
    /// Stop the SQL threads of this instance and `sibling` at exactly the same coordinate.
    ///
    /// Both must replicate from the same master with running SQL threads and a lag below the
    /// timeout, or nothing is stopped. The sibling that stopped behind is advanced with
    /// `START SLAVE SQL_THREAD UNTIL` to the other's coordinate.
    pub fn stop_in_sync_with_sibling(
        &mut self,
        sibling: &mut ReplicationController,
    ) -> Result<Coordinate>
    {
        let timeout = self.context.timeout;
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        let sibling_status = sibling.slave_status()?.ok_or_else(|| sibling.not_configured())?;
        if !self.is_sibling_of(sibling) {
            return Err(ReplicationError::PreconditionFailed(format!("{} and {} are not siblings", self.name(), sibling.name())));
        }
        if !status.sql_thread.is_running() || !sibling_status.sql_thread.is_running() {
            return Err(ReplicationError::PreconditionFailed(format!(
                "replication is not running on both hosts: {} sql: {}, {} sql: {}",
                self.name(), status.sql_thread, sibling.name(), sibling_status.sql_thread,
            )));
        }
        if !status.lag_below(timeout) || !sibling_status.lag_below(timeout) {
            return Err(ReplicationError::PreconditionFailed(format!(
                "lag is not below {:?}: {}: {:?}, {}: {:?}",
                timeout, self.name(), status.seconds_behind_master, sibling.name(), sibling_status.seconds_behind_master,
            )));
        }

        self.stop_slave(SlaveThread::Sql)?;
        self.context.clock.sleep(timeout);
        sibling.stop_slave(SlaveThread::Sql)?;

        let mine = self.slave_status()?.ok_or_else(|| self.not_configured())?.coordinate();
        let theirs = sibling.slave_status()?.ok_or_else(|| sibling.not_configured())?.coordinate();
        if theirs < mine {
            return Err(ReplicationError::PartialFailure(format!(
                "{} stopped at {}, behind {} at {}; both SQL threads are left stopped",
                sibling.name(), theirs, self.name(), mine,
            )));
        }
        if theirs > mine {
            info!("{}: advancing from {} to {}", self.name(), mine, theirs);
            self.start_slave(SlaveThread::Sql, Some(&theirs))?;
            let clock = self.context.clock.clone();
            let stopped = wait_until(clock.as_ref(), timeout, || {
                matches!(self.slave_status(), Ok(Some(status)) if status.sql_thread.is_stopped())
            });
            if !stopped {
                warn!("{}: SQL thread did not stop at {} within {:?}", self.name(), theirs, timeout);
            }
        }

        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        let sibling_status = sibling.slave_status()?.ok_or_else(|| sibling.not_configured())?;
        if !status.sql_thread.is_stopped() || !sibling_status.sql_thread.is_stopped() || status.coordinate() != sibling_status.coordinate() {
            return Err(ReplicationError::PartialFailure(format!(
                "expected both hosts stopped at the same coordinate: {} sql: {} at {}, {} sql: {} at {}",
                self.name(), status.sql_thread, status.coordinate(), sibling.name(), sibling_status.sql_thread, sibling_status.coordinate(),
            )));
        }
        info!("{} and {} stopped at {}", self.name(), sibling.name(), status.coordinate());
        Ok(status.coordinate())
    }
}

/// Lag limit helper for callers holding a timeout in seconds.
pub fn lag_within(lag: Option<u64>, limit: Duration) -> bool {
    matches!(lag, Some(lag) if Duration::from_secs(lag) <= limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SimFleet, SimServer};

    fn fleet() -> SimFleet {
        let fleet = SimFleet::new();
        fleet.add_server(SimServer::new("db1001.test", 3306).writable());
        fleet.add_server(SimServer::new("db1002.test", 3306).replica_of("db1001.test", 3306));
        fleet.add_server(SimServer::new("db1003.test", 3306).replica_of("db1001.test", 3306));
        fleet.add_server(SimServer::new("db1004.test", 3306).replica_of("db1002.test", 3306));
        fleet
    }

    #[test]
    fn unit_stop_in_sync_with_lagging_sibling_is_refused_without_changes() {
        let fleet = fleet();
        let context = fleet.context(Duration::from_secs(5));
        let mut first = context.open_name("db1002.test").unwrap();
        let mut second = context.open_name("db1003.test").unwrap();
        fleet.set_lag("db1003.test:3306", 60);
        assert!(matches!(first.stop_in_sync_with_sibling(&mut second), Err(ReplicationError::PreconditionFailed(_))));
        assert!(fleet.mutating_statements("db1002.test:3306").is_empty());
        assert!(fleet.mutating_statements("db1003.test:3306").is_empty());
    }

    #[test]
    fn unit_stop_in_sync_stops_at_the_same_coordinate() {
        let fleet = fleet();
        fleet.set_write_rate("db1001.test:3306", 100);
        let context = fleet.context(Duration::from_secs(2));
        let mut first = context.open_name("db1002.test").unwrap();
        let mut second = context.open_name("db1003.test").unwrap();
        let coordinate = first.stop_in_sync_with_sibling(&mut second).unwrap();

        let first_status = first.slave_status().unwrap().unwrap();
        let second_status = second.slave_status().unwrap().unwrap();
        assert!(first_status.sql_thread.is_stopped());
        assert!(second_status.sql_thread.is_stopped());
        assert_eq!(first_status.coordinate(), coordinate);
        assert_eq!(second_status.coordinate(), coordinate);
        // the first stopped earlier and was advanced with UNTIL
        assert!(fleet.statements("db1002.test:3306").iter().any(|s| s.starts_with("START SLAVE SQL_THREAD UNTIL")));
    }

    #[test]
    fn unit_stop_in_sync_refuses_non_siblings() {
        let fleet = fleet();
        let context = fleet.context(Duration::from_secs(5));
        let mut first = context.open_name("db1002.test").unwrap();
        let mut nephew = context.open_name("db1004.test").unwrap();
        assert!(matches!(first.stop_in_sync_with_sibling(&mut nephew), Err(ReplicationError::PreconditionFailed(_))));
    }

    #[test]
    fn unit_move_refuses_the_current_master_and_itself() {
        let fleet = fleet();
        let context = fleet.context(Duration::from_secs(5));
        let mut replica = context.open_name("db1002.test").unwrap();
        let mut master = context.open_name("db1001.test").unwrap();
        assert!(matches!(replica.move_to(&mut master, false), Err(ReplicationError::PreconditionFailed(_))));
        let mut same = context.open_name("db1002.test").unwrap();
        assert!(matches!(replica.move_to(&mut same, false), Err(ReplicationError::PreconditionFailed(_))));
        let mut not_a_replica = context.open_name("db1001.test").unwrap();
        assert!(matches!(not_a_replica.move_to(&mut replica, false), Err(ReplicationError::NotConfigured { .. })));
    }

    #[test]
    fn unit_move_running_sibling_below_sibling() {
        let fleet = fleet();
        fleet.set_write_rate("db1001.test:3306", 50);
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1003.test").unwrap();
        let mut new_master = context.open_name("db1002.test").unwrap();
        let status = replica.move_to(&mut new_master, false).unwrap();
        assert_eq!(status.master_host, "db1002.test");
        assert!(status.is_running(SlaveThread::Both));
        assert!(new_master.slave_status().unwrap().unwrap().is_running(SlaveThread::Both));
    }

    #[test]
    fn unit_move_running_replica_up_to_its_grandmaster() {
        let fleet = fleet();
        fleet.set_write_rate("db1001.test:3306", 50);
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1004.test").unwrap();
        let mut new_master = context.open_name("db1001.test").unwrap();
        let status = replica.move_to(&mut new_master, false).unwrap();
        assert_eq!(status.master_host, "db1001.test");
        assert!(status.is_running(SlaveThread::Both));
        let intermediate = context.open_name("db1002.test").unwrap().slave_status().unwrap().unwrap();
        assert!(intermediate.is_running(SlaveThread::Both));
    }

    #[test]
    fn unit_failed_sibling_move_goes_back_to_the_old_master() {
        let fleet = fleet();
        fleet.set_write_rate("db1001.test:3306", 50);
        fleet.fail_statements("db1003.test:3306", "CHANGE MASTER TO MASTER_HOST = 'db1002.test'");
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1003.test").unwrap();
        let mut new_master = context.open_name("db1002.test").unwrap();

        let error = replica.move_to(&mut new_master, false).unwrap_err();

        assert!(matches!(error, ReplicationError::PartialFailure(_)), "{}", error);
        assert!(error.to_string().contains("db1003 replicates from db1001 again"), "{}", error);
        let status = replica.slave_status().unwrap().unwrap();
        assert_eq!(status.master_host, "db1001.test");
        assert!(status.is_running(SlaveThread::Both));
        assert!(new_master.slave_status().unwrap().unwrap().is_running(SlaveThread::Both));
    }

    #[test]
    fn unit_failed_move_below_grandmaster_restarts_the_intermediate() {
        let fleet = fleet();
        fleet.set_write_rate("db1001.test:3306", 50);
        fleet.fail_statements("db1004.test:3306", "CHANGE MASTER TO MASTER_HOST = 'db1001.test'");
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1004.test").unwrap();
        let mut new_master = context.open_name("db1001.test").unwrap();

        let error = replica.move_to(&mut new_master, false).unwrap_err();

        assert!(matches!(error, ReplicationError::PartialFailure(_)), "{}", error);
        assert!(error.to_string().contains("replication restarted on db1002"), "{}", error);
        let status = replica.slave_status().unwrap().unwrap();
        assert_eq!(status.master_host, "db1002.test");
        assert!(status.is_running(SlaveThread::Both));
        let mut intermediate = context.open_name("db1002.test").unwrap();
        assert!(intermediate.slave_status().unwrap().unwrap().is_running(SlaveThread::Both));
        assert!(fleet.statements("db1004.test:3306").iter().any(|s| s == "RESET SLAVE ALL"));
    }

    #[test]
    fn unit_move_stopped_siblings_keeps_threads_stopped() {
        let fleet = fleet();
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1003.test").unwrap();
        let mut new_master = context.open_name("db1002.test").unwrap();
        replica.stop_slave(SlaveThread::Both).unwrap();
        new_master.stop_slave(SlaveThread::Sql).unwrap();

        let status = replica.move_to(&mut new_master, false).unwrap();
        assert_eq!(status.master_host, "db1002.test");
        assert!(status.is_stopped(SlaveThread::Both));

        let status = replica.start_slave(SlaveThread::Both, None).unwrap();
        assert!(status.is_running(SlaveThread::Both));
    }

    #[test]
    fn unit_move_unsupported_shape_changes_nothing() {
        let fleet = fleet();
        let context = fleet.context(Duration::from_secs(2));
        let mut replica = context.open_name("db1003.test").unwrap();
        let mut new_master = context.open_name("db1002.test").unwrap();
        // only one of the siblings is stopped
        replica.stop_slave(SlaveThread::Sql).unwrap();
        let before = fleet.mutating_statements("db1003.test:3306").len();
        assert!(matches!(replica.move_to(&mut new_master, false), Err(ReplicationError::PreconditionFailed(_))));
        assert_eq!(fleet.mutating_statements("db1003.test:3306").len(), before);
        assert!(fleet.mutating_statements("db1002.test:3306").is_empty());
    }

    #[test]
    fn unit_lag_within() {
        assert!(lag_within(Some(5), Duration::from_secs(5)));
        assert!(!lag_within(Some(6), Duration::from_secs(5)));
        assert!(!lag_within(None, Duration::from_secs(5)));
    }
}
