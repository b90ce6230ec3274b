//! The impls and functions
//!
use std::{sync::{mpsc::channel, Mutex, PoisonError}, time::Instant};
use chrono::Local;
use log::*;
use crate::{ReplicationError, Result};
use crate::clock::wait_until;
use crate::heartbeat::{start_heartbeat, stop_heartbeat};
use crate::instance::DatabaseInstance;
use crate::remote::RemoteProcessRunner;
use crate::replication::{lag_within, GtidMode, ReplicationController, SlaveThread};
use crate::switchover::{SwitchoverOptions, SwitchoverOutcome, SwitchoverReport, UpstreamReplication};

/// Servers before this version have no built-in semisync and use the plugins.
const SEMISYNC_BUILTIN_VERSION: (u32, u32, u32) = (10, 3, 0);

/// Promote `replica` to be the master of the replica set of `master`.
///
/// `confirm` is asked after the replicas are moved and before anything touches the master;
/// answering false stops the switchover with [SwitchoverOutcome::NotConfirmed].
pub fn switchover(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    runner: &dyn RemoteProcessRunner,
    options: &SwitchoverOptions,
    confirm: &mut dyn FnMut() -> bool,
) -> Result<SwitchoverReport>
{
    let mut report = SwitchoverReport {
        master: master.name(),
        replica: replica.name(),
        started: Local::now(),
        outcome: SwitchoverOutcome::NotConfirmed,
        moved_replicas: Vec::new(),
        replica_coordinate: None,
        new_master_coordinate: None,
        heartbeat: None,
        upstream: None,
        warnings: Vec::new(),
        verified: false,
    };
    info!("starting switchover from {} to {}", master.name(), replica.name());

    preflight(master, replica, options)?;

    if options.skip_slave_move {
        info!("skipping the move of the replicas of {}", master.name());
    } else {
        report.moved_replicas = move_replicas(master, replica, options)?;
    }
    if options.only_slave_move {
        info!("replicas of {} moved below {}, not continuing the switchover", master.name(), replica.name());
        report.outcome = SwitchoverOutcome::OnlyReplicasMoved;
        return Ok(report);
    }
    if !confirm() {
        warn!("switchover from {} to {} not confirmed, {} is untouched", master.name(), replica.name(), master.name());
        return Ok(report);
    }

    if options.skip_heartbeat {
        info!("skipping the heartbeat handoff");
    } else {
        report.heartbeat = Some(stop_heartbeat(runner, &mut master.instance, &mut report.warnings)?);
    }

    cutover(master, replica, runner, options, &mut report)?;
    report.outcome = SwitchoverOutcome::Promoted;
    info!("{} is the new master of {}", replica.name(), master.name());

    swap_semisync(master, replica, &mut report);
    check_semisync_clients(replica, &mut report);

    if let Some(parameters) = report.heartbeat.clone() {
        match start_heartbeat(runner, &mut replica.instance, &parameters, &mut report.warnings) {
            Ok((_, parameters)) => report.heartbeat = Some(parameters),
            Err(e) => warning(&mut report, format!("the heartbeat could not be started on {}: {}", replica.name(), e)),
        }
    }
    if let Some(upstream) = report.upstream.clone() {
        if let Err(e) = restore_upstream(replica, &upstream) {
            warning(&mut report, format!("{} could not be set up to replicate from {}: {}", replica.name(), upstream.master.name(), e));
        }
    }

    let problems = verify(master, replica, options);
    report.verified = problems.is_empty();
    for problem in problems {
        warning(&mut report, problem);
    }
    if report.verified {
        info!("switchover from {} to {} verified", master.name(), replica.name());
    }

    if let Err(e) = master.set_gtid_mode(GtidMode::SlavePos) {
        warning(&mut report, format!("{}: could not enable gtid: {}", master.name(), e));
    }
    Ok(report)
}

/// The checks done before anything is changed.
pub fn preflight(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    options: &SwitchoverOptions,
) -> Result<()>
{
    let master_read_only = master.instance.read_only()?;
    let replica_read_only = replica.instance.read_only()?;
    if master_read_only != options.read_only_master || !replica_read_only {
        return failed(format!(
            "initial read_only status check failed: {} read_only: {}, {} read_only: {}",
            master.name(), i32::from(master_read_only), replica.name(), i32::from(replica_read_only),
        ));
    }
    info!("read only values as expected: {} read_only: {}, {} read_only: 1", master.name(), i32::from(master_read_only), replica.name());

    if !replica.is_direct_replica_of(master.address()) {
        return failed(format!("{} is not a direct replica of {}", replica.name(), master.name()));
    }
    info!("{} is a direct replica of {}", replica.name(), master.name());

    let status = replica.slave_status()?.ok_or_else(|| replica.not_configured())?;
    if !status.is_running(SlaveThread::Both) {
        return failed(format!("replication is not running on {}: io: {}, sql: {}", replica.name(), status.io_thread, status.sql_thread));
    }
    info!("replication is running on {}", replica.name());

    let master_format = master.instance.global_variable("binlog_format")?;
    let replica_format = replica.instance.global_variable("binlog_format")?;
    if master_format != replica_format {
        return failed(format!(
            "binlog formats differ: {}: {}, {}: {}",
            master.name(), master_format.unwrap_or_default(), replica.name(), replica_format.unwrap_or_default(),
        ));
    }
    info!("binlog format is {} on both servers", master_format.unwrap_or_default());

    match status.seconds_behind_master {
        None => return failed(format!("the lag of {} could not be measured", replica.name())),
        lag if !lag_within(lag, options.timeout) => {
            return failed(format!("{} is lagging {:?} seconds, more than {:?}", replica.name(), lag, options.timeout));
        }
        lag => info!("the lag of {} is {:?} seconds", replica.name(), lag),
    }

    if replica.master_status()?.is_none() {
        return failed(format!("binary logging is disabled on {}, it cannot be a master", replica.name()));
    }

    let upstream = master.slave_status()?;
    match (options.replicating_master, upstream) {
        (true, None) => return failed(format!("{} is not replicating, but the master was expected to replicate", master.name())),
        (false, Some(upstream)) => {
            return failed(format!(
                "{} replicates from {}:{}, but the master was not expected to replicate",
                master.name(), upstream.master_host, upstream.master_port,
            ));
        }
        (true, Some(_)) => {
            if master.is_direct_replica_of(replica.address()) {
                return failed(format!("{} and {} replicate from each other, circular replication is not supported", master.name(), replica.name()));
            }
            info!("{} replicates from another server, its replication will be moved to {}", master.name(), replica.name());
        }
        (false, None) => {}
    }
    Ok(())
}

/// Move every other direct replica of `master` below `replica`, `options.parallel` at a time.
///
/// Moves on the promoted replica are serialized: a sibling move stops its SQL thread.
/// Returns the names of the moved replicas; any failed move fails the whole step, and the
/// gtid mode of `replica` is put back.
pub fn move_replicas(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    options: &SwitchoverOptions,
) -> Result<Vec<String>>
{
    let previous_mode = replica.gtid_mode()?.unwrap_or(GtidMode::No);
    replica.set_gtid_mode(GtidMode::No)?;

    let moved = move_other_replicas(master, replica, options);
    if moved.is_err() && previous_mode != GtidMode::No {
        if let Err(e) = replica.set_gtid_mode(previous_mode) {
            error!("{}: could not restore gtid mode {}: {}", replica.name(), previous_mode, e);
        }
    }
    moved
}

fn move_other_replicas(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    options: &SwitchoverOptions,
) -> Result<Vec<String>>
{
    let target_address = replica.address().clone();
    let candidates: Vec<ReplicationController> = master.replicas()?
        .into_iter()
        .filter(|candidate| *candidate.address() != target_address)
        .collect();
    if candidates.is_empty() {
        info!("{} has no other replicas to move", master.name());
        return Ok(Vec::new());
    }

    info!("begin parallel replica move to {}", replica.name());
    let timer = Instant::now();

    let timeout = options.timeout;
    let context = replica.context.clone();
    let context = &context;
    let target_address = &target_address;
    let target_lock = Mutex::new(());
    let target_lock = &target_lock;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(options.parallel.max(1)).build()
        .map_err(|e| ReplicationError::PreconditionFailed(format!("could not create thread pool: {}", e)))?;
    let (tx, rx) = channel();
    pool.scope(move |s| {
        for mut candidate in candidates {
            let tx = tx.clone();
            s.spawn(move |_| {
                let name = candidate.name();
                let previous_mode = candidate.gtid_mode().ok().flatten().unwrap_or(GtidMode::No);
                let moved = candidate.set_gtid_mode(GtidMode::No)
                    .and_then(|_| {
                        context.clock.sleep(timeout);
                        let _guard = target_lock.lock().unwrap_or_else(PoisonError::into_inner);
                        let mut target = context.open(target_address)?;
                        candidate.move_to(&mut target, true)
                    })
                    .and_then(|_| candidate.set_gtid_mode(GtidMode::SlavePos));
                if moved.is_err() {
                    if let Err(e) = candidate.set_gtid_mode(previous_mode) {
                        warn!("{}: could not restore gtid mode {}: {}", name, previous_mode, e);
                    }
                }
                tx.send((name, moved)).expect("error sending data via tx (move)");
            });
        }
    });

    info!("end parallel replica move {:?}", timer.elapsed());

    let mut moved = Vec::new();
    let mut failures = Vec::new();
    for (name, result) in rx {
        match result {
            Ok(()) => {
                info!("{} moved below {}", name, replica.name());
                moved.push(name);
            }
            Err(e) => {
                error!("{} could not be moved below {}: {}", name, replica.name(), e);
                failures.push(format!("{}: {}", name, e));
            }
        }
    }
    moved.sort();
    if !failures.is_empty() {
        failures.sort();
        return Err(ReplicationError::PartialFailure(format!(
            "{} replica(s) could not be moved below {}, nothing was done on {}; moved: [{}]; failed: [{}]",
            failures.len(), replica.name(), master.name(), moved.join(", "), failures.join("; "),
        )));
    }
    Ok(moved)
}

/// Freeze the master, let the replica catch up, and invert the replication direction.
fn cutover(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    runner: &dyn RemoteProcessRunner,
    options: &SwitchoverOptions,
    report: &mut SwitchoverReport,
) -> Result<()>
{
    if let Err(e) = freeze_and_sync(master, replica, options, report) {
        error!("cutover from {} to {} failed: {}", master.name(), replica.name(), e);
        let reverted = abort_cutover(master, replica, runner, options, report);
        return Err(ReplicationError::PartialFailure(format!("{}; switchover aborted: {}", e, reverted)));
    }

    let master_read_only = master.instance.read_only()?;
    let replica_read_only = replica.instance.read_only()?;
    if !master_read_only || replica_read_only != options.read_only_master {
        return Err(ReplicationError::PartialFailure(format!(
            "post check failed: {} read_only: {}, {} read_only: {}",
            master.name(), i32::from(master_read_only), replica.name(), i32::from(replica_read_only),
        )));
    }
    info!("read only values as expected: {} read_only: 1, {} read_only: {}", master.name(), replica.name(), i32::from(replica_read_only));

    let coordinate = report.new_master_coordinate.clone()
        .ok_or_else(|| ReplicationError::PartialFailure(format!("the binary log coordinate of {} was not recorded", replica.name())))?;
    let new_master = replica.address().clone();
    let inverted = master.setup(&new_master, &coordinate)
        .and_then(|_| master.start_slave(SlaveThread::Both, None))
        .and_then(|_| replica.reset_slave());
    if let Err(e) = inverted {
        return Err(ReplicationError::PartialFailure(format!(
            "{} is writable but {} could not be set up to replicate from it at {}: {}",
            replica.name(), master.name(), coordinate, e,
        )));
    }
    info!("{} replicates from {} at {}", master.name(), replica.name(), coordinate);
    Ok(())
}

/// Everything up to and including making the replica writable.
/// A failure here leaves the master to be put back by [abort_cutover].
fn freeze_and_sync(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    options: &SwitchoverOptions,
    report: &mut SwitchoverReport,
) -> Result<()>
{
    let timeout = options.timeout;
    if options.replicating_master {
        report.upstream = Some(stop_upstream_replication(master)?);
    }
    if !options.read_only_master {
        info!("setting {} read only", master.name());
        master.instance.set_read_only(true)?;
    }

    let clock = master.context.clock.clone();
    let caught_up = wait_until(clock.as_ref(), timeout, || replica.caught_up_to_master(Some(&mut *master)));
    if !caught_up {
        return Err(ReplicationError::Timeout {
            instance: replica.name(),
            operation: format!("catching up with {}", master.name()),
            detail: format!("not in sync after {:?}: {}", timeout, replica.summary()),
        });
    }

    let replica_coordinate = replica.slave_status()?.ok_or_else(|| replica.not_configured())?.coordinate();
    let new_master_coordinate = replica.master_status()?
        .ok_or_else(|| ReplicationError::PreconditionFailed(format!("binary logging is disabled on {}", replica.name())))?
        .coordinate();
    info!("servers in sync: {} at {} of {}, {} binary log at {}", replica.name(), replica_coordinate, master.name(), replica.name(), new_master_coordinate);
    report.replica_coordinate = Some(replica_coordinate);
    report.new_master_coordinate = Some(new_master_coordinate);

    replica.stop_slave(SlaveThread::Both)?;
    if !options.read_only_master {
        info!("setting {} read-write", replica.name());
        replica.instance.set_read_only(false)?;
    }
    Ok(())
}

/// Put the master back in service after a failed cutover: writable again, upstream
/// replication and heartbeat restored, and the replica replicating from it.
/// Returns a description of what was reverted.
fn abort_cutover(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    runner: &dyn RemoteProcessRunner,
    options: &SwitchoverOptions,
    report: &mut SwitchoverReport,
) -> String
{
    let mut reverted = Vec::new();
    if !options.read_only_master {
        match master.instance.set_read_only(false) {
            Ok(()) => reverted.push(format!("{} is read-write again", master.name())),
            Err(e) => {
                error!("{}: could not be made read-write again, there is no writable master: {}", master.name(), e);
                reverted.push(format!("{} could NOT be made read-write again: {}", master.name(), e));
            }
        }
    }
    match replica.start_slave(SlaveThread::Both, None) {
        Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => {}
        Err(e) => reverted.push(format!("replication could not be restarted on {}: {}", replica.name(), e)),
    }
    if let Some(upstream) = report.upstream.take() {
        match restore_upstream(master, &upstream) {
            Ok(()) => reverted.push(format!("{} replicates again from {}", master.name(), upstream.master.name())),
            Err(e) => reverted.push(format!("{} could not be set up to replicate again from {}: {}", master.name(), upstream.master.name(), e)),
        }
    }
    if let Some(parameters) = report.heartbeat.clone() {
        match start_heartbeat(runner, &mut master.instance, &parameters, &mut report.warnings) {
            Ok(_) => reverted.push(format!("heartbeat restarted on {}", master.name())),
            Err(e) => reverted.push(format!("heartbeat could not be restarted on {}: {}", master.name(), e)),
        }
    }
    reverted.join(", ")
}

/// Stop and remove the replication of an intermediate master, returning what is needed to
/// recreate it elsewhere: the thread states before the stop and the coordinate after it.
fn stop_upstream_replication(master: &mut ReplicationController) -> Result<UpstreamReplication> {
    let before = master.slave_status()?.ok_or_else(|| master.not_configured())?;
    match master.stop_slave(SlaveThread::Both) {
        Ok(_) | Err(ReplicationError::AlreadyInState { .. }) => {}
        Err(e) => return Err(e),
    }
    let after = master.slave_status()?.ok_or_else(|| master.not_configured())?;
    master.reset_slave()?;
    let upstream = UpstreamReplication {
        master: before.master_address(&master.context.resolver),
        coordinate: after.coordinate(),
        io_running: !before.io_thread.is_stopped(),
        sql_running: !before.sql_thread.is_stopped(),
        gtid_mode: before.gtid_mode,
    };
    info!("{}: replication from {} removed at {}", master.name(), upstream.master.name(), upstream.coordinate);
    Ok(upstream)
}

/// Recreate a saved upstream replication on `instance`, starting the threads that ran.
fn restore_upstream(
    instance: &mut ReplicationController,
    upstream: &UpstreamReplication,
) -> Result<()>
{
    instance.setup(&upstream.master, &upstream.coordinate)?;
    let thread = match (upstream.io_running, upstream.sql_running) {
        (true, true) => Some(SlaveThread::Both),
        (true, false) => Some(SlaveThread::Io),
        (false, true) => Some(SlaveThread::Sql),
        (false, false) => None,
    };
    if let Some(thread) = thread {
        instance.start_slave(thread, None)?;
    }
    if upstream.gtid_mode != GtidMode::No {
        instance.set_gtid_mode(upstream.gtid_mode)?;
    }
    info!("{}: replicating from {} at {}", instance.name(), upstream.master.name(), upstream.coordinate);
    Ok(())
}

/// Disable semisync on the old master side and enable the other side, on both servers.
fn swap_semisync(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    report: &mut SwitchoverReport,
) {
    if let Err(e) = set_semisync_role(&mut master.instance, false) {
        warning(report, format!("semisync could not be configured as replica on {}: {}", master.name(), e));
    }
    if let Err(e) = set_semisync_role(&mut replica.instance, true) {
        warning(report, format!("semisync could not be configured as master on {}: {}", replica.name(), e));
    }
}

fn set_semisync_role(
    instance: &mut DatabaseInstance,
    master: bool,
) -> Result<()>
{
    let (from, to) = if master { ("slave", "master") } else { ("master", "slave") };
    instance.execute(&format!("SET GLOBAL rpl_semi_sync_{}_enabled = 0", from))?;
    if instance.version()? < SEMISYNC_BUILTIN_VERSION {
        instance.execute(&format!("UNINSTALL PLUGIN rpl_semi_sync_{}", from))?;
        instance.execute(&format!("INSTALL PLUGIN rpl_semi_sync_{} SONAME 'semisync_{}.so'", to, to))?;
    }
    instance.execute(&format!("SET GLOBAL rpl_semi_sync_{}_enabled = 1", to))?;
    info!("{}: semisync enabled as {}", instance.name(), to);
    Ok(())
}

/// Warn when fewer replicas than expected acknowledge as semisync clients of the new master.
fn check_semisync_clients(
    replica: &mut ReplicationController,
    report: &mut SwitchoverReport,
) {
    let expected = report.moved_replicas.len() + 1;
    let clients = replica.instance.execute("SHOW GLOBAL STATUS LIKE 'Rpl_semi_sync_master_clients'")
        .ok()
        .and_then(|result| result.rows.into_iter().next())
        .and_then(|row| row.get(1).cloned().flatten())
        .and_then(|value| value.parse::<usize>().ok());
    match clients {
        Some(clients) if clients >= expected => info!("{}: {} semisync clients", replica.name(), clients),
        Some(clients) => warning(report, format!("{}: {} semisync clients, expected {}", replica.name(), clients, expected)),
        None => warning(report, format!("{}: the number of semisync clients could not be read", replica.name())),
    }
}

/// The post switch checks, as a list of problems.
fn verify(
    master: &mut ReplicationController,
    replica: &mut ReplicationController,
    options: &SwitchoverOptions,
) -> Vec<String>
{
    let mut problems = Vec::new();
    match (master.instance.read_only(), replica.instance.read_only()) {
        (Ok(true), Ok(replica_read_only)) if replica_read_only == options.read_only_master => {}
        (master_read_only, replica_read_only) => problems.push(format!(
            "unexpected read only values: {} read_only: {:?}, {} read_only: {:?}",
            master.name(), master_read_only, replica.name(), replica_read_only,
        )),
    }
    if !master.is_direct_replica_of(replica.address()) {
        problems.push(format!("{} does not replicate from {}", master.name(), replica.name()));
    }
    match master.slave_status() {
        Ok(Some(status)) if status.is_running(SlaveThread::Both) => {}
        _ => problems.push(format!("replication is not running: {}", master.summary())),
    }
    if options.replicating_master && !matches!(replica.slave_status(), Ok(Some(_))) {
        problems.push(format!("{} does not replicate from the upstream master", replica.name()));
    }
    for problem in &problems {
        error!("{}", problem);
    }
    problems
}

fn warning(
    report: &mut SwitchoverReport,
    message: String,
) {
    warn!("{}", message);
    report.warnings.push(message);
}

fn failed(message: String) -> Result<()> {
    error!("{}", message);
    Err(ReplicationError::PreconditionFailed(message))
}
