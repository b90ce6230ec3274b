use std::time::Duration;
use mdbrepl::ReplicationError;
use mdbrepl::heartbeat::HeartbeatParameters;
use mdbrepl::replication::{ReplicationController, SlaveThread};
use mdbrepl::simulation::{SimFleet, SimServer};
use mdbrepl::switchover::{switchover, SwitchoverOptions, SwitchoverOutcome};

const TIMEOUT: Duration = Duration::from_secs(5);

fn options() -> SwitchoverOptions {
    SwitchoverOptions {
        timeout: TIMEOUT,
        skip_slave_move: false,
        only_slave_move: false,
        skip_heartbeat: true,
        replicating_master: false,
        read_only_master: false,
        parallel: 2,
    }
}

fn open(
    fleet: &SimFleet,
    name: &str,
) -> ReplicationController
{
    fleet.context(TIMEOUT).open_name(name).unwrap()
}

/// db1001 master of db1002, db1003, db1004 and db1005, all in eqiad.
fn section() -> SimFleet {
    let fleet = SimFleet::new();
    fleet.add_server(SimServer::new("db1001.eqiad.wmnet", 3306).writable().heartbeat_row("s1", "eqiad"));
    for host in ["db1002.eqiad.wmnet", "db1003.eqiad.wmnet", "db1004.eqiad.wmnet", "db1005.eqiad.wmnet"] {
        fleet.add_server(SimServer::new(host, 3306).replica_of("db1001.eqiad.wmnet", 3306).semisync(false, true));
    }
    fleet
}

fn heartbeat() -> HeartbeatParameters {
    HeartbeatParameters {
        section: "s1".to_string(),
        datacenter: "eqiad".to_string(),
        interval: "1".to_string(),
        socket: "/run/mysqld/mysqld.sock".to_string(),
    }
}

#[test]
fn integration_lagging_replica_is_refused_without_changes() {
    let fleet = section();
    fleet.set_lag("db1002.eqiad.wmnet:3306", 20);
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");

    let error = switchover(&mut master, &mut replica, &fleet.runner(), &options(), &mut || true).unwrap_err();

    assert!(error.is_precondition());
    assert!(error.to_string().contains("lagging"));
    for host in ["db1001", "db1002", "db1003", "db1004", "db1005"] {
        assert!(fleet.mutating_statements(&format!("{}.eqiad.wmnet:3306", host)).is_empty(), "{} was changed", host);
    }
}

#[test]
fn integration_failed_replica_move_aborts_before_the_cutover() {
    let fleet = section();
    fleet.set_lag("db1004.eqiad.wmnet:3306", 60);
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");

    let error = switchover(&mut master, &mut replica, &fleet.runner(), &options(), &mut || true).unwrap_err();

    assert!(matches!(error, ReplicationError::PartialFailure(_)));
    assert!(error.to_string().contains("db1004"));
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(false));
    assert_eq!(fleet.read_only("db1002.eqiad.wmnet:3306"), Some(true));
    assert!(fleet.mutating_statements("db1001.eqiad.wmnet:3306").is_empty());
    let mut failed = open(&fleet, "db1004.eqiad.wmnet");
    assert!(failed.is_direct_replica_of(master.address()));
}

#[test]
fn integration_catch_up_timeout_puts_the_master_back() {
    let fleet = SimFleet::new();
    fleet.add_server(SimServer::new("db1001.eqiad.wmnet", 3306).writable());
    fleet.add_server(SimServer::new("db1002.eqiad.wmnet", 3306).replica_of("db1001.eqiad.wmnet", 3306));
    fleet.stall("db1002.eqiad.wmnet:3306", true);
    fleet.write("db1001.eqiad.wmnet:3306", 1000);
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");

    let error = switchover(&mut master, &mut replica, &fleet.runner(), &options(), &mut || true).unwrap_err();

    assert!(matches!(error, ReplicationError::PartialFailure(_)));
    assert!(error.to_string().contains("read-write again"));
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(false));
    assert_eq!(fleet.read_only("db1002.eqiad.wmnet:3306"), Some(true));
    assert!(fleet.mutating_statements("db1002.eqiad.wmnet:3306").iter().all(|s| s != "SET GLOBAL read_only = 0"));
    let status = replica.slave_status().unwrap().unwrap();
    assert!(status.is_running(SlaveThread::Both));
}

#[test]
fn integration_failed_write_flip_puts_the_master_back() {
    let fleet = section();
    fleet.fail_statements("db1002.eqiad.wmnet:3306", "SET GLOBAL read_only = 0");
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");
    let options = SwitchoverOptions { skip_slave_move: true, ..options() };

    let error = switchover(&mut master, &mut replica, &fleet.runner(), &options, &mut || true).unwrap_err();

    assert!(matches!(error, ReplicationError::PartialFailure(_)));
    assert!(error.to_string().contains("db1001 is read-write again"), "{}", error);
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(false));
    assert_eq!(fleet.read_only("db1002.eqiad.wmnet:3306"), Some(true));
    assert!(replica.is_direct_replica_of(master.address()));
    assert!(replica.slave_status().unwrap().unwrap().is_running(SlaveThread::Both));
}

#[test]
fn integration_switchover_promotes_the_replica() {
    let fleet = section();
    fleet.set_write_rate("db1001.eqiad.wmnet:3306", 200);
    fleet.add_process("db1001.eqiad.wmnet", &heartbeat().command_line());
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");
    let options = SwitchoverOptions { skip_heartbeat: false, ..options() };

    let report = switchover(&mut master, &mut replica, &fleet.runner(), &options, &mut || true).unwrap();

    assert_eq!(report.outcome, SwitchoverOutcome::Promoted);
    assert!(report.verified, "warnings: {:?}", report.warnings);
    assert_eq!(report.moved_replicas, vec!["db1003", "db1004", "db1005"]);
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(true));
    assert_eq!(fleet.read_only("db1002.eqiad.wmnet:3306"), Some(false));

    assert_eq!(replica.slave_status().unwrap(), None);
    assert!(master.is_direct_replica_of(replica.address()));
    let new_master_coordinate = report.new_master_coordinate.clone().unwrap();
    assert!(fleet.statements("db1001.eqiad.wmnet:3306").iter().any(|s| s.contains(&format!(
        "MASTER_LOG_FILE = '{}', MASTER_LOG_POS = {}", new_master_coordinate.log_file, new_master_coordinate.log_pos,
    ))));
    for host in ["db1003.eqiad.wmnet", "db1004.eqiad.wmnet", "db1005.eqiad.wmnet"] {
        let mut moved = open(&fleet, host);
        assert!(moved.is_direct_replica_of(replica.address()), "{} not moved", host);
        assert!(moved.slave_status().unwrap().unwrap().is_running(SlaveThread::Both));
    }

    assert!(fleet.processes("db1001.eqiad.wmnet").is_empty());
    assert_eq!(fleet.processes("db1002.eqiad.wmnet").len(), 1);
    assert_eq!(report.heartbeat, Some(heartbeat()));

    let old_master = fleet.server("db1001.eqiad.wmnet:3306").unwrap();
    assert!(old_master.semisync_slave && !old_master.semisync_master);
    let new_master = fleet.server("db1002.eqiad.wmnet:3306").unwrap();
    assert!(new_master.semisync_master && !new_master.semisync_slave);
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
}

#[test]
fn integration_only_slave_move_leaves_the_master_alone() {
    let fleet = section();
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");
    let options = SwitchoverOptions { only_slave_move: true, ..options() };

    let report = switchover(&mut master, &mut replica, &fleet.runner(), &options, &mut || -> bool { panic!("not asked") }).unwrap();

    assert_eq!(report.outcome, SwitchoverOutcome::OnlyReplicasMoved);
    assert_eq!(report.moved_replicas.len(), 3);
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(false));
    assert!(fleet.mutating_statements("db1001.eqiad.wmnet:3306").is_empty());
    assert!(replica.is_direct_replica_of(master.address()));
}

#[test]
fn integration_not_confirmed_stops_before_the_master() {
    let fleet = section();
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");
    let options = SwitchoverOptions { skip_slave_move: true, ..options() };

    let report = switchover(&mut master, &mut replica, &fleet.runner(), &options, &mut || false).unwrap();

    assert_eq!(report.outcome, SwitchoverOutcome::NotConfirmed);
    assert!(report.moved_replicas.is_empty());
    assert!(fleet.mutating_statements("db1001.eqiad.wmnet:3306").is_empty());
    let mut sibling = open(&fleet, "db1003.eqiad.wmnet");
    assert!(sibling.is_direct_replica_of(master.address()));
}

#[test]
fn integration_replicating_master_hands_over_its_upstream() {
    let fleet = SimFleet::new();
    fleet.add_server(SimServer::new("db2001.codfw.wmnet", 3306).writable().write_rate(100));
    fleet.add_server(SimServer::new("db1001.eqiad.wmnet", 3306).replica_of("db2001.codfw.wmnet", 3306));
    fleet.add_server(SimServer::new("db1002.eqiad.wmnet", 3306).replica_of("db1001.eqiad.wmnet", 3306));
    let mut master = open(&fleet, "db1001.eqiad.wmnet");
    let mut replica = open(&fleet, "db1002.eqiad.wmnet");
    let options = SwitchoverOptions { replicating_master: true, read_only_master: true, ..options() };

    let report = switchover(&mut master, &mut replica, &fleet.runner(), &options, &mut || true).unwrap();

    assert!(report.verified, "warnings: {:?}", report.warnings);
    assert_eq!(fleet.read_only("db1001.eqiad.wmnet:3306"), Some(true));
    assert_eq!(fleet.read_only("db1002.eqiad.wmnet:3306"), Some(true));
    let upstream = report.upstream.clone().unwrap();
    assert_eq!(upstream.master.host, "db2001.codfw.wmnet");
    assert!(upstream.io_running && upstream.sql_running);
    assert!(master.is_direct_replica_of(replica.address()));
    let status = replica.slave_status().unwrap().unwrap();
    assert_eq!(status.master_host, "db2001.codfw.wmnet");
    assert!(status.is_running(SlaveThread::Both));
}
