//! The impls and functions
//!
use std::{sync::{atomic::Ordering, Arc, MutexGuard, PoisonError}, time::Duration};
use log::*;
use regex::{Captures, Regex};
use crate::{ReplicationError, Result};
use crate::clock::Clock;
use crate::instance::{parse_version, Connector, Credentials, DatabaseInstance, InstanceAddress, QueryError, QueryResult, Resolver, SqlConnection, Vendor};
use crate::remote::{CommandReturn, RemoteProcessRunner};
use crate::replication::{Coordinate, GtidMode, ReplicationContext, ThreadState};
use crate::simulation::{FleetState, SimClock, SimConnection, SimFleet, SimReplica, SimRunner, SimServer};

/// Statement prefixes that change server state.
const MUTATING: [&str; 7] = ["START SLAVE", "STOP SLAVE", "CHANGE MASTER", "RESET SLAVE", "SET GLOBAL", "INSTALL PLUGIN", "UNINSTALL PLUGIN"];

const PS_PERL: &str = "/bin/ps --no-headers -o pid,args -C perl";

impl SimServer {
    /// A read only server with binary logging enabled and no replica configuration.
    pub fn new(host: &str, port: u16) -> Self {
        let short = host.split('.').next().unwrap_or(host);
        SimServer {
            host: host.to_string(),
            port,
            server_id: 0,
            read_only: true,
            log_bin: true,
            binlog: Coordinate::new(&format!("{}-bin.000001", short), 4),
            binlog_format: "ROW".to_string(),
            version: "10.4.22-MariaDB-log".to_string(),
            socket: "/run/mysqld/mysqld.sock".to_string(),
            uptime: 86400,
            processes: 12,
            write_rate: 0,
            semisync_master: false,
            semisync_slave: false,
            plugins: Default::default(),
            heartbeat: None,
            replica: None,
            reachable: true,
        }
    }
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }
    /// Replicating from `host:port` with both threads running, at the master's binlog end
    /// when the master is added first.
    pub fn replica_of(mut self, host: &str, port: u16) -> Self {
        self.replica = Some(SimReplica::new(host, port));
        self
    }
    pub fn binlog(mut self, file: &str, position: u64) -> Self {
        self.binlog = Coordinate::new(file, position);
        self
    }
    pub fn without_binlog(mut self) -> Self {
        self.log_bin = false;
        self
    }
    pub fn executed(mut self, file: &str, position: u64) -> Self {
        if let Some(replica) = self.replica.as_mut() {
            replica.executed = Coordinate::new(file, position);
        }
        self
    }
    pub fn stopped(mut self) -> Self {
        if let Some(replica) = self.replica.as_mut() {
            replica.io_thread = ThreadState::No;
            replica.sql_thread = ThreadState::No;
        }
        self
    }
    pub fn sql_stopped(mut self) -> Self {
        if let Some(replica) = self.replica.as_mut() {
            replica.sql_thread = ThreadState::No;
        }
        self
    }
    pub fn lag(mut self, lag: u64) -> Self {
        if let Some(replica) = self.replica.as_mut() {
            replica.lag = lag;
        }
        self
    }
    pub fn gtid_mode(mut self, mode: GtidMode) -> Self {
        if let Some(replica) = self.replica.as_mut() {
            replica.gtid_mode = mode;
        }
        self
    }
    pub fn binlog_format(mut self, format: &str) -> Self {
        self.binlog_format = format.to_string();
        self
    }
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }
    pub fn write_rate(mut self, bytes_per_second: u64) -> Self {
        self.write_rate = bytes_per_second;
        self
    }
    pub fn heartbeat_row(mut self, shard: &str, datacenter: &str) -> Self {
        self.heartbeat = Some((shard.to_string(), datacenter.to_string()));
        self
    }
    pub fn semisync(mut self, master: bool, slave: bool) -> Self {
        self.semisync_master = master;
        self.semisync_slave = slave;
        self
    }
    pub fn plugin(mut self, name: &str) -> Self {
        self.plugins.insert(name.to_string());
        self
    }
    fn has_builtin_semisync(&self) -> bool {
        matches!(parse_version(&self.version), Some(version) if version >= (10, 3, 0))
    }
}

impl SimReplica {
    pub fn new(master_host: &str, master_port: u16) -> Self {
        SimReplica {
            master_host: master_host.to_string(),
            master_port,
            io_thread: ThreadState::Yes,
            sql_thread: ThreadState::Yes,
            executed: Coordinate::new("", 0),
            until: None,
            gtid_mode: GtidMode::No,
            lag: 0,
            stalled: false,
            io_failure: None,
            last_io_error: String::new(),
            last_sql_error: String::new(),
        }
    }
    pub fn master_key(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }
}

impl SimFleet {
    pub fn new() -> Self {
        Default::default()
    }
    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Add a server. A replica without an executed coordinate starts at its master's binlog end.
    pub fn add_server(&self, mut server: SimServer) {
        let mut state = self.lock();
        if server.server_id == 0 {
            state.next_server_id += 1;
            server.server_id = 170_000 + state.next_server_id;
        }
        if let Some(replica) = server.replica.as_mut() {
            if replica.executed.log_file.is_empty() {
                if let Some(master) = state.servers.get(&replica.master_key()) {
                    replica.executed = master.binlog.clone();
                }
            }
        }
        state.servers.insert(server.key(), server);
        settle(&mut state);
    }
    /// A context for this fleet: virtual clock, no domain rules, `repl` credentials.
    pub fn context(&self, timeout: Duration) -> ReplicationContext {
        ReplicationContext::new(
            timeout,
            Arc::new(self.clock()),
            Arc::new(self.clone()),
            Resolver::new(),
            Credentials { user: "repl".to_string(), password: "replpass".to_string() },
        )
    }
    pub fn clock(&self) -> SimClock {
        SimClock { fleet: self.clone() }
    }
    pub fn runner(&self) -> SimRunner {
        SimRunner { fleet: self.clone() }
    }
    /// Virtual time elapsed.
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
    fn advance(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
        let mut state = self.lock();
        for server in state.servers.values_mut() {
            if server.reachable && !server.read_only && server.write_rate > 0 {
                server.binlog.log_pos += server.write_rate * ms / 1000;
            }
        }
        settle(&mut state);
    }
    fn update<F>(&self, key: &str, change: F)
    where
        F: FnOnce(&mut SimServer),
    {
        let mut state = self.lock();
        match state.servers.get_mut(key) {
            Some(server) => change(server),
            None => warn!("simulation: no server {}", key),
        }
        settle(&mut state);
    }
    fn update_replica<F>(&self, key: &str, change: F)
    where
        F: FnOnce(&mut SimReplica),
    {
        self.update(key, |server| {
            if let Some(replica) = server.replica.as_mut() {
                change(replica);
            }
        });
    }
    /// Write `bytes` to the binary log of `key`, regardless of read_only.
    pub fn write(&self, key: &str, bytes: u64) {
        self.update(key, |server| server.binlog.log_pos += bytes);
    }
    pub fn set_write_rate(&self, key: &str, bytes_per_second: u64) {
        self.update(key, |server| server.write_rate = bytes_per_second);
    }
    pub fn set_lag(&self, key: &str, lag: u64) {
        self.update_replica(key, |replica| replica.lag = lag);
    }
    pub fn stall(&self, key: &str, stalled: bool) {
        self.update_replica(key, |replica| replica.stalled = stalled);
    }
    /// The IO thread of `key` fails to connect with `error` from now on.
    pub fn break_io_thread(&self, key: &str, error: &str) {
        self.update_replica(key, |replica| {
            replica.io_failure = Some(error.to_string());
            if !replica.io_thread.is_stopped() {
                replica.io_thread = ThreadState::Connecting;
                replica.last_io_error = error.to_string();
            }
        });
    }
    pub fn set_reachable(&self, key: &str, reachable: bool) {
        self.update(key, |server| server.reachable = reachable);
    }
    /// Statements on `key` starting with `prefix` fail from now on.
    pub fn fail_statements(&self, key: &str, prefix: &str) {
        self.lock().failing.push((key.to_string(), prefix.to_string()));
    }
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }
    pub fn statements(&self, key: &str) -> Vec<String> {
        self.lock().statements.get(key).cloned().unwrap_or_default()
    }
    /// The received statements that change server state.
    pub fn mutating_statements(&self, key: &str) -> Vec<String> {
        self.statements(key).into_iter()
            .filter(|s| MUTATING.iter().any(|m| s.starts_with(m)))
            .collect()
    }
    /// A copy of the current state of `key`.
    pub fn server(&self, key: &str) -> Option<SimServer> {
        self.lock().servers.get(key).cloned()
    }
    pub fn read_only(&self, key: &str) -> Option<bool> {
        self.server(key).map(|s| s.read_only)
    }
    /// Start a process on `host`, returning its pid.
    pub fn add_process(&self, host: &str, command_line: &str) -> u32 {
        let mut state = self.lock();
        start_process(&mut state, host, command_line)
    }
    pub fn processes(&self, host: &str) -> Vec<(u32, String)> {
        self.lock().processes.get(host).cloned().unwrap_or_default()
    }
    /// The remote commands received for `host`.
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.lock().commands.get(host).cloned().unwrap_or_default()
    }
    fn execute(
        &self,
        key: &str,
        command: &str,
    ) -> std::result::Result<QueryResult, QueryError>
    {
        let mut state = self.lock();
        state.statements.entry(key.to_string()).or_default().push(command.to_string());
        if !state.servers.get(key).map(|s| s.reachable).unwrap_or(false) {
            return Err(query_error(2013, "Lost connection to MySQL server during query"));
        }
        if state.failing.iter().any(|(k, prefix)| k == key && command.starts_with(prefix.as_str())) {
            return Err(query_error(1105, "simulated failure"));
        }
        settle(&mut state);
        let result = interpret(&mut state, key, command);
        settle(&mut state);
        result
    }
}

impl Connector for SimFleet {
    fn connect(
        &self,
        address: &InstanceAddress,
    ) -> Result<DatabaseInstance>
    {
        let key = address.to_string();
        let reachable = self.lock().servers.get(&key).map(|s| s.reachable).unwrap_or(false);
        if !reachable {
            return Err(ReplicationError::QueryFailed {
                instance: address.name(),
                query: "connect".to_string(),
                errno: 2003,
                errmsg: format!("Can't connect to MySQL server on '{}'", key),
            });
        }
        Ok(DatabaseInstance::new(address.clone(), Vendor::MariaDB, Box::new(SimConnection { fleet: self.clone(), key })))
    }
}

impl SqlConnection for SimConnection {
    fn execute(&mut self, command: &str) -> std::result::Result<QueryResult, QueryError> {
        self.fleet.execute(&self.key, command)
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.fleet.now()
    }
    fn sleep(&self, duration: Duration) {
        self.fleet.advance(duration);
    }
}

impl RemoteProcessRunner for SimRunner {
    fn run(
        &self,
        host: &str,
        command: &str,
    ) -> Result<CommandReturn>
    {
        let mut state = self.fleet.lock();
        state.commands.entry(host.to_string()).or_default().push(command.to_string());
        if !state.servers.values().any(|s| s.host == host && s.reachable) {
            return Ok(CommandReturn { returncode: 255, stdout: None, stderr: Some(format!("ssh: Could not resolve hostname {}", host)) });
        }
        if command == PS_PERL {
            let lines: Vec<String> = state.processes.get(host).map(|p| p.iter().map(|(pid, args)| format!("{:>7} {}", pid, args)).collect()).unwrap_or_default();
            return Ok(if lines.is_empty() {
                CommandReturn { returncode: 1, stdout: None, stderr: None }
            } else {
                CommandReturn { returncode: 0, stdout: Some(lines.join("\n") + "\n"), stderr: None }
            });
        }
        if let Some(captures) = captures(r"^/bin/kill (\d+)$", command) {
            let pid: u32 = captures[1].parse().unwrap_or(0);
            let processes = state.processes.entry(host.to_string()).or_default();
            let before = processes.len();
            processes.retain(|(p, _)| *p != pid);
            return Ok(if processes.len() < before {
                CommandReturn { returncode: 0, stdout: None, stderr: None }
            } else {
                CommandReturn { returncode: 1, stdout: None, stderr: Some(format!("kill: ({}) - No such process", pid)) }
            });
        }
        if let Some(captures) = captures(r"^/usr/bin/nohup (.+) &> /dev/null &$", command) {
            start_process(&mut state, host, &captures[1]);
            return Ok(CommandReturn { returncode: 0, stdout: None, stderr: None });
        }
        Ok(CommandReturn { returncode: 127, stdout: None, stderr: Some("command not found".to_string()) })
    }
}

fn start_process(state: &mut FleetState, host: &str, command_line: &str) -> u32 {
    state.next_pid += 1;
    let pid = 4000 + state.next_pid;
    state.processes.entry(host.to_string()).or_default().push((pid, command_line.to_string()));
    pid
}

/// Propagate binary log events along every running replication channel until nothing moves.
fn settle(state: &mut FleetState) {
    for _ in 0..32 {
        let mut changed = false;
        let keys: Vec<String> = state.servers.keys().cloned().collect();
        for key in keys {
            let master_key = match state.servers.get(&key).and_then(|s| s.replica.as_ref()) {
                Some(replica) => replica.master_key(),
                None => continue,
            };
            let master_binlog = match state.servers.get(&master_key) {
                Some(master) if master.reachable && master.log_bin => Some(master.binlog.clone()),
                _ => None,
            };
            let server = match state.servers.get_mut(&key) {
                Some(server) => server,
                None => continue,
            };
            let mut applied = 0;
            if let Some(replica) = server.replica.as_mut() {
                match (&master_binlog, replica.io_thread) {
                    (None, ThreadState::Yes) => {
                        replica.io_thread = ThreadState::Connecting;
                        replica.last_io_error = format!("error reconnecting to master 'repl@{}'", master_key);
                        changed = true;
                    }
                    (Some(_), ThreadState::Connecting) if replica.io_failure.is_none() => {
                        replica.io_thread = ThreadState::Yes;
                        replica.last_io_error.clear();
                        changed = true;
                    }
                    _ => {}
                }
                if replica.sql_thread.is_running() && replica.io_thread.is_running() && !replica.stalled {
                    if let Some(binlog) = &master_binlog {
                        if binlog.log_file == replica.executed.log_file && binlog.log_pos > replica.executed.log_pos {
                            let mut target = binlog.log_pos;
                            if let Some(until) = &replica.until {
                                if until.log_file == replica.executed.log_file {
                                    target = target.min(until.log_pos.max(replica.executed.log_pos));
                                }
                            }
                            applied = target - replica.executed.log_pos;
                            replica.executed.log_pos = target;
                        }
                    }
                }
                if replica.sql_thread.is_running() {
                    if let Some(until) = &replica.until {
                        if replica.executed >= *until {
                            replica.sql_thread = ThreadState::No;
                            replica.until = None;
                            changed = true;
                        }
                    }
                }
            }
            if applied > 0 {
                changed = true;
                if server.log_bin {
                    server.binlog.log_pos += applied;
                }
            }
        }
        if !changed {
            return;
        }
    }
}

fn captures<'a>(pattern: &str, command: &'a str) -> Option<Captures<'a>> {
    Regex::new(pattern).unwrap().captures(command)
}

fn query_error(errno: i64, errmsg: &str) -> QueryError {
    QueryError { errno, errmsg: errmsg.to_string() }
}

fn rows(fields: &[&str], rows: Vec<Vec<Option<String>>>) -> QueryResult {
    QueryResult {
        fields: fields.iter().map(|f| f.to_string()).collect(),
        numrows: rows.len() as u64,
        rows,
    }
}

fn single(field: &str, value: String) -> QueryResult {
    rows(&[field], vec![vec![Some(value)]])
}

fn flag(value: bool) -> String {
    if value { "1".to_string() } else { "0".to_string() }
}

fn not_configured() -> QueryError {
    query_error(1200, "Misconfigured slave: MASTER_HOST was not set; Fix in config file or with CHANGE MASTER TO")
}

fn running_slave() -> QueryError {
    query_error(1198, "This operation cannot be performed as you have a running slave; run STOP SLAVE first")
}

/// Run one statement against the server `key`.
fn interpret(
    state: &mut FleetState,
    key: &str,
    command: &str,
) -> std::result::Result<QueryResult, QueryError>
{
    let replicas: Vec<(u32, String, u16, bool, bool)> = state.servers.values()
        .filter_map(|s| s.replica.as_ref().filter(|r| r.master_key() == key).map(|r| (s.server_id, s.host.clone(), s.port, r.io_thread.is_running(), s.semisync_slave)))
        .collect();
    let server = state.servers.get_mut(key)
        .ok_or_else(|| query_error(2013, "Lost connection to MySQL server during query"))?;

    if command.starts_with("SET SESSION max_statement_time") || command.starts_with("SET SESSION max_execution_time") {
        return Ok(QueryResult::default());
    }
    if command == "SHOW SLAVE STATUS" {
        let fields = ["Slave_IO_State", "Master_Host", "Master_User", "Master_Port", "Relay_Master_Log_File", "Slave_IO_Running", "Slave_SQL_Running", "Exec_Master_Log_Pos", "Last_IO_Error", "Last_SQL_Error", "Seconds_Behind_Master", "Using_Gtid"];
        return Ok(match &server.replica {
            None => rows(&fields, Vec::new()),
            Some(replica) => {
                let both = replica.io_thread.is_running() && replica.sql_thread.is_running();
                let gtid = match replica.gtid_mode {
                    GtidMode::No => "No",
                    GtidMode::SlavePos => "Slave_Pos",
                    GtidMode::CurrentPos => "Current_Pos",
                };
                rows(&fields, vec![vec![
                    Some(if replica.io_thread.is_running() { "Waiting for master to send event".to_string() } else { String::new() }),
                    Some(replica.master_host.clone()),
                    Some("repl".to_string()),
                    Some(replica.master_port.to_string()),
                    Some(replica.executed.log_file.clone()),
                    Some(replica.io_thread.to_string()),
                    Some(replica.sql_thread.to_string()),
                    Some(replica.executed.log_pos.to_string()),
                    Some(replica.last_io_error.clone()),
                    Some(replica.last_sql_error.clone()),
                    if both { Some(replica.lag.to_string()) } else { None },
                    Some(gtid.to_string()),
                ]])
            }
        });
    }
    if command == "SHOW MASTER STATUS" {
        let fields = ["File", "Position", "Binlog_Do_DB", "Binlog_Ignore_DB"];
        return Ok(if server.log_bin {
            rows(&fields, vec![vec![Some(server.binlog.log_file.clone()), Some(server.binlog.log_pos.to_string()), Some(String::new()), Some(String::new())]])
        } else {
            rows(&fields, Vec::new())
        });
    }
    if command == "SHOW SLAVE HOSTS" {
        let server_id = server.server_id.to_string();
        let connected = replicas.iter()
            .filter(|(_, _, _, io_running, _)| *io_running)
            .map(|(id, host, port, _, _)| vec![Some(id.to_string()), Some(host.clone()), Some(port.to_string()), Some(server_id.clone())])
            .collect();
        return Ok(rows(&["Server_id", "Host", "Port", "Master_id"], connected));
    }
    if let Some(c) = captures(r"^START SLAVE(?: (IO_THREAD|SQL_THREAD))?(?: UNTIL MASTER_LOG_FILE = '([^']*)', MASTER_LOG_POS = (\d+))?$", command) {
        let replica = server.replica.as_mut().ok_or_else(not_configured)?;
        let thread = c.get(1).map(|m| m.as_str());
        if thread != Some("SQL_THREAD") {
            match &replica.io_failure {
                Some(error) => {
                    replica.io_thread = ThreadState::Connecting;
                    replica.last_io_error = error.clone();
                }
                None => {
                    replica.io_thread = ThreadState::Yes;
                    replica.last_io_error.clear();
                }
            }
        }
        if thread != Some("IO_THREAD") {
            replica.sql_thread = ThreadState::Yes;
            replica.last_sql_error.clear();
            replica.until = match (c.get(2), c.get(3)) {
                (Some(file), Some(position)) => Some(Coordinate::new(file.as_str(), position.as_str().parse().unwrap_or(0))),
                _ => None,
            };
        }
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^STOP SLAVE(?: (IO_THREAD|SQL_THREAD))?$", command) {
        let replica = server.replica.as_mut().ok_or_else(not_configured)?;
        let thread = c.get(1).map(|m| m.as_str());
        if thread != Some("SQL_THREAD") {
            replica.io_thread = ThreadState::No;
        }
        if thread != Some("IO_THREAD") {
            replica.sql_thread = ThreadState::No;
            replica.until = None;
        }
        return Ok(QueryResult::default());
    }
    if command == "RESET SLAVE ALL" {
        if let Some(replica) = &server.replica {
            if !replica.io_thread.is_stopped() || !replica.sql_thread.is_stopped() {
                return Err(running_slave());
            }
        }
        server.replica = None;
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^CHANGE MASTER TO MASTER_USE_GTID = (\w+)$", command) {
        let mode = GtidMode::parse(&c[1]).ok_or_else(|| query_error(1064, "You have an error in your SQL syntax"))?;
        let replica = server.replica.as_mut().ok_or_else(not_configured)?;
        if !replica.io_thread.is_stopped() || !replica.sql_thread.is_stopped() {
            return Err(running_slave());
        }
        replica.gtid_mode = mode;
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^CHANGE MASTER TO MASTER_HOST = '([^']*)', MASTER_PORT = (\d+), MASTER_USER = '(?:[^'\\]|\\.)*', MASTER_PASSWORD = '(?:[^'\\]|\\.)*', MASTER_LOG_FILE = '([^']*)', MASTER_LOG_POS = (\d+), MASTER_SSL = 1$", command) {
        if let Some(replica) = &server.replica {
            if !replica.io_thread.is_stopped() || !replica.sql_thread.is_stopped() {
                return Err(running_slave());
            }
        }
        let port = c[2].parse().map_err(|_| query_error(1064, "invalid port"))?;
        let mut replica = SimReplica::new(&c[1], port);
        replica.io_thread = ThreadState::No;
        replica.sql_thread = ThreadState::No;
        replica.executed = Coordinate::new(&c[3], c[4].parse().unwrap_or(0));
        server.replica = Some(replica);
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^SELECT @@GLOBAL\.(\w+)$", command) {
        let value = match &c[1] {
            "read_only" => flag(server.read_only),
            "version" => server.version.clone(),
            "binlog_format" => server.binlog_format.clone(),
            "socket" => server.socket.clone(),
            "log_bin" => flag(server.log_bin),
            "hostname" => server.host.clone(),
            "server_id" => server.server_id.to_string(),
            other => return Err(query_error(1193, &format!("Unknown system variable '{}'", other))),
        };
        return Ok(single(&format!("@@GLOBAL.{}", &c[1]), value));
    }
    if let Some(c) = captures(r"^SET GLOBAL read_only = ([01])$", command) {
        server.read_only = &c[1] == "1";
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^SET GLOBAL rpl_semi_sync_(master|slave)_enabled = ([01])$", command) {
        let plugin = format!("rpl_semi_sync_{}", &c[1]);
        if !server.has_builtin_semisync() && !server.plugins.contains(&plugin) {
            return Err(query_error(1193, &format!("Unknown system variable '{}_enabled'", plugin)));
        }
        let enabled = &c[2] == "1";
        if &c[1] == "master" {
            server.semisync_master = enabled;
        } else {
            server.semisync_slave = enabled;
        }
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^UNINSTALL PLUGIN (\w+)$", command) {
        if !server.plugins.remove(&c[1]) {
            return Err(query_error(1305, &format!("PLUGIN {} does not exist", &c[1])));
        }
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"^INSTALL PLUGIN (\w+) SONAME '[^']+'$", command) {
        if !server.plugins.insert(c[1].to_string()) {
            return Err(query_error(1968, &format!("Plugin '{}' already installed", &c[1])));
        }
        return Ok(QueryResult::default());
    }
    if let Some(c) = captures(r"(?i)^SHOW GLOBAL STATUS LIKE '(\w+)'$", command) {
        let fields = ["Variable_name", "Value"];
        let value = match c[1].to_lowercase().as_str() {
            "uptime" => Some(server.uptime),
            "rpl_semi_sync_master_clients" => Some(if server.semisync_master {
                replicas.iter().filter(|(_, _, _, io_running, semisync)| *io_running && *semisync).count() as u64
            } else {
                0
            }),
            _ => None,
        };
        return Ok(match value {
            Some(value) => rows(&fields, vec![vec![Some(c[1].to_string()), Some(value.to_string())]]),
            None => rows(&fields, Vec::new()),
        });
    }
    if command == "SELECT COUNT(*) FROM information_schema.processlist" {
        return Ok(single("COUNT(*)", server.processes.to_string()));
    }
    if command == "SELECT shard, datacenter FROM heartbeat.heartbeat ORDER BY ts DESC LIMIT 1" {
        return match &server.heartbeat {
            Some((shard, datacenter)) => Ok(rows(&["shard", "datacenter"], vec![vec![Some(shard.clone()), Some(datacenter.clone())]])),
            None => Err(query_error(1146, "Table 'heartbeat.heartbeat' doesn't exist")),
        };
    }
    Err(query_error(1064, &format!("You have an error in your SQL syntax near '{}'", command)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> SimFleet {
        let fleet = SimFleet::new();
        fleet.add_server(SimServer::new("db1001.test", 3306).writable().write_rate(100));
        fleet.add_server(SimServer::new("db1002.test", 3306).replica_of("db1001.test", 3306));
        fleet.add_server(SimServer::new("db1003.test", 3306).replica_of("db1002.test", 3306));
        fleet
    }

    #[test]
    fn unit_replicas_start_at_the_master_binlog_end() {
        let fleet = fleet();
        let replica = fleet.server("db1002.test:3306").unwrap();
        assert_eq!(replica.replica.unwrap().executed, Coordinate::new("db1001-bin.000001", 4));
    }

    #[test]
    fn unit_time_drives_writes_through_the_chain() {
        let fleet = fleet();
        fleet.clock().sleep(Duration::from_secs(2));
        assert_eq!(fleet.now(), Duration::from_secs(2));
        let master = fleet.server("db1001.test:3306").unwrap();
        let intermediate = fleet.server("db1002.test:3306").unwrap();
        let leaf = fleet.server("db1003.test:3306").unwrap();
        assert_eq!(master.binlog.log_pos, 204);
        assert_eq!(intermediate.replica.unwrap().executed, master.binlog);
        assert_eq!(leaf.replica.unwrap().executed, intermediate.binlog);
    }

    #[test]
    fn unit_read_only_servers_do_not_write() {
        let fleet = fleet();
        fleet.update("db1001.test:3306", |s| s.read_only = true);
        fleet.clock().sleep(Duration::from_secs(2));
        assert_eq!(fleet.server("db1001.test:3306").unwrap().binlog.log_pos, 4);
    }

    #[test]
    fn unit_until_stops_the_sql_thread() {
        let fleet = fleet();
        fleet.stall("db1002.test:3306", true);
        fleet.write("db1001.test:3306", 100);
        let mut connection = SimConnection { fleet: fleet.clone(), key: "db1002.test:3306".to_string() };
        connection.execute("STOP SLAVE SQL_THREAD").unwrap();
        fleet.stall("db1002.test:3306", false);
        connection.execute("START SLAVE SQL_THREAD UNTIL MASTER_LOG_FILE = 'db1001-bin.000001', MASTER_LOG_POS = 54").unwrap();
        let replica = fleet.server("db1002.test:3306").unwrap().replica.unwrap();
        assert_eq!(replica.executed.log_pos, 54);
        assert!(replica.sql_thread.is_stopped());
    }

    #[test]
    fn unit_statements_are_recorded_and_can_fail() {
        let fleet = fleet();
        let mut connection = SimConnection { fleet: fleet.clone(), key: "db1001.test:3306".to_string() };
        assert_eq!(connection.execute("SELECT @@GLOBAL.read_only").unwrap().first_value(), Some("0"));
        connection.execute("SET GLOBAL read_only = 1").unwrap();
        fleet.fail_statements("db1001.test:3306", "SET GLOBAL");
        assert_eq!(connection.execute("SET GLOBAL read_only = 0").unwrap_err().errno, 1105);
        assert_eq!(fleet.read_only("db1001.test:3306"), Some(true));
        assert_eq!(fleet.mutating_statements("db1001.test:3306").len(), 2);
        assert_eq!(connection.execute("SELECT nonsense").unwrap_err().errno, 1064);
    }

    #[test]
    fn unit_reset_requires_stopped_threads() {
        let fleet = fleet();
        let mut connection = SimConnection { fleet: fleet.clone(), key: "db1002.test:3306".to_string() };
        assert_eq!(connection.execute("RESET SLAVE ALL").unwrap_err().errno, 1198);
        connection.execute("STOP SLAVE").unwrap();
        connection.execute("RESET SLAVE ALL").unwrap();
        assert!(connection.execute("SHOW SLAVE STATUS").unwrap().rows.is_empty());
    }

    #[test]
    fn unit_unreachable_servers_refuse_connections() {
        let fleet = fleet();
        fleet.set_reachable("db1001.test:3306", false);
        assert!(fleet.connect(&InstanceAddress::new("db1001.test", 3306)).is_err());
        assert!(fleet.connect(&InstanceAddress::new("db9999.test", 3306)).is_err());
        let replica = fleet.server("db1002.test:3306").unwrap().replica.unwrap();
        assert_eq!(replica.io_thread, ThreadState::Connecting);
    }

    #[test]
    fn unit_runner_manages_processes() {
        let fleet = fleet();
        let runner = fleet.runner();
        assert_eq!(runner.run("db1001.test", PS_PERL).unwrap().returncode, 1);
        runner.run("db1001.test", "/usr/bin/nohup /usr/bin/perl heartbeat &> /dev/null &").unwrap();
        let processes = fleet.processes("db1001.test");
        assert_eq!(processes.len(), 1);
        let listed = runner.run("db1001.test", PS_PERL).unwrap();
        assert!(listed.stdout.unwrap().contains(&format!("{} /usr/bin/perl heartbeat", processes[0].0)));
        assert_eq!(runner.run("db1001.test", &format!("/bin/kill {}", processes[0].0)).unwrap().returncode, 0);
        assert_eq!(runner.run("db1001.test", &format!("/bin/kill {}", processes[0].0)).unwrap().returncode, 1);
        assert_eq!(runner.run("db9999.test", PS_PERL).unwrap().returncode, 255);
    }
}
