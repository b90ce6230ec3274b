//! The impls and functions
//!
use std::{fmt, net::Ipv4Addr, sync::{mpsc::channel, Arc}, time::{Duration, Instant}};
use chrono::Local;
use log::*;
use crate::{ReplicationError, Result};
use crate::clock::{Clock, POLL_INTERVAL};
use crate::instance::{Connector, Credentials, DatabaseInstance, InstanceAddress, QueryResult, Resolver, DEFAULT_PORT};
use crate::replication::{Coordinate, GtidMode, MasterStatus, ReplicationContext, ReplicationController, ReplicationStatus, SlaveThread, ThreadState};

impl Coordinate {
    pub fn new(log_file: &str, log_pos: u64) -> Self {
        Coordinate { log_file: log_file.to_string(), log_pos }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

impl ThreadState {
    /// `Yes` and `No` map directly; anything else (`Connecting`, `Preparing`) is a thread
    /// that is neither running nor stopped.
    pub fn parse(value: &str) -> Self {
        match value {
            "Yes" => ThreadState::Yes,
            "No" => ThreadState::No,
            _ => ThreadState::Connecting,
        }
    }
    pub fn is_running(self) -> bool {
        self == ThreadState::Yes
    }
    pub fn is_stopped(self) -> bool {
        self == ThreadState::No
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Yes => write!(f, "Yes"),
            ThreadState::No => write!(f, "No"),
            ThreadState::Connecting => write!(f, "Connecting"),
        }
    }
}

impl SlaveThread {
    fn keyword(self) -> Option<&'static str> {
        match self {
            SlaveThread::Both => None,
            SlaveThread::Io => Some("IO_THREAD"),
            SlaveThread::Sql => Some("SQL_THREAD"),
        }
    }
}

impl fmt::Display for SlaveThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaveThread::Both => write!(f, "IO and SQL threads"),
            SlaveThread::Io => write!(f, "IO thread"),
            SlaveThread::Sql => write!(f, "SQL thread"),
        }
    }
}

impl GtidMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "no" => Some(GtidMode::No),
            "slave_pos" => Some(GtidMode::SlavePos),
            "current_pos" => Some(GtidMode::CurrentPos),
            _ => None,
        }
    }
    pub fn as_sql(self) -> &'static str {
        match self {
            GtidMode::No => "no",
            GtidMode::SlavePos => "slave_pos",
            GtidMode::CurrentPos => "current_pos",
        }
    }
}

impl fmt::Display for GtidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

impl ReplicationStatus {
    /// Parse `SHOW SLAVE STATUS`. No rows means the instance is not a replica.
    pub fn from_query_result(
        result: &QueryResult,
        instance: &str,
    ) -> Result<Option<Self>>
    {
        let row = match result.row_map(0) {
            Some(row) => row,
            None => return Ok(None),
        };
        let malformed = |field: &str| ReplicationError::QueryFailed {
            instance: instance.to_string(),
            query: "SHOW SLAVE STATUS".to_string(),
            errno: -1,
            errmsg: format!("missing or invalid field: {}", field),
        };
        let text = |field: &str| row.get(field).cloned().flatten();
        let required = |field: &str| text(field).ok_or_else(|| malformed(field));

        Ok(Some(ReplicationStatus {
            timestamp: Local::now(),
            io_thread: ThreadState::parse(&required("slave_io_running")?),
            sql_thread: ThreadState::parse(&required("slave_sql_running")?),
            master_host: required("master_host")?,
            master_port: required("master_port")?.parse().map_err(|_| malformed("master_port"))?,
            relay_master_log_file: required("relay_master_log_file")?,
            exec_master_log_pos: required("exec_master_log_pos")?.parse().map_err(|_| malformed("exec_master_log_pos"))?,
            seconds_behind_master: text("seconds_behind_master").and_then(|v| v.parse().ok()),
            last_io_error: text("last_io_error").unwrap_or_default(),
            last_sql_error: text("last_sql_error").unwrap_or_default(),
            // MySQL does not report Using_Gtid
            gtid_mode: text("using_gtid").and_then(|v| GtidMode::parse(&v)).unwrap_or(GtidMode::No),
        }))
    }
    /// The executed position in the master's binary log.
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(&self.relay_master_log_file, self.exec_master_log_pos)
    }
    pub fn master_address(
        &self,
        resolver: &Resolver,
    ) -> InstanceAddress
    {
        resolver.resolve_host_port(&self.master_host, self.master_port)
    }
    /// True if the thread(s) report `Yes`.
    pub fn is_running(
        &self,
        thread: SlaveThread,
    ) -> bool
    {
        match thread {
            SlaveThread::Both => self.io_thread.is_running() && self.sql_thread.is_running(),
            SlaveThread::Io => self.io_thread.is_running(),
            SlaveThread::Sql => self.sql_thread.is_running(),
        }
    }
    /// True if the thread(s) report `No`.
    pub fn is_stopped(
        &self,
        thread: SlaveThread,
    ) -> bool
    {
        match thread {
            SlaveThread::Both => self.io_thread.is_stopped() && self.sql_thread.is_stopped(),
            SlaveThread::Io => self.io_thread.is_stopped(),
            SlaveThread::Sql => self.sql_thread.is_stopped(),
        }
    }
    /// Lag strictly lower than `limit`. Unknown lag never qualifies.
    pub fn lag_below(
        &self,
        limit: Duration,
    ) -> bool
    {
        matches!(self.seconds_behind_master, Some(lag) if Duration::from_secs(lag) < limit)
    }
    fn errors(
        &self,
        thread: SlaveThread,
    ) -> String
    {
        let errors = match thread {
            SlaveThread::Both => format!("{}{}", self.last_io_error, self.last_sql_error),
            SlaveThread::Io => self.last_io_error.clone(),
            SlaveThread::Sql => self.last_sql_error.clone(),
        };
        if errors.is_empty() {
            format!("io: {}, sql: {}", self.io_thread, self.sql_thread)
        } else {
            errors
        }
    }
}

impl MasterStatus {
    /// Parse `SHOW MASTER STATUS`. No rows means binary logging is disabled.
    pub fn from_query_result(
        result: &QueryResult,
        instance: &str,
    ) -> Result<Option<Self>>
    {
        let row = match result.row_map(0) {
            Some(row) => row,
            None => return Ok(None),
        };
        let file = row.get("file").cloned().flatten();
        let position = row.get("position").cloned().flatten().and_then(|p| p.parse::<u64>().ok());
        match (file, position) {
            (Some(file), Some(position)) => Ok(Some(MasterStatus { file, position })),
            _ => Err(ReplicationError::QueryFailed {
                instance: instance.to_string(),
                query: "SHOW MASTER STATUS".to_string(),
                errno: -1,
                errmsg: "missing or invalid File/Position".to_string(),
            }),
        }
    }
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(&self.file, self.position)
    }
}

impl ReplicationContext {
    pub fn new(
        timeout: Duration,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn Connector>,
        resolver: Resolver,
        replication_credentials: Credentials,
    ) -> Self
    {
        ReplicationContext { timeout, clock, connector, resolver, replication_credentials }
    }
    /// Connect to `address` and wrap it in a controller sharing this context.
    pub fn open(
        &self,
        address: &InstanceAddress,
    ) -> Result<ReplicationController>
    {
        let instance = self.connector.connect(address)?;
        Ok(ReplicationController::new(instance, self.clone()))
    }
    /// Resolve a `host[:port]` name and connect to it.
    pub fn open_name(
        &self,
        name: &str,
    ) -> Result<ReplicationController>
    {
        let address = self.resolver.resolve(name)?;
        self.open(&address)
    }
    pub fn timeout_secs(&self) -> f64 {
        self.timeout.as_secs_f64()
    }
}

impl ReplicationController {
    pub fn new(
        instance: DatabaseInstance,
        context: ReplicationContext,
    ) -> Self
    {
        ReplicationController { instance, context }
    }
    pub fn name(&self) -> String {
        self.instance.name()
    }
    pub fn address(&self) -> &InstanceAddress {
        &self.instance.address
    }
    pub(crate) fn not_configured(&self) -> ReplicationError {
        ReplicationError::NotConfigured { instance: self.name() }
    }
    /// Run `SHOW SLAVE STATUS` with the configured timeout.
    /// `Ok(None)` means the instance is not a replica; a failed check is an error.
    pub fn slave_status(&mut self) -> Result<Option<ReplicationStatus>> {
        let timeout = self.context.timeout_secs();
        let result = self.instance.execute_with_timeout("SHOW SLAVE STATUS", timeout)?;
        ReplicationStatus::from_query_result(&result, &self.name())
    }
    /// Run `SHOW MASTER STATUS`. `Ok(None)` means binary logging is disabled.
    pub fn master_status(&mut self) -> Result<Option<MasterStatus>> {
        let result = self.instance.execute("SHOW MASTER STATUS")?;
        MasterStatus::from_query_result(&result, &self.name())
    }
    /// `Seconds_Behind_Master`; `None` if not a replica or the lag is unknown.
    pub fn lag(&mut self) -> Result<Option<u64>> {
        Ok(self.slave_status()?.and_then(|s| s.seconds_behind_master))
    }
    pub fn gtid_mode(&mut self) -> Result<Option<GtidMode>> {
        Ok(self.slave_status()?.map(|s| s.gtid_mode))
    }
    /// The configured master, resolved.
    pub fn master_address(&mut self) -> Result<Option<InstanceAddress>> {
        let resolver = self.context.resolver.clone();
        Ok(self.slave_status()?.map(|s| s.master_address(&resolver)))
    }
    /// Open a connection to the current master, if the instance is a replica.
    pub fn master(&mut self) -> Result<Option<ReplicationController>> {
        match self.master_address()? {
            Some(address) => Ok(Some(self.context.open(&address)?)),
            None => Ok(None),
        }
    }
    /// True only if it can be confirmed that this instance replicates directly from `master`.
    pub fn is_direct_replica_of(
        &mut self,
        master: &InstanceAddress,
    ) -> bool
    {
        matches!(self.master_address(), Ok(Some(address)) if address == *master)
    }
    /// True if both instances replicate directly from the same master, and are different instances.
    pub fn is_sibling_of(
        &mut self,
        sibling: &mut ReplicationController,
    ) -> bool
    {
        if self.address() == sibling.address() {
            return false;
        }
        match (self.master_address(), sibling.master_address()) {
            (Ok(Some(mine)), Ok(Some(theirs))) => mine == theirs,
            _ => false,
        }
    }
    /// True if the executed coordinate equals the master's current binary log coordinate.
    /// Without `master`, the configured master is opened. Any failure answers false.
    pub fn caught_up_to_master(
        &mut self,
        master: Option<&mut ReplicationController>,
    ) -> bool
    {
        let status = match self.slave_status() {
            Ok(Some(status)) => status,
            _ => return false,
        };
        let master_status = match master {
            Some(master) => master.master_status(),
            None => match self.master() {
                Ok(Some(mut master)) => master.master_status(),
                _ => return false,
            },
        };
        match master_status {
            Ok(Some(master_status)) => status.coordinate() == master_status.coordinate(),
            _ => false,
        }
    }
    /// Start the given thread(s), optionally until a coordinate of the master's binary log,
    /// and wait until they are running.
    ///
    /// Refuses (without issuing START SLAVE) if the thread(s) are already running or connecting.
    /// With `until`, a SQL thread that already stopped at or past the coordinate also counts as done.
    pub fn start_slave(
        &mut self,
        thread: SlaveThread,
        until: Option<&Coordinate>,
    ) -> Result<ReplicationStatus>
    {
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        let already = match thread {
            SlaveThread::Both => !status.io_thread.is_stopped() && !status.sql_thread.is_stopped(),
            SlaveThread::Io => !status.io_thread.is_stopped(),
            SlaveThread::Sql => !status.sql_thread.is_stopped(),
        };
        if already {
            let state = match thread {
                SlaveThread::Both => "both IO and SQL threads are already running or trying to connect",
                SlaveThread::Io => "IO thread is already running or trying to connect",
                SlaveThread::Sql => "SQL thread is already running",
            };
            return Err(ReplicationError::AlreadyInState { instance: self.name(), state: state.to_string() });
        }

        let mut command = vec!["START SLAVE".to_string()];
        if let Some(keyword) = thread.keyword() {
            command.push(keyword.to_string());
        }
        if let Some(until) = until {
            command.push(format!("UNTIL MASTER_LOG_FILE = '{}', MASTER_LOG_POS = {}", quote(&until.log_file), until.log_pos));
        }
        let timeout = self.context.timeout_secs();
        self.instance.execute_with_timeout(&command.join(" "), timeout)?;

        self.wait_for_threads(thread, "start", |status| {
            let io_done = status.io_thread.is_running();
            let sql_done = status.sql_thread.is_running()
                || matches!(until, Some(until) if status.sql_thread.is_stopped() && status.coordinate() >= *until);
            match thread {
                SlaveThread::Both => io_done && sql_done,
                SlaveThread::Io => io_done,
                SlaveThread::Sql => sql_done,
            }
        })
    }
    /// Stop the given thread(s) and wait until they are stopped.
    ///
    /// Refuses (without issuing STOP SLAVE) if the thread(s) are already stopped.
    pub fn stop_slave(
        &mut self,
        thread: SlaveThread,
    ) -> Result<ReplicationStatus>
    {
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        if status.is_stopped(thread) {
            let state = match thread {
                SlaveThread::Both => "both IO and SQL threads are already stopped",
                SlaveThread::Io => "IO thread is already stopped",
                SlaveThread::Sql => "SQL thread is already stopped",
            };
            return Err(ReplicationError::AlreadyInState { instance: self.name(), state: state.to_string() });
        }

        let command = match thread.keyword() {
            Some(keyword) => format!("STOP SLAVE {}", keyword),
            None => "STOP SLAVE".to_string(),
        };
        let timeout = self.context.timeout_secs();
        self.instance.execute_with_timeout(&command, timeout)?;

        self.wait_for_threads(thread, "stop", |status| status.is_stopped(thread))
    }
    /// Poll the status until `converged` holds or the timeout elapses.
    fn wait_for_threads<F>(
        &mut self,
        thread: SlaveThread,
        action: &str,
        converged: F,
    ) -> Result<ReplicationStatus>
    where
        F: Fn(&ReplicationStatus) -> bool,
    {
        let clock = self.context.clock.clone();
        let deadline = clock.now() + self.context.timeout;
        let mut status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        while !converged(&status) {
            if clock.now() >= deadline {
                return Err(ReplicationError::Timeout {
                    instance: self.name(),
                    operation: format!("{} to {}", thread, action),
                    detail: status.errors(thread),
                });
            }
            clock.sleep(POLL_INTERVAL);
            status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        }
        debug!("{}: {} {}: io: {}, sql: {}", self.name(), action, thread, status.io_thread, status.sql_thread);
        Ok(status)
    }
    /// Remove the replica configuration. Both threads must be stopped.
    pub fn reset_slave(&mut self) -> Result<()> {
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        if !status.is_stopped(SlaveThread::Both) {
            return Err(ReplicationError::PreconditionFailed(format!("{}: replica is running, stop it before resetting it", self.name())));
        }
        self.instance.execute("RESET SLAVE ALL").map(|_| ())
    }
    /// Configure replication from `master` at `coordinate`, without starting it.
    /// Refused if a replica configuration already exists.
    pub fn setup(
        &mut self,
        master: &InstanceAddress,
        coordinate: &Coordinate,
    ) -> Result<()>
    {
        if self.slave_status()?.is_some() {
            return Err(ReplicationError::PreconditionFailed(format!("{}: replica is set up, reset it before setting it up again", self.name())));
        }
        let credentials = &self.context.replication_credentials;
        let command = format!(
            "CHANGE MASTER TO MASTER_HOST = '{}', MASTER_PORT = {}, MASTER_USER = '{}', MASTER_PASSWORD = '{}', MASTER_LOG_FILE = '{}', MASTER_LOG_POS = {}, MASTER_SSL = 1",
            quote(&master.host),
            master.port,
            quote(&credentials.user),
            quote(&credentials.password),
            quote(&coordinate.log_file),
            coordinate.log_pos,
        );
        info!("{}: replicating from {} at {}", self.name(), master.name(), coordinate);
        self.instance.execute(&command).map(|_| ())
    }
    /// Change `MASTER_USE_GTID`. Success without changes if the mode is already set.
    ///
    /// Running threads are stopped for the change and afterwards exactly the threads that
    /// were running before are started again.
    pub fn set_gtid_mode(
        &mut self,
        mode: GtidMode,
    ) -> Result<()>
    {
        let status = self.slave_status()?.ok_or_else(|| self.not_configured())?;
        if status.gtid_mode == mode {
            debug!("{}: already in gtid mode {}", self.name(), mode);
            return Ok(());
        }
        let io_was_running = status.io_thread.is_running();
        let sql_was_running = status.sql_thread.is_running();
        if io_was_running || sql_was_running {
            self.stop_slave(SlaveThread::Both)?;
        }

        let changed = self.instance.execute(&format!("CHANGE MASTER TO MASTER_USE_GTID = {}", mode.as_sql()));

        let restart = match (io_was_running, sql_was_running) {
            (true, true) => Some(SlaveThread::Both),
            (true, false) => Some(SlaveThread::Io),
            (false, true) => Some(SlaveThread::Sql),
            (false, false) => None,
        };
        let restarted = match restart {
            Some(thread) => self.start_slave(thread, None).map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = &restarted {
            error!("{}: could not restart replication after the gtid change: {}", self.name(), e);
        }
        changed?;
        restarted?;
        info!("{}: gtid mode set to {}", self.name(), mode);
        Ok(())
    }
    /// The connected direct replicas, as reported by `SHOW SLAVE HOSTS`.
    ///
    /// Replicas without `--report-host` are reached through the IPv4 address encoded in
    /// their server_id. Every candidate is opened in parallel and kept only if it confirms
    /// it replicates from this instance; unreachable candidates are skipped with a warning.
    pub fn replicas(&mut self) -> Result<Vec<ReplicationController>> {
        let result = self.instance.execute("SHOW SLAVE HOSTS")?;
        if result.rows.is_empty() {
            return Ok(Vec::new());
        }
        let malformed = |errmsg: String| ReplicationError::QueryFailed {
            instance: self.name(),
            query: "SHOW SLAVE HOSTS".to_string(),
            errno: -1,
            errmsg,
        };
        if result.fields.len() < 3 || result.fields[0] != "Server_id" || result.fields[1] != "Host" || result.fields[2] != "Port" {
            return Err(malformed(format!("unexpected fields: {:?}", result.fields)));
        }
        let mut addresses = Vec::new();
        for row in &result.rows {
            let server_id = row.first().cloned().flatten().and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| malformed(format!("invalid Server_id in {:?}", row)))?;
            let port = row.get(2).cloned().flatten().and_then(|v| v.parse::<u16>().ok())
                .ok_or_else(|| malformed(format!("invalid Port in {:?}", row)))?;
            let port = if port == 0 { DEFAULT_PORT } else { port };
            let host = match row.get(1).cloned().flatten() {
                Some(host) if !host.is_empty() => host,
                _ => Ipv4Addr::from(server_id).to_string(),
            };
            addresses.push(self.context.resolver.resolve_host_port(&host, port));
        }

        info!("begin parallel replica discovery");
        let timer = Instant::now();

        let master_address = self.address().clone();
        let context = &self.context;
        let pool = rayon::ThreadPoolBuilder::new().num_threads(addresses.len()).build()
            .map_err(|e| ReplicationError::PreconditionFailed(format!("could not create thread pool: {}", e)))?;
        let (tx, rx) = channel();
        pool.scope(|s| {
            for address in &addresses {
                let tx = tx.clone();
                let master_address = &master_address;
                s.spawn(move |_| {
                    let replica = match context.open(address) {
                        Ok(mut replica) => {
                            if replica.is_direct_replica_of(master_address) {
                                Some(replica)
                            } else {
                                warn!("{} does not replicate from {}, skipping", address.name(), master_address.name());
                                None
                            }
                        }
                        Err(e) => {
                            warn!("could not connect to instance {}, skipping: {}", address.name(), e);
                            None
                        }
                    };
                    // the receiver outlives the scope
                    let _ = tx.send(replica);
                });
            }
        });
        drop(tx);

        info!("end parallel replica discovery {:?}", timer.elapsed());

        let mut replicas: Vec<ReplicationController> = rx.iter().flatten().collect();
        replicas.sort_by(|a, b| a.address().cmp(b.address()));
        Ok(replicas)
    }
    /// One line description of the replication state.
    pub fn summary(&mut self) -> String {
        match self.slave_status() {
            Ok(Some(status)) => format!(
                "{}> master: {}:{}, io: {}, sql: {}, lag: {}, pos: {}",
                self.name(),
                status.master_host,
                status.master_port,
                status.io_thread,
                status.sql_thread,
                status.seconds_behind_master.map(|l| l.to_string()).unwrap_or_else(|| "None".to_string()),
                status.coordinate(),
            ),
            Ok(None) => format!("{}> Not configured as a replica", self.name()),
            Err(e) => format!("{}> Could not read the replication status: {}", self.name(), e),
        }
    }
}

impl fmt::Debug for ReplicationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationController")
            .field("instance", &self.instance)
            .field("timeout", &self.context.timeout)
            .finish()
    }
}

/// Escape a value for a single quoted SQL string literal.
pub(crate) fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
