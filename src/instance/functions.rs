//! The impls and functions
//!
use std::{collections::HashMap, fmt, net::IpAddr, sync::OnceLock};
use log::*;
use regex::Regex;
use crate::{ReplicationError, Result};
use crate::instance::{DatabaseInstance, InstanceAddress, QueryError, QueryResult, Resolver, SqlConnection, Vendor, DEFAULT_PORT};

impl InstanceAddress {
    pub fn new(host: &str, port: u16) -> Self {
        InstanceAddress { host: host.to_string(), port, socket: None }
    }
    pub fn with_socket(mut self, socket: &str) -> Self {
        self.socket = Some(socket.to_string());
        self
    }
    /// The short form used in messages: first label of the host, plus the port if it is not 3306.
    pub fn name(&self) -> String {
        if self.host == "localhost" {
            return format!("localhost[socket={}]", self.socket.as_deref().unwrap_or("default"));
        }
        let short = if self.host.parse::<IpAddr>().is_ok() {
            self.host.as_str()
        } else {
            self.host.split('.').next().unwrap_or(&self.host)
        };
        if self.port == DEFAULT_PORT {
            short.to_string()
        } else {
            format!("{}:{}", short, self.port)
        }
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Resolver {
    pub fn new() -> Self {
        Default::default()
    }
    /// Parse a comma separated list of `regex=suffix` rules,
    /// for example `^[a-z]+1[0-9]{3}$=.eqiad.wmnet,^[a-z]+2[0-9]{3}$=.codfw.wmnet`.
    pub fn from_rules(rules: &str) -> std::result::Result<Self, regex::Error> {
        let mut resolver = Resolver::new();
        for rule in rules.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (pattern, suffix) = rule.rsplit_once('=').unwrap_or((rule, ""));
            resolver.rules.push((Regex::new(pattern)?, suffix.to_string()));
        }
        Ok(resolver)
    }
    /// Turn a `host[:port]` string into an address, completing the domain of short names.
    /// IP literals and `localhost` are left as they are. IPv6 literals are not supported.
    pub fn resolve(
        &self,
        instance: &str,
    ) -> Result<InstanceAddress>
    {
        let (host, port) = match instance.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>()
                    .map_err(|_| ReplicationError::PreconditionFailed(format!("invalid port in instance name: {}", instance)))?;
                (host, port)
            }
            None => (instance, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ReplicationError::PreconditionFailed(format!("empty host in instance name: {}", instance)));
        }
        Ok(InstanceAddress::new(&self.complete_host(host), port))
    }
    pub fn resolve_host_port(
        &self,
        host: &str,
        port: u16,
    ) -> InstanceAddress
    {
        InstanceAddress::new(&self.complete_host(host), port)
    }
    fn complete_host(&self, host: &str) -> String {
        if host.parse::<IpAddr>().is_ok() || host.contains('.') || host == "localhost" {
            return host.to_string();
        }
        match self.rules.iter().find(|(pattern, _)| pattern.is_match(host)) {
            Some((_, suffix)) => format!("{}{}", host, suffix),
            None => host.to_string(),
        }
    }
}

impl QueryResult {
    /// The first column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|r| r.first()).and_then(|v| v.as_deref())
    }
    /// Row `index` as a map of lowercased field name to value.
    pub fn row_map(&self, index: usize) -> Option<HashMap<String, Option<String>>> {
        self.rows.get(index).map(|row| {
            self.fields.iter()
                .map(|f| f.to_lowercase())
                .zip(row.iter().cloned())
                .collect()
        })
    }
}

impl DatabaseInstance {
    pub fn new(
        address: InstanceAddress,
        vendor: Vendor,
        connection: Box<dyn SqlConnection>,
    ) -> Self
    {
        DatabaseInstance { address, vendor, query_limit: 0.0, connection: Some(connection) }
    }
    pub fn name(&self) -> String {
        self.address.name()
    }
    pub fn host(&self) -> &str {
        &self.address.host
    }
    pub fn port(&self) -> u16 {
        self.address.port
    }
    pub fn is_same_instance_as(&self, other: &InstanceAddress) -> bool {
        self.address == *other
    }
    /// Run a single statement.
    pub fn execute(
        &mut self,
        command: &str,
    ) -> Result<QueryResult>
    {
        let name = self.name();
        let query = redacted(command);
        let connection = self.connection.as_mut()
            .ok_or_else(|| ReplicationError::QueryFailed { instance: name.clone(), query: query.clone(), errno: 2006, errmsg: "connection is closed".to_string() })?;
        debug!("{}: executing '{}'", name, query);
        connection.execute(command)
            .map_err(|QueryError { errno, errmsg }| {
                debug!("{}: error {}: {}", name, errno, errmsg);
                ReplicationError::QueryFailed { instance: name, query, errno, errmsg }
            })
    }
    /// Run a single statement with a server side time limit, restoring the previous limit after.
    pub fn execute_with_timeout(
        &mut self,
        command: &str,
        timeout: f64,
    ) -> Result<QueryResult>
    {
        let original_query_limit = self.query_limit;
        // servers not supporting statement limits still run the statement
        if let Err(e) = self.set_query_limit(timeout) {
            debug!("{}: could not set the query limit: {}", self.name(), e);
        }
        let result = self.execute(command);
        if let Err(e) = self.set_query_limit(original_query_limit) {
            debug!("{}: could not restore the query limit: {}", self.name(), e);
        }
        result
    }
    /// Set the per statement limit in seconds, 0 disables it.
    pub fn set_query_limit(
        &mut self,
        query_limit: f64,
    ) -> Result<()>
    {
        self.query_limit = if query_limit > 0.0 { query_limit } else { 0.0 };
        let command = match self.vendor {
            Vendor::MariaDB => format!("SET SESSION max_statement_time = {}", self.query_limit),
            Vendor::MySQL => format!("SET SESSION max_execution_time = {}", (self.query_limit * 1000.0) as u64),
        };
        self.execute(&command).map(|_| ())
    }
    /// Read `@@GLOBAL.<variable>` as text.
    pub fn global_variable(
        &mut self,
        variable: &str,
    ) -> Result<Option<String>>
    {
        let result = self.execute(&format!("SELECT @@GLOBAL.{}", variable))?;
        Ok(result.first_value().map(str::to_string))
    }
    pub fn read_only(&mut self) -> Result<bool> {
        let name = self.name();
        match self.global_variable("read_only")?.as_deref() {
            Some("1") | Some("ON") => Ok(true),
            Some("0") | Some("OFF") => Ok(false),
            other => Err(ReplicationError::QueryFailed { instance: name, query: "SELECT @@GLOBAL.read_only".to_string(), errno: -1, errmsg: format!("unexpected read_only value: {:?}", other) }),
        }
    }
    pub fn set_read_only(
        &mut self,
        read_only: bool,
    ) -> Result<()>
    {
        self.execute(&format!("SET GLOBAL read_only = {}", i32::from(read_only))).map(|_| ())
    }
    /// The server version as (major, minor, patch), from `@@GLOBAL.version` (e.g. `10.4.22-MariaDB-log`).
    pub fn version(&mut self) -> Result<(u32, u32, u32)> {
        let name = self.name();
        let version = self.global_variable("version")?.unwrap_or_default();
        parse_version(&version)
            .ok_or_else(|| ReplicationError::QueryFailed { instance: name, query: "SELECT @@GLOBAL.version".to_string(), errno: -1, errmsg: format!("unexpected version string: {}", version) })
    }
    /// Drop the connection. Further statements fail.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("{}: disconnected", self.name());
        }
    }
}

impl fmt::Debug for DatabaseInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseInstance")
            .field("address", &self.address)
            .field("vendor", &self.vendor)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// The statement as it may appear in logs and errors: the replication password is masked.
fn redacted(command: &str) -> String {
    static PASSWORD: OnceLock<Regex> = OnceLock::new();
    let password = PASSWORD.get_or_init(|| Regex::new(r"MASTER_PASSWORD\s*=\s*'(?:[^'\\]|\\.)*'").unwrap());
    password.replace_all(command, "MASTER_PASSWORD = '****'").into_owned()
}

pub(crate) fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let numbers = version.split('-').next()?;
    let mut parts = numbers.split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}
