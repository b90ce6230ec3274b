//! The structs
//!
use std::fmt::Debug;
use regex::Regex;

/// The default MariaDB/MySQL port.
pub const DEFAULT_PORT: u16 = 3306;

/// The server flavour, which changes how the per-query time limit is set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    #[default]
    MariaDB,
    MySQL,
}

/// The identity of an instance.
///
/// Two instances are the same when host and port are equal, and the sockets are equal
/// (or both are not set).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
}

/// The result of a successful statement.
///
/// All values are returned in text form, `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows returned, or rows affected for statements not returning a result set.
    pub numrows: u64,
}

/// The error reported by the SQL client.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryError {
    pub errno: i64,
    pub errmsg: String,
}

/// Username and password pair.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// An open client connection to one server.
pub trait SqlConnection: Send {
    /// Run a single statement and return its result set (empty for non-queries).
    fn execute(&mut self, command: &str) -> Result<QueryResult, QueryError>;
}

/// Opens connections to instances.
pub trait Connector: Send + Sync + Debug {
    fn connect(&self, address: &InstanceAddress) -> crate::Result<DatabaseInstance>;
}

/// Completes short host names into fully qualified ones.
///
/// Each rule is a regex matched against the short name, and the domain suffix to append
/// when it matches. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    pub rules: Vec<(Regex, String)>,
}

/// An authenticated handle to one server.
pub struct DatabaseInstance {
    pub address: InstanceAddress,
    pub vendor: Vendor,
    /// Per statement time limit in seconds, 0 for none.
    pub(crate) query_limit: f64,
    pub(crate) connection: Option<Box<dyn SqlConnection>>,
}
