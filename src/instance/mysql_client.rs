//! The SQL client for real servers, using the `mysql` crate.
//!
use std::{path::PathBuf, time::Duration};
use log::*;
use mysql::{prelude::Queryable, Conn, OptsBuilder, SslOpts, Value};
use crate::{ReplicationError, Result};
use crate::instance::{Connector, Credentials, DatabaseInstance, InstanceAddress, QueryError, QueryResult, SqlConnection, Vendor};

/// A blocking connection to one server.
pub struct MysqlConnection {
    conn: Conn,
}

/// Opens [MysqlConnection]s with the configured credentials.
///
/// - `localhost` connects through `socket`, without TLS.
/// - `127.0.0.1` connects through TCP, without TLS.
/// - Every other host connects through TCP, with TLS if a CA file is configured.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    pub credentials: Credentials,
    pub ssl_ca: Option<PathBuf>,
    pub socket: String,
    pub connect_timeout: Duration,
    pub vendor: Vendor,
}

impl SqlConnection for MysqlConnection {
    fn execute(&mut self, command: &str) -> std::result::Result<QueryResult, QueryError> {
        let mut result = self.conn.query_iter(command).map_err(query_error)?;
        let fields: Vec<String> = result.columns().as_ref().iter()
            .map(|column| column.name_str().to_string())
            .collect();
        let affected_rows = result.affected_rows();
        let mut rows = Vec::new();
        for row in result.by_ref() {
            let row = row.map_err(query_error)?;
            rows.push(row.unwrap().into_iter().map(value_to_text).collect());
        }
        let numrows = if fields.is_empty() { affected_rows } else { rows.len() as u64 };
        Ok(QueryResult { fields, rows, numrows })
    }
}

impl Connector for MysqlConnector {
    fn connect(&self, address: &InstanceAddress) -> Result<DatabaseInstance> {
        let mut address = address.clone();
        let mut builder = OptsBuilder::new()
            .user(Some(self.credentials.user.clone()))
            .pass(Some(self.credentials.password.clone()))
            .tcp_connect_timeout(Some(self.connect_timeout));
        if address.host == "localhost" {
            let socket = address.socket.clone().unwrap_or_else(|| self.socket.clone());
            address.socket = Some(socket.clone());
            builder = builder.socket(Some(socket));
        } else {
            builder = builder
                .ip_or_hostname(Some(address.host.clone()))
                .tcp_port(address.port);
            if address.host != "127.0.0.1" {
                if let Some(ca) = &self.ssl_ca {
                    builder = builder.ssl_opts(Some(SslOpts::default().with_root_cert_path(Some(ca.clone()))));
                }
            }
        }
        let conn = Conn::new(builder)
            .map_err(|e| {
                let QueryError { errno, errmsg } = query_error(e);
                ReplicationError::QueryFailed { instance: address.name(), query: "connect".to_string(), errno, errmsg }
            })?;
        debug!("connected to {}", address.name());
        Ok(DatabaseInstance::new(address, self.vendor, Box::new(MysqlConnection { conn })))
    }
}

fn query_error(error: mysql::Error) -> QueryError {
    match error {
        mysql::Error::MySqlError(e) => QueryError { errno: i64::from(e.code), errmsg: e.message },
        other => QueryError { errno: -1, errmsg: other.to_string() },
    }
}

fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        other => Some(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_values_are_returned_as_text() {
        assert_eq!(value_to_text(Value::NULL), None);
        assert_eq!(value_to_text(Value::Bytes(b"Yes".to_vec())), Some("Yes".to_string()));
        assert_eq!(value_to_text(Value::Int(-1)), Some("-1".to_string()));
        assert_eq!(value_to_text(Value::UInt(4_000_000_000)), Some("4000000000".to_string()));
    }
}
