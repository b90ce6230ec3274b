//! Error types for the replication tooling.
//!
//! Connectivity and query failures are always reported separately from state errors:
//! a replica that is "not configured" is a valid answer, a query that did not return is not.
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    /// The instance has no replica configuration.
    #[error("{instance}: the server is not configured as a replica")]
    NotConfigured { instance: String },

    /// The query succeeded, but the instance already is in the requested state.
    #[error("{instance}: {state}")]
    AlreadyInState { instance: String, state: String },

    /// A bounded wait elapsed before the expected state was observed.
    #[error("{instance}: timeout waiting for {operation}: {detail}")]
    Timeout {
        instance: String,
        operation: String,
        detail: String,
    },

    /// Transport, authentication or SQL execution failure.
    #[error("{instance}: query failed: {query}: ({errno}) {errmsg}")]
    QueryFailed {
        instance: String,
        query: String,
        errno: i64,
        errmsg: String,
    },

    /// A check done before any mutation did not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Some mutations were performed and the operation could not complete.
    #[error("partial failure: {0}")]
    PartialFailure(String),
}

impl ReplicationError {
    /// True for errors raised before anything was changed on the servers.
    pub fn is_precondition(&self) -> bool {
        matches!(self, ReplicationError::PreconditionFailed(_) | ReplicationError::NotConfigured { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_messages_name_the_instance() {
        let error = ReplicationError::AlreadyInState { instance: "db1001".to_string(), state: "SQL thread is already stopped".to_string() };
        assert_eq!(error.to_string(), "db1001: SQL thread is already stopped");

        let error = ReplicationError::QueryFailed { instance: "db1001:3311".to_string(), query: "SHOW SLAVE STATUS".to_string(), errno: 2013, errmsg: "Lost connection".to_string() };
        assert_eq!(error.to_string(), "db1001:3311: query failed: SHOW SLAVE STATUS: (2013) Lost connection");
    }

    #[test]
    fn unit_precondition_classification() {
        assert!(ReplicationError::PreconditionFailed("lag".to_string()).is_precondition());
        assert!(ReplicationError::NotConfigured { instance: "x".to_string() }.is_precondition());
        assert!(!ReplicationError::PartialFailure("x".to_string()).is_precondition());
    }
}
