//! The structs
//!
use std::{path::PathBuf, time::Duration};
use clap::Args;
use crate::instance::Vendor;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_REPLICATION_USER: &str = "repl";
pub const DEFAULT_SOCKET: &str = "/run/mysqld/mysqld.sock";
pub const DEFAULT_TIMEOUT: &str = "5.0";
pub const DEFAULT_PARALLEL: &str = "4";
pub const DEFAULT_VENDOR: &str = "mariadb";

/// The switches shared by every tool.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonOptions {
    /// user to connect with (MDBREPL_USER)
    #[arg(long, global = true)]
    pub user: Option<String>,
    /// password to connect with (MDBREPL_PASSWORD)
    #[arg(long, global = true)]
    pub password: Option<String>,
    /// user configured for replication (MDBREPL_REPLICATION_USER)
    #[arg(long, global = true)]
    pub replication_user: Option<String>,
    /// password configured for replication (MDBREPL_REPLICATION_PASSWORD)
    #[arg(long, global = true)]
    pub replication_password: Option<String>,
    /// CA file, enables TLS to non-local hosts (MDBREPL_SSL_CA)
    #[arg(long, global = true)]
    pub ssl_ca: Option<String>,
    /// socket used for localhost (MDBREPL_SOCKET)
    #[arg(long, global = true)]
    pub socket: Option<String>,
    /// comma separated regex=suffix rules to complete short host names (MDBREPL_DOMAIN_RULES)
    #[arg(long, global = true)]
    pub domain_rules: Option<String>,
    /// seconds to wait for each step, and the maximum lag (MDBREPL_TIMEOUT)
    #[arg(long, global = true)]
    pub timeout: Option<String>,
    /// number of parallel workers (MDBREPL_PARALLEL)
    #[arg(long, global = true)]
    pub parallel: Option<String>,
    /// server flavour, mariadb or mysql (MDBREPL_VENDOR)
    #[arg(long, global = true)]
    pub vendor: Option<String>,
    /// command to run commands on remote hosts, the host and the command are appended (MDBREPL_REMOTE_SHELL)
    #[arg(long, global = true)]
    pub remote_shell: Option<String>,
    /// write the settings given to .env
    #[arg(long, global = true)]
    pub write_dotenv: bool,
}

/// The resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub user: String,
    pub password: String,
    pub replication_user: String,
    pub replication_password: String,
    pub ssl_ca: Option<PathBuf>,
    pub socket: String,
    pub domain_rules: String,
    pub timeout: Duration,
    pub parallel: usize,
    pub vendor: Vendor,
    pub remote_shell: String,
}
