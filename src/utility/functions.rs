//! The impls and functions
//!
use std::{collections::HashMap, env, fs, io::{stdin, stdout, Write}, path::PathBuf, sync::Arc, time::Duration};
use anyhow::{bail, Context, Result};
use log::*;
use crate::clock::SystemClock;
use crate::instance::{Credentials, MysqlConnector, Resolver, Vendor};
use crate::remote::DEFAULT_REMOTE_SHELL;
use crate::replication::ReplicationContext;
use crate::utility::{CommonOptions, Settings, DEFAULT_PARALLEL, DEFAULT_REPLICATION_USER, DEFAULT_SOCKET, DEFAULT_TIMEOUT, DEFAULT_USER, DEFAULT_VENDOR};

/// Take a setting from the switch, else from the environment variable `key`, else `default`.
///
/// A value taken from the switch or the environment is recorded in `changed_options`.
/// Secret values are not logged.
pub fn set_string(
    option: &Option<String>,
    key: &'static str,
    default: &str,
    secret: bool,
    changed_options: &mut HashMap<&'static str, String>,
) -> String
{
    let shown = |value: &str| if secret { "*****".to_string() } else { value.to_string() };
    match option {
        Some(value) => {
            info!("{} argument set: using: {}", key, shown(value));
            changed_options.insert(key, value.to_string());
            value.to_string()
        }
        None => match env::var(key) {
            Ok(set_var) => {
                info!("{} argument not set: set via .env: using: {}", key, shown(&set_var));
                changed_options.insert(key, set_var.to_owned());
                set_var
            }
            Err(_e) => {
                info!("{} argument not set: and not set via .env: using default: {}", key, shown(default));
                default.to_string()
            }
        },
    }
}

pub fn set_timeout(
    option: &Option<String>,
    changed_options: &mut HashMap<&'static str, String>,
) -> Result<Duration>
{
    let timeout = set_string(option, "MDBREPL_TIMEOUT", DEFAULT_TIMEOUT, false, changed_options);
    let seconds: f64 = timeout.parse()
        .with_context(|| format!("invalid timeout: {}", timeout))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("the timeout must be a positive number of seconds: {}", timeout);
    }
    Ok(Duration::from_secs_f64(seconds))
}

pub fn set_parallel(
    option: &Option<String>,
    changed_options: &mut HashMap<&'static str, String>,
) -> Result<usize>
{
    let parallel = set_string(option, "MDBREPL_PARALLEL", DEFAULT_PARALLEL, false, changed_options);
    let parallel: usize = parallel.parse()
        .with_context(|| format!("invalid parallel: {}", parallel))?;
    if parallel == 0 {
        bail!("parallel must be at least 1");
    }
    Ok(parallel)
}

pub fn set_vendor(
    option: &Option<String>,
    changed_options: &mut HashMap<&'static str, String>,
) -> Result<Vendor>
{
    let vendor = set_string(option, "MDBREPL_VENDOR", DEFAULT_VENDOR, false, changed_options);
    match vendor.to_lowercase().as_str() {
        "mariadb" => Ok(Vendor::MariaDB),
        "mysql" => Ok(Vendor::MySQL),
        _ => bail!("invalid vendor: {}, use mariadb or mysql", vendor),
    }
}

impl Settings {
    pub fn from_options(
        options: &CommonOptions,
        changed_options: &mut HashMap<&'static str, String>,
    ) -> Result<Self>
    {
        let ssl_ca = set_string(&options.ssl_ca, "MDBREPL_SSL_CA", "", false, changed_options);
        Ok(Settings {
            user: set_string(&options.user, "MDBREPL_USER", DEFAULT_USER, false, changed_options),
            password: set_string(&options.password, "MDBREPL_PASSWORD", "", true, changed_options),
            replication_user: set_string(&options.replication_user, "MDBREPL_REPLICATION_USER", DEFAULT_REPLICATION_USER, false, changed_options),
            replication_password: set_string(&options.replication_password, "MDBREPL_REPLICATION_PASSWORD", "", true, changed_options),
            ssl_ca: if ssl_ca.is_empty() { None } else { Some(PathBuf::from(ssl_ca)) },
            socket: set_string(&options.socket, "MDBREPL_SOCKET", DEFAULT_SOCKET, false, changed_options),
            domain_rules: set_string(&options.domain_rules, "MDBREPL_DOMAIN_RULES", "", false, changed_options),
            timeout: set_timeout(&options.timeout, changed_options)?,
            parallel: set_parallel(&options.parallel, changed_options)?,
            vendor: set_vendor(&options.vendor, changed_options)?,
            remote_shell: set_string(&options.remote_shell, "MDBREPL_REMOTE_SHELL", DEFAULT_REMOTE_SHELL, false, changed_options),
        })
    }
    /// The context for real servers: `mysql` connections and the wall clock.
    pub fn context(&self) -> Result<ReplicationContext> {
        let resolver = Resolver::from_rules(&self.domain_rules)
            .with_context(|| format!("invalid domain rules: {}", self.domain_rules))?;
        let connector = MysqlConnector {
            credentials: Credentials { user: self.user.clone(), password: self.password.clone() },
            ssl_ca: self.ssl_ca.clone(),
            socket: self.socket.clone(),
            connect_timeout: self.timeout,
            vendor: self.vendor,
        };
        Ok(ReplicationContext::new(
            self.timeout,
            Arc::new(SystemClock::new()),
            Arc::new(connector),
            resolver,
            Credentials { user: self.replication_user.clone(), password: self.replication_password.clone() },
        ))
    }
}

pub fn dotenv_writer(
    write_dotenv: bool,
    changed_options: HashMap<&str, String>,
) -> Result<()>
{
    if !changed_options.is_empty() && write_dotenv {
        info!("Writing .env file");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(".env")
            .with_context(|| "Error writing .env file: .env")?;

        let mut options: Vec<_> = changed_options.into_iter().collect();
        options.sort();
        for (key, value) in options {
            file.write_all(format!("{}={}\n", key, value).as_bytes())?;
            info!("{}={}", key, if key.ends_with("PASSWORD") { "*****" } else { value.as_str() });
        }
    }
    Ok(())
}

/// Ask `question` until the answer is yes or no.
pub fn ask_for_confirmation(question: &str) -> Result<bool> {
    loop {
        print!("{} (yes/no): ", question);
        stdout().flush()?;
        let mut input = String::new();
        if stdin().read_line(&mut input).with_context(|| "Error reading the answer")? == 0 {
            return Ok(false);
        }
        match parse_answer(&input) {
            Some(answer) => return Ok(answer),
            None => println!("Please answer yes or no."),
        }
    }
}

fn parse_answer(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "yes" | "y" => Some(true),
        "no" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_switch_wins_over_environment() {
        env::set_var("MDBREPL_TEST_PRECEDENCE", "from-env");
        let mut changed_options = HashMap::new();
        let value = set_string(&Some("from-switch".to_string()), "MDBREPL_TEST_PRECEDENCE", "default", false, &mut changed_options);
        assert_eq!(value, "from-switch");
        let value = set_string(&None, "MDBREPL_TEST_PRECEDENCE", "default", false, &mut changed_options);
        assert_eq!(value, "from-env");
        assert_eq!(changed_options.get("MDBREPL_TEST_PRECEDENCE"), Some(&"from-env".to_string()));
        env::remove_var("MDBREPL_TEST_PRECEDENCE");
        let mut changed_options = HashMap::new();
        let value = set_string(&None, "MDBREPL_TEST_PRECEDENCE", "default", false, &mut changed_options);
        assert_eq!(value, "default");
        assert!(changed_options.is_empty());
    }

    #[test]
    fn unit_timeout_and_parallel_are_validated() {
        let mut changed_options = HashMap::new();
        assert_eq!(set_timeout(&Some("2.5".to_string()), &mut changed_options).unwrap(), Duration::from_millis(2500));
        assert!(set_timeout(&Some("0".to_string()), &mut changed_options).is_err());
        assert!(set_timeout(&Some("soon".to_string()), &mut changed_options).is_err());
        assert_eq!(set_parallel(&Some("8".to_string()), &mut changed_options).unwrap(), 8);
        assert!(set_parallel(&Some("0".to_string()), &mut changed_options).is_err());
    }

    #[test]
    fn unit_vendor_selects_the_flavour() {
        let mut changed_options = HashMap::new();
        assert_eq!(set_vendor(&Some("MySQL".to_string()), &mut changed_options).unwrap(), Vendor::MySQL);
        assert_eq!(set_vendor(&Some("mariadb".to_string()), &mut changed_options).unwrap(), Vendor::MariaDB);
        assert!(set_vendor(&Some("postgres".to_string()), &mut changed_options).is_err());

        let options = CommonOptions { vendor: Some("mysql".to_string()), ..Default::default() };
        let settings = Settings::from_options(&options, &mut changed_options).unwrap();
        assert_eq!(settings.vendor, Vendor::MySQL);
    }

    #[test]
    fn unit_settings_build_a_context() {
        let options = CommonOptions {
            user: Some("admin".to_string()),
            timeout: Some("3".to_string()),
            parallel: Some("2".to_string()),
            domain_rules: Some(r"^db1[0-9]{3}$=.eqiad.wmnet".to_string()),
            ..Default::default()
        };
        let mut changed_options = HashMap::new();
        let settings = Settings::from_options(&options, &mut changed_options).unwrap();
        assert_eq!(settings.user, "admin");
        assert_eq!(settings.timeout, Duration::from_secs(3));
        assert_eq!(settings.parallel, 2);
        assert_eq!(changed_options.get("MDBREPL_USER"), Some(&"admin".to_string()));

        let context = settings.context().unwrap();
        assert_eq!(context.timeout, Duration::from_secs(3));
        assert_eq!(context.resolver.resolve("db1001").unwrap().host, "db1001.eqiad.wmnet");
    }

    #[test]
    fn unit_answers() {
        assert_eq!(parse_answer("yes\n"), Some(true));
        assert_eq!(parse_answer(" N \n"), Some(false));
        assert_eq!(parse_answer("maybe\n"), None);
    }
}
