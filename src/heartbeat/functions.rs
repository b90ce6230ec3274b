//! The impls and functions
//!
use std::sync::OnceLock;
use log::*;
use regex::Regex;
use crate::{ReplicationError, Result};
use crate::heartbeat::HeartbeatParameters;
use crate::instance::DatabaseInstance;
use crate::remote::RemoteProcessRunner;

/// The daemon command line, with placeholders for section, datacenter, interval and socket.
/// It must match the puppet definition of the heartbeat service.
pub const HEARTBEAT_EXEC: &str = "/usr/bin/perl /usr/local/bin/pt-heartbeat-wikimedia --defaults-file=/dev/null \
--user=root --host=localhost -D heartbeat --shard={} --datacenter={} --update --replace \
--interval={} --set-vars=binlog_format=STATEMENT -S {} --daemonize \
--pid /var/run/pt-heartbeat.pid";

pub const PS_PERL: &str = "/bin/ps --no-headers -o pid,args -C perl";

/// Socket assumed when the parameters come from the heartbeat table.
pub const FALLBACK_SOCKET: &str = "/var/run/mysqld.sock";

const HEARTBEAT_ROW: &str = "SELECT shard, datacenter FROM heartbeat.heartbeat ORDER BY ts DESC LIMIT 1";

impl HeartbeatParameters {
    pub fn command_line(&self) -> String {
        let values = [&self.section, &self.datacenter, &self.interval, &self.socket];
        let mut command_line = String::new();
        for (index, part) in HEARTBEAT_EXEC.split("{}").enumerate() {
            if index > 0 {
                command_line.push_str(values[index - 1]);
            }
            command_line.push_str(part);
        }
        command_line
    }
    /// Find the daemon in `ps -o pid,args` output, returning its pid and parameters.
    pub fn find(ps_output: &str) -> Result<Option<(u32, HeartbeatParameters)>> {
        let regex = heartbeat_regex()?;
        Ok(ps_output.lines()
            .filter_map(|line| regex.captures(line))
            .find_map(|c| {
                let pid = c[1].parse().ok()?;
                Some((pid, HeartbeatParameters {
                    section: c[2].to_string(),
                    datacenter: c[3].to_string(),
                    interval: c[4].to_string(),
                    socket: c[5].to_string(),
                }))
            }))
    }
}

/// [HEARTBEAT_EXEC] as a pattern capturing the pid and the four parameters, built once.
fn heartbeat_regex() -> Result<&'static Regex> {
    static HEARTBEAT: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    HEARTBEAT.get_or_init(|| {
        let pattern = HEARTBEAT_EXEC.split("{}").map(regex::escape).collect::<Vec<_>>().join(r"(\S+)");
        Regex::new(&format!(r"([0-9]+) {}", pattern))
    })
    .as_ref()
    .map_err(|e| ReplicationError::PreconditionFailed(format!("invalid heartbeat command line pattern: {}", e)))
}

/// The datacenter of an FQDN like `db1001.eqiad.wmnet`: its second label.
pub fn datacenter_of(host: &str) -> Option<String> {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 && labels.iter().all(|l| !l.is_empty()) && !labels[0].chars().all(|c| c.is_ascii_digit()) {
        Some(labels[1].to_string())
    } else {
        None
    }
}

/// Kill the heartbeat daemon on the master and return the parameters it ran with.
///
/// Without a running daemon the section and datacenter are read from the last row the
/// daemon wrote, with interval 1 and the fallback socket. Failure to find or to kill the
/// daemon is an error: the master would keep writing after it is made read only.
pub fn stop_heartbeat(
    runner: &dyn RemoteProcessRunner,
    master: &mut DatabaseInstance,
    warnings: &mut Vec<String>,
) -> Result<HeartbeatParameters>
{
    let host = master.host().to_string();
    let found = match runner.run(&host, PS_PERL) {
        Ok(result) => result.stdout.as_deref().map(HeartbeatParameters::find).transpose()?.flatten(),
        Err(e) => {
            warn!("could not list the processes of {}: {}", host, e);
            None
        }
    };

    let (pid, parameters) = match found {
        Some(found) => found,
        None => {
            let row = master.execute(HEARTBEAT_ROW).ok()
                .and_then(|result| result.rows.into_iter().next())
                .and_then(|row| match (row.first().cloned().flatten(), row.get(1).cloned().flatten()) {
                    (Some(section), Some(datacenter)) => Some((section, datacenter)),
                    _ => None,
                });
            return match row {
                Some((section, datacenter)) => {
                    let warning = format!("could not find a pt-heartbeat process to kill on {}, using the heartbeat table to determine the section", master.name());
                    warn!("{}", warning);
                    warnings.push(warning);
                    Ok(HeartbeatParameters { section, datacenter, interval: "1".to_string(), socket: FALLBACK_SOCKET.to_string() })
                }
                None => {
                    error!("could not find a pt-heartbeat process on {}, nor read the heartbeat.heartbeat table", master.name());
                    Err(ReplicationError::PreconditionFailed(format!("could not find a pt-heartbeat process on {}, nor read the heartbeat.heartbeat table", master.name())))
                }
            };
        }
    };

    info!("stopping heartbeat pid {} at {}", pid, master.name());
    let result = runner.run(&host, &format!("/bin/kill {}", pid))?;
    if result.returncode != 0 {
        error!("could not stop the heartbeat process on {}: {}", master.name(), result.stderr.unwrap_or_default());
        return Err(ReplicationError::PreconditionFailed(format!("could not stop the heartbeat process (pid {}) on {}", pid, master.name())));
    }
    Ok(parameters)
}

/// Start the heartbeat daemon on the new master and confirm it runs, returning its pid and
/// the parameters used.
///
/// The datacenter comes from the host name and the socket from the server; when either
/// cannot be determined the old master's value is kept, with a warning.
pub fn start_heartbeat(
    runner: &dyn RemoteProcessRunner,
    master: &mut DatabaseInstance,
    parameters: &HeartbeatParameters,
    warnings: &mut Vec<String>,
) -> Result<(u32, HeartbeatParameters)>
{
    let host = master.host().to_string();
    let mut parameters = parameters.clone();
    match datacenter_of(&host) {
        Some(datacenter) => parameters.datacenter = datacenter,
        None => {
            let warning = format!("could not determine the datacenter of {}, using the one of the original master: {}", host, parameters.datacenter);
            warn!("{}", warning);
            warnings.push(warning);
        }
    }
    match master.global_variable("socket") {
        Ok(Some(socket)) if !socket.is_empty() => parameters.socket = socket,
        _ => {
            let warning = format!("could not determine the socket of {}, using the one of the original master: {}", host, parameters.socket);
            warn!("{}", warning);
            warnings.push(warning);
        }
    }

    info!("starting heartbeat section {} at {}", parameters.section, host);
    let result = runner.run(&host, &format!("/usr/bin/nohup {} &> /dev/null &", parameters.command_line()))?;
    if result.returncode != 0 {
        return Err(ReplicationError::PartialFailure(format!(
            "could not run pt-heartbeat-wikimedia on {}: {} {}",
            host, result.stdout.unwrap_or_default(), result.stderr.unwrap_or_default(),
        )));
    }

    let listed = runner.run(&host, PS_PERL)?;
    match listed.stdout.as_deref().map(HeartbeatParameters::find).transpose()?.flatten() {
        Some((pid, _)) => {
            info!("detected heartbeat at {} running with pid {}", host, pid);
            Ok((pid, parameters))
        }
        None => Err(ReplicationError::PartialFailure(format!("pt-heartbeat could not be detected running on {}", host))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SimFleet, SimServer};
    use crate::instance::{Connector, InstanceAddress};

    fn parameters() -> HeartbeatParameters {
        HeartbeatParameters {
            section: "s1".to_string(),
            datacenter: "eqiad".to_string(),
            interval: "1".to_string(),
            socket: "/run/mysqld/mysqld.sock".to_string(),
        }
    }

    #[test]
    fn unit_command_line_is_found_in_process_list() {
        let line = parameters().command_line();
        assert!(line.contains("--shard=s1 --datacenter=eqiad --update --replace --interval=1 "));
        assert!(line.contains("-S /run/mysqld/mysqld.sock --daemonize"));
        let ps = format!("  812 /usr/bin/perl /usr/local/bin/other-script\n 4242 {}\n", line);
        assert_eq!(HeartbeatParameters::find(&ps).unwrap(), Some((4242, parameters())));
        assert_eq!(HeartbeatParameters::find("  812 /usr/bin/perl /usr/local/bin/other-script\n").unwrap(), None);
    }

    #[test]
    fn unit_datacenter_from_fqdn() {
        assert_eq!(datacenter_of("db2001.codfw.wmnet"), Some("codfw".to_string()));
        assert_eq!(datacenter_of("db1001.test"), None);
        assert_eq!(datacenter_of("10.64.0.12"), None);
    }

    fn fleet() -> SimFleet {
        let fleet = SimFleet::new();
        fleet.add_server(SimServer::new("db1001.eqiad.wmnet", 3306).writable().heartbeat_row("s1", "eqiad"));
        fleet.add_server(SimServer::new("db2001.codfw.wmnet", 3306));
        fleet
    }

    #[test]
    fn unit_handoff_moves_the_daemon() {
        let fleet = fleet();
        fleet.add_process("db1001.eqiad.wmnet", &parameters().command_line());
        let mut master = fleet.connect(&InstanceAddress::new("db1001.eqiad.wmnet", 3306)).unwrap();
        let mut replica = fleet.connect(&InstanceAddress::new("db2001.codfw.wmnet", 3306)).unwrap();
        let runner = fleet.runner();
        let mut warnings = Vec::new();

        let stopped = stop_heartbeat(&runner, &mut master, &mut warnings).unwrap();
        assert_eq!(stopped, parameters());
        assert!(fleet.processes("db1001.eqiad.wmnet").is_empty());

        let (pid, started) = start_heartbeat(&runner, &mut replica, &stopped, &mut warnings).unwrap();
        assert_eq!(started.datacenter, "codfw");
        assert_eq!(fleet.processes("db2001.codfw.wmnet"), vec![(pid, started.command_line())]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unit_stop_falls_back_to_the_heartbeat_table() {
        let fleet = fleet();
        let mut master = fleet.connect(&InstanceAddress::new("db1001.eqiad.wmnet", 3306)).unwrap();
        let mut warnings = Vec::new();
        let stopped = stop_heartbeat(&fleet.runner(), &mut master, &mut warnings).unwrap();
        assert_eq!(stopped.section, "s1");
        assert_eq!(stopped.interval, "1");
        assert_eq!(stopped.socket, FALLBACK_SOCKET);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unit_stop_without_daemon_nor_table_fails() {
        let fleet = fleet();
        let mut replica = fleet.connect(&InstanceAddress::new("db2001.codfw.wmnet", 3306)).unwrap();
        let error = stop_heartbeat(&fleet.runner(), &mut replica, &mut Vec::new()).unwrap_err();
        assert!(error.is_precondition());
    }
}
