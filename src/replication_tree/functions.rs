//! The impls and functions
//!
use std::{collections::BTreeSet, time::Instant};
use colored::*;
use log::*;
use crate::Result;
use crate::heartbeat::datacenter_of;
use crate::instance::InstanceAddress;
use crate::replication::ReplicationController;
use crate::replication_tree::{InstanceDetails, TreeNode, MAX_DEPTH};

/// Discover `root` and its replicas, recursively, up to [MAX_DEPTH] levels.
///
/// An instance that cannot be read is kept in the tree with its error.
/// An instance that was already seen (circular replication) is not descended into again.
pub fn build_tree(root: &mut ReplicationController) -> TreeNode {
    info!("begin replication tree discovery from {}", root.name());
    let timer = Instant::now();

    let mut seen = BTreeSet::new();
    let tree = discover(root, 0, &mut seen);

    info!("end replication tree discovery {:?}", timer.elapsed());
    tree
}

fn discover(
    controller: &mut ReplicationController,
    depth: usize,
    seen: &mut BTreeSet<InstanceAddress>,
) -> TreeNode
{
    let mut node = TreeNode {
        address: controller.address().clone(),
        details: None,
        error: None,
        replicas: Vec::new(),
        truncated: false,
    };
    match read_details(controller) {
        Ok(details) => node.details = Some(details),
        Err(e) => {
            warn!("{}: could not read the instance details: {}", controller.name(), e);
            node.error = Some(e.to_string());
        }
    }
    if !seen.insert(node.address.clone()) {
        warn!("{} was already seen, not descending into it again", controller.name());
        node.truncated = true;
        return node;
    }
    if depth >= MAX_DEPTH {
        warn!("{}: depth limit of {} reached", controller.name(), MAX_DEPTH);
        node.truncated = true;
        return node;
    }
    match controller.replicas() {
        Ok(replicas) => {
            for mut replica in replicas {
                node.replicas.push(discover(&mut replica, depth + 1, seen));
            }
        }
        Err(e) => {
            warn!("{}: could not discover the replicas: {}", controller.name(), e);
            node.error.get_or_insert_with(|| e.to_string());
            node.truncated = true;
        }
    }
    node
}

fn read_details(controller: &mut ReplicationController) -> Result<InstanceDetails> {
    let clock = controller.context.clock.clone();
    let start = clock.now();
    let version = controller.instance.global_variable("version")?.unwrap_or_default();
    let latency = clock.now().saturating_sub(start);

    let binlog_format = controller.instance.global_variable("binlog_format")?.unwrap_or_default();
    let read_only = controller.instance.read_only()?;
    let uptime = controller.instance.execute("SHOW GLOBAL STATUS LIKE 'Uptime'")
        .ok()
        .and_then(|result| result.rows.into_iter().next())
        .and_then(|row| row.get(1).cloned().flatten())
        .and_then(|value| value.parse().ok());
    let processes = controller.instance.execute("SELECT COUNT(*) FROM information_schema.processlist")
        .ok()
        .and_then(|result| result.first_value().and_then(|value| value.parse().ok()));
    let lag = controller.lag()?;

    Ok(InstanceDetails { version, binlog_format, read_only, uptime, processes, latency, lag })
}

/// True when both hosts have a known datacenter and they differ.
pub fn crosses_datacenter(
    master: &str,
    replica: &str,
) -> bool
{
    matches!((datacenter_of(master), datacenter_of(replica)), (Some(master), Some(replica)) if master != replica)
}

/// `1d 02:03:04` style uptime.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let seconds = seconds % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// The tree as lines of text, replicas indented below their master.
pub fn render_tree(tree: &TreeNode) -> Vec<String> {
    let mut lines = Vec::new();
    render(tree, None, 0, &mut lines);
    lines
}

fn render(
    node: &TreeNode,
    master: Option<&InstanceAddress>,
    depth: usize,
    lines: &mut Vec<String>,
) {
    let mut line = if depth == 0 {
        String::new()
    } else {
        format!("{}+ ", "  ".repeat(depth - 1))
    };
    line.push_str(&node.address.name().bold().to_string());

    if let Some(master) = master {
        if crosses_datacenter(&master.host, &node.address.host) {
            let edge = format!(
                " ({} -> {})",
                datacenter_of(&master.host).unwrap_or_default(),
                datacenter_of(&node.address.host).unwrap_or_default(),
            );
            line.push_str(&edge.red().to_string());
        }
    }

    if let Some(details) = &node.details {
        let read_only = if details.read_only { "ON".normal() } else { "OFF".yellow() };
        let lag = match details.lag {
            Some(0) => "0".normal(),
            Some(lag) => lag.to_string().yellow(),
            None if master.is_some() => "unknown".red(),
            None => "-".normal(),
        };
        line.push_str(&format!(
            ", version: {}, up: {}, RO: {}, binlog: {}, lag: {}, processes: {}, latency: {:.4}",
            details.version,
            details.uptime.map(format_uptime).unwrap_or_else(|| "?".to_string()),
            read_only,
            details.binlog_format,
            lag,
            details.processes.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            details.latency.as_secs_f64(),
        ));
    }
    if let Some(error) = &node.error {
        line.push_str(&format!(": {}", error.red()));
    }
    if node.truncated {
        line.push_str(" ...");
    }
    lines.push(line);

    for replica in &node.replicas {
        render(replica, Some(&node.address), depth + 1, lines);
    }
}

pub fn print_tree(tree: &TreeNode) {
    for line in render_tree(tree) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::simulation::{SimFleet, SimServer};

    fn fleet() -> SimFleet {
        let fleet = SimFleet::new();
        fleet.add_server(SimServer::new("db1001.eqiad.wmnet", 3306).writable());
        fleet.add_server(SimServer::new("db1002.eqiad.wmnet", 3306).replica_of("db1001.eqiad.wmnet", 3306));
        fleet.add_server(SimServer::new("db2001.codfw.wmnet", 3306).replica_of("db1001.eqiad.wmnet", 3306));
        fleet.add_server(SimServer::new("db2002.codfw.wmnet", 3306).replica_of("db2001.codfw.wmnet", 3306));
        fleet
    }

    #[test]
    fn unit_tree_follows_the_replicas() {
        let fleet = fleet();
        let mut root = fleet.context(Duration::from_secs(5)).open_name("db1001.eqiad.wmnet:3306").unwrap();
        let tree = build_tree(&mut root);

        let root_details = tree.details.clone().unwrap();
        assert!(!root_details.read_only);
        assert_eq!(root_details.lag, None);
        assert_eq!(root_details.binlog_format, "ROW");

        let hosts: Vec<&str> = tree.replicas.iter().map(|r| r.address.host.as_str()).collect();
        assert_eq!(hosts, vec!["db1002.eqiad.wmnet", "db2001.codfw.wmnet"]);
        assert_eq!(tree.replicas[0].details.as_ref().unwrap().lag, Some(0));
        assert!(tree.replicas[0].replicas.is_empty());
        assert_eq!(tree.replicas[1].replicas.len(), 1);
        assert_eq!(tree.replicas[1].replicas[0].address.host, "db2002.codfw.wmnet");
        assert!(!tree.truncated);
    }

    #[test]
    fn unit_tree_rendering_marks_cross_datacenter_edges() {
        colored::control::set_override(false);
        let fleet = fleet();
        let mut root = fleet.context(Duration::from_secs(5)).open_name("db1001.eqiad.wmnet:3306").unwrap();
        let lines = render_tree(&build_tree(&mut root));
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("RO: OFF"));
        assert!(lines[1].starts_with("+ "));
        assert!(!lines[1].contains("->"));
        assert!(lines[2].contains("(eqiad -> codfw)"));
        assert!(lines[3].starts_with("  + "));
        assert!(!lines[3].contains("->"));
    }

    #[test]
    fn unit_uptime_format() {
        assert_eq!(format_uptime(59), "00:00:59");
        assert_eq!(format_uptime(3_723), "01:02:03");
        assert_eq!(format_uptime(90_061), "1d 01:01:01");
    }

    #[test]
    fn unit_cross_datacenter_needs_both_datacenters() {
        assert!(crosses_datacenter("db1001.eqiad.wmnet", "db2001.codfw.wmnet"));
        assert!(!crosses_datacenter("db1001.eqiad.wmnet", "db1002.eqiad.wmnet"));
        assert!(!crosses_datacenter("db1001.eqiad.wmnet", "10.64.0.1"));
    }
}
