//! mdbrepl: change and inspect the replication topology of MariaDB/MySQL replica sets.
//!
//! Tools:
//! - `move`: make a replica replicate from a sibling or from its grandparent.
//! - `stop-in-sync`: stop two sibling replicas at the same coordinate.
//! - `switchover`: promote a direct replica to master.
//! - `replication-tree`: show an instance and its replicas, recursively.
//!
//! Every tool stops at the first failed check and exits with a non-zero code.
use std::{collections::HashMap, process};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dotenv::dotenv;
use log::*;

use mdbrepl::remote::SshRunner;
use mdbrepl::replication::{GtidMode, ReplicationContext, ReplicationController};
use mdbrepl::replication_tree::{build_tree, print_tree};
use mdbrepl::switchover::{switchover, SwitchoverOptions, SwitchoverOutcome, SwitchoverReport};
use mdbrepl::utility::{ask_for_confirmation, dotenv_writer, CommonOptions, Settings};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Opts {
    #[command(subcommand)]
    tool: Tool,
    #[command(flatten)]
    common: CommonOptions,
}

#[derive(Debug, Subcommand)]
enum Tool {
    /// Move a replica below a sibling, or below the master of its master
    Move {
        /// the replica to move, host[:port]
        instance: String,
        /// the instance to replicate from, host[:port]
        new_master: String,
        /// start replication on both hosts if it was stopped
        #[arg(long)]
        start_if_stopped: bool,
        /// do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Stop the SQL threads of two sibling replicas at the same coordinate
    StopInSync {
        instance1: String,
        instance2: String,
    },
    /// Promote a direct replica of the master to be the new master
    Switchover {
        /// the current master, host[:port]
        master: String,
        /// the replica to promote, host[:port]
        replica: String,
        /// do not move the other replicas below the promoted replica
        #[arg(long)]
        skip_slave_move: bool,
        /// only move the other replicas below the promoted replica
        #[arg(long)]
        only_slave_move: bool,
        /// do not move the heartbeat daemon
        #[arg(long)]
        skip_heartbeat: bool,
        /// the master replicates from another instance, move that replication to the new master
        #[arg(long)]
        replicating_master: bool,
        /// the master is read only and stays read only, and so will the new master
        #[arg(long)]
        read_only_master: bool,
        /// do not ask for confirmation before touching the master
        #[arg(long)]
        force: bool,
        /// print the report as json
        #[arg(long)]
        json: bool,
    },
    /// Show an instance and its replicas, recursively
    ReplicationTree {
        instance: String,
        /// print the tree as json
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv().ok();
    let options = Opts::parse();

    let mut changed_options = HashMap::new();
    let settings = Settings::from_options(&options.common, &mut changed_options)?;
    dotenv_writer(options.common.write_dotenv, changed_options)?;
    let context = settings.context()?;

    let success = match options.tool {
        Tool::Move { instance, new_master, start_if_stopped, force } => {
            run_move(&context, &instance, &new_master, start_if_stopped, force)?
        }
        Tool::StopInSync { instance1, instance2 } => run_stop_in_sync(&context, &instance1, &instance2)?,
        Tool::Switchover { master, replica, skip_slave_move, only_slave_move, skip_heartbeat, replicating_master, read_only_master, force, json } => {
            let switchover_options = SwitchoverOptions {
                timeout: settings.timeout,
                skip_slave_move,
                only_slave_move,
                skip_heartbeat,
                replicating_master,
                read_only_master,
                parallel: settings.parallel,
            };
            let runner = SshRunner::new(&settings.remote_shell);
            run_switchover(&context, &runner, &master, &replica, &switchover_options, force, json)?
        }
        Tool::ReplicationTree { instance, json } => {
            let mut root = open(&context, &instance)?;
            let tree = build_tree(&mut root);
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print_tree(&tree);
            }
            true
        }
    };
    if !success {
        process::exit(2);
    }
    Ok(())
}

fn open(
    context: &ReplicationContext,
    instance: &str,
) -> Result<ReplicationController>
{
    context.open_name(instance)
        .with_context(|| format!("could not connect to {}", instance))
}

fn confirm(question: &str) -> bool {
    match ask_for_confirmation(question) {
        Ok(answer) => answer,
        Err(e) => {
            error!("{:#}", e);
            false
        }
    }
}

/// Move with GTID disabled on both hosts, restoring the previous modes afterwards.
fn run_move(
    context: &ReplicationContext,
    instance: &str,
    new_master: &str,
    start_if_stopped: bool,
    force: bool,
) -> Result<bool>
{
    let mut instance = open(context, instance)?;
    let mut new_master = open(context, new_master)?;
    println!("{}", instance.summary());
    println!("{}", new_master.summary());
    if !force && !confirm(&format!("Move {} to replicate from {}?", instance.name(), new_master.name())) {
        println!("Aborting, nothing was changed.");
        return Ok(true);
    }

    let instance_mode = instance.gtid_mode()?;
    let new_master_mode = new_master.gtid_mode()?;
    for (controller, mode) in [(&mut instance, instance_mode), (&mut new_master, new_master_mode)] {
        if matches!(mode, Some(mode) if mode != GtidMode::No) {
            controller.set_gtid_mode(GtidMode::No)?;
        }
    }

    let moved = instance.move_to(&mut new_master, start_if_stopped);

    for (controller, mode) in [(&mut instance, instance_mode), (&mut new_master, new_master_mode)] {
        if let Some(mode) = mode.filter(|mode| *mode != GtidMode::No) {
            if let Err(e) = controller.set_gtid_mode(mode) {
                warn!("{}: could not restore gtid mode {}: {}", controller.name(), mode, e);
            }
        }
    }

    moved.with_context(|| format!("{} was not moved", instance.name()))?;
    println!("{}", instance.summary());
    println!("{}", new_master.summary());
    Ok(true)
}

fn run_stop_in_sync(
    context: &ReplicationContext,
    instance1: &str,
    instance2: &str,
) -> Result<bool>
{
    let mut instance1 = open(context, instance1)?;
    let mut instance2 = open(context, instance2)?;
    let coordinate = instance1.stop_in_sync_with_sibling(&mut instance2)?;
    println!("{} and {} stopped at {}", instance1.name(), instance2.name(), coordinate);
    println!("{}", instance1.summary());
    println!("{}", instance2.summary());
    Ok(true)
}

fn run_switchover(
    context: &ReplicationContext,
    runner: &SshRunner,
    master: &str,
    replica: &str,
    options: &SwitchoverOptions,
    force: bool,
    json: bool,
) -> Result<bool>
{
    let mut master = open(context, master)?;
    let mut replica = open(context, replica)?;
    let question = format!("Replicas moved. Continue with the switchover from {} to {}?", master.name(), replica.name());
    let mut ask = || force || confirm(&question);

    let report = switchover(&mut master, &mut replica, runner, options, &mut ask)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.outcome != SwitchoverOutcome::Promoted || report.verified)
}

fn print_report(report: &SwitchoverReport) {
    match report.outcome {
        SwitchoverOutcome::NotConfirmed => println!("Switchover from {} to {} aborted, {} was not touched.", report.master, report.replica, report.master),
        SwitchoverOutcome::OnlyReplicasMoved => println!("Replicas of {} moved below {}.", report.master, report.replica),
        SwitchoverOutcome::Promoted => println!("{} is the new master, {} replicates from it.", report.replica.green(), report.master),
    }
    if !report.moved_replicas.is_empty() {
        println!("moved replicas: {}", report.moved_replicas.join(", "));
    }
    if let (Some(replica_coordinate), Some(new_master_coordinate)) = (&report.replica_coordinate, &report.new_master_coordinate) {
        println!("switched at {} of {}, {} of {}", replica_coordinate, report.master, new_master_coordinate, report.replica);
    }
    if let Some(heartbeat) = &report.heartbeat {
        println!("heartbeat: section {}, datacenter {}", heartbeat.section, heartbeat.datacenter);
    }
    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow(), warning);
    }
    if report.outcome == SwitchoverOutcome::Promoted {
        if report.verified {
            println!("{}", "SUCCESS: switchover verified".green());
        } else {
            println!("{}", "ERROR: the switchover completed, but not every check passed".red());
        }
    }
}
