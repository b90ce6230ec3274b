//! Read-only checks against a real server.
//!
//! Set MDBREPL_TEST_INSTANCE to `host[:port]`; the connection settings are read from the
//! environment (or `.env`) like the tools do. Without it the tests return early.
use std::{collections::HashMap, env};
use mdbrepl::replication::ReplicationController;
use mdbrepl::replication_tree::{build_tree, render_tree};
use mdbrepl::utility::{CommonOptions, Settings};

fn live_instance() -> Option<ReplicationController> {
    dotenv::dotenv().ok();
    let instance = env::var("MDBREPL_TEST_INSTANCE").ok()?;
    let settings = Settings::from_options(&CommonOptions::default(), &mut HashMap::new()).unwrap();
    let context = settings.context().unwrap();
    Some(context.open_name(&instance).unwrap())
}

#[test]
fn integration_live_status() {
    let mut instance = match live_instance() {
        Some(instance) => instance,
        None => return,
    };
    let version = instance.instance.version().unwrap();
    assert!(version.0 >= 5);
    instance.instance.read_only().unwrap();
    // a server that is not a replica answers None, never an error
    instance.slave_status().unwrap();
    assert!(instance.summary().starts_with(&instance.name()));
}

#[test]
fn integration_live_tree() {
    let mut instance = match live_instance() {
        Some(instance) => instance,
        None => return,
    };
    let tree = build_tree(&mut instance);
    assert!(tree.details.is_some(), "{:?}", tree.error);
    assert!(!render_tree(&tree).is_empty());
}
