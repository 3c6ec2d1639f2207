//! Collector liveness through the scheduler
//!
//! The unit tests in `gc` cover mark/sweep mechanics; these exercise the
//! cycle-counter trigger and reachability through live dispatch state.

use schist::ast::{EntityDef, Module};
use schist::eval::{instantiate, Value};
use schist::native::NativeRegistry;
use schist::runtime::{NodeConfig, NullTransport};
use schist::test_support::test_node_with;

fn bare_node(gc_threshold: u32) -> std::sync::Arc<schist::runtime::NodeContext> {
    test_node_with(
        NodeConfig::new(0, "gc").with_gc_cycle_threshold(gc_threshold),
        vec![Module::new("test").with_def(EntityDef::new("Husk"))],
        NativeRegistry::with_builtins(),
        Box::new(NullTransport),
    )
}

#[test]
fn gc_runs_only_after_the_cycle_threshold_trips() {
    let node = bare_node(3);
    let module = node.module("test").unwrap();
    let def = module.entity_defs.get("Husk").cloned().unwrap();

    let mut vat = node.new_vat();
    let _keeper = instantiate(&node, &mut vat, &def, &module).unwrap();
    let doomed = instantiate(&node, &mut vat, &def, &module).unwrap();
    vat.retire_entity(doomed.entity_id);

    // Three idle cycles stay under the threshold; the husk lingers.
    for _ in 0..3 {
        node.process_vat(&mut vat).unwrap();
        assert_eq!(vat.arena_count(), 2);
    }

    // The fourth crosses it and the sweep destroys the retiree.
    node.process_vat(&mut vat).unwrap();
    assert_eq!(vat.arena_count(), 1);
    assert_eq!(vat.live_count(), 1);
}

#[test]
fn entity_addressed_by_live_data_survives_collection_cycles() {
    let node = bare_node(1);
    let module = node.module("test").unwrap();
    let def = module.entity_defs.get("Husk").cloned().unwrap();

    let mut vat = node.new_vat();
    let keeper = instantiate(&node, &mut vat, &def, &module).unwrap();
    let held = instantiate(&node, &mut vat, &def, &module).unwrap();

    vat.entity_mut(keeper.entity_id)
        .unwrap()
        .data
        .insert("held".into(), Value::EntityRef(held));
    vat.retire_entity(held.entity_id);

    for _ in 0..10 {
        node.process_vat(&mut vat).unwrap();
    }
    assert_eq!(vat.arena_count(), 2, "a held address must keep its entity");

    // Dropping the last reference makes the next pass reclaim it.
    vat.entity_mut(keeper.entity_id)
        .unwrap()
        .data
        .insert("held".into(), Value::Nop);
    for _ in 0..3 {
        node.process_vat(&mut vat).unwrap();
    }
    assert_eq!(vat.arena_count(), 1);
}

#[test]
fn entity_reachable_only_through_a_pending_promise_survives() {
    let node = bare_node(1);
    let module = node.module("test").unwrap();
    let def = module.entity_defs.get("Husk").cloned().unwrap();

    let mut vat = node.new_vat();
    let _keeper = instantiate(&node, &mut vat, &def, &module).unwrap();
    let held = instantiate(&node, &mut vat, &def, &module).unwrap();
    vat.retire_entity(held.entity_id);

    let pid = vat.create_promise();
    vat.resolve_promise(pid, vec![Value::EntityRef(held)])
        .unwrap();

    for _ in 0..10 {
        node.process_vat(&mut vat).unwrap();
    }
    assert_eq!(
        vat.arena_count(),
        2,
        "promise results are part of the root set"
    );
}
