//! Per-vat mark-sweep collection
//!
//! Runs synchronously on the worker thread holding the vat, between
//! message-processing rounds; other vats keep running on other workers.
//! Marks live in a side table over the arena's id space, so shared
//! definition trees stay immutable and nothing is freed out from under a
//! live reference — destruction is removal from the arena.
//!
//! The root set is the vat's live id-table extended with everything an
//! in-flight resolution could still touch: pending promise results,
//! stashed request payloads, dependency-join argument lists, and queued
//! messages. Same-vat entity references found while walking values are
//! edges: an address held by reachable state keeps its entity alive.

use std::collections::HashSet;

use tracing::debug;

use crate::eval::Value;
use crate::vat::{DependTarget, Vat};

/// What one collection pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub live: usize,
    pub swept: usize,
}

/// Collect same-vat entity edges out of a value, recursing through lists
/// and tables (the composite value forms).
fn value_edges(value: &Value, node_id: u32, vat_id: u32, out: &mut Vec<u32>) {
    match value {
        Value::List(items) => {
            for item in items {
                value_edges(item, node_id, vat_id, out);
            }
        }
        Value::Table(entries) => {
            for item in entries.values() {
                value_edges(item, node_id, vat_id, out);
            }
        }
        Value::EntityRef(addr) if addr.node_id == node_id && addr.vat_id == vat_id => {
            out.push(addr.entity_id);
        }
        _ => {}
    }
}

/// One mark-sweep pass over `vat`'s entity arena.
pub fn run_gc(vat: &mut Vat) -> GcStats {
    let node_id = vat.node_id;
    let vat_id = vat.id;

    let mut pending: Vec<u32> = vat.live.iter().copied().collect();

    for promise in vat.promises.values() {
        for value in &promise.results {
            value_edges(value, node_id, vat_id, &mut pending);
        }
        if let Some(msg) = &promise.msg {
            for value in &msg.args {
                value_edges(value, node_id, vat_id, &mut pending);
            }
        }
    }
    for dependent in vat.dependents.values() {
        for value in &dependent.args {
            value_edges(value, node_id, vat_id, &mut pending);
        }
        if let DependTarget::Known(addr) = dependent.target {
            if addr.node_id == node_id && addr.vat_id == vat_id {
                pending.push(addr.entity_id);
            }
        }
    }
    for msg in vat.messages.iter().chain(vat.out_messages.iter()) {
        for value in &msg.args {
            value_edges(value, node_id, vat_id, &mut pending);
        }
    }

    let mut marked: HashSet<u32> = HashSet::new();
    while let Some(id) = pending.pop() {
        if !marked.insert(id) {
            continue;
        }
        if let Some(entity) = vat.arena.get(&id) {
            for value in entity.data.values().chain(entity.kdata.values()) {
                value_edges(value, node_id, vat_id, &mut pending);
            }
        }
    }

    let before = vat.arena.len();
    vat.arena.retain(|id, _| marked.contains(id));

    let stats = GcStats {
        live: vat.arena.len(),
        swept: before - vat.arena.len(),
    };
    debug!(vat = vat_id, live = stats.live, swept = stats.swept, "gc pass");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{single_vat_fixture, Fixture};
    use crate::vat::{EntityAddress, Msg};

    /// Add a bare extra entity to the fixture vat, reusing its def.
    fn extra_entity(vat: &mut Vat) -> u32 {
        let def = vat.entity(0).unwrap().def.clone();
        let module = vat.entity(0).unwrap().module.clone();
        let id = vat.alloc_entity_id();
        let address = EntityAddress::new(vat.node_id, vat.id, id);
        vat.register_entity(crate::vat::Entity::new(def, module, address));
        id
    }

    #[test]
    fn live_entities_survive_a_pass() {
        let Fixture { mut vat, .. } = single_vat_fixture(vec![]);
        let stats = run_gc(&mut vat);
        assert_eq!(stats.swept, 0);
        assert_eq!(stats.live, 1);
    }

    #[test]
    fn retired_unreachable_entity_is_destroyed_exactly_once() {
        let Fixture { mut vat, .. } = single_vat_fixture(vec![]);
        let doomed = extra_entity(&mut vat);
        vat.retire_entity(doomed);

        let first = run_gc(&mut vat);
        assert_eq!(first.swept, 1);
        assert_eq!(vat.arena_count(), 1);

        let second = run_gc(&mut vat);
        assert_eq!(second.swept, 0);
    }

    #[test]
    fn retired_entity_addressed_by_live_data_survives() {
        let Fixture {
            mut vat, entity_id, ..
        } = single_vat_fixture(vec![]);
        let referenced = extra_entity(&mut vat);
        let referenced_addr = vat.entity(referenced).unwrap().address;

        // Keeper holds the address nested inside a list.
        vat.entity_mut(entity_id).unwrap().data.insert(
            "friend".into(),
            Value::List(vec![Value::EntityRef(referenced_addr)]),
        );
        vat.retire_entity(referenced);

        let stats = run_gc(&mut vat);
        assert_eq!(stats.swept, 0);
        assert_eq!(vat.arena_count(), 2);
    }

    #[test]
    fn pending_promise_results_are_roots() {
        let Fixture { mut vat, .. } = single_vat_fixture(vec![]);
        let referenced = extra_entity(&mut vat);
        let referenced_addr = vat.entity(referenced).unwrap().address;
        vat.retire_entity(referenced);

        let pid = vat.create_promise();
        vat.resolve_promise(pid, vec![Value::EntityRef(referenced_addr)])
            .unwrap();

        let stats = run_gc(&mut vat);
        assert_eq!(stats.swept, 0);
        assert_eq!(vat.arena_count(), 2);
    }

    #[test]
    fn queued_message_payloads_are_roots() {
        let Fixture { mut vat, .. } = single_vat_fixture(vec![]);
        let referenced = extra_entity(&mut vat);
        let referenced_addr = vat.entity(referenced).unwrap().address;
        vat.retire_entity(referenced);

        vat.messages.push_back(Msg {
            src: EntityAddress::new(0, vat.id, 0),
            dst: EntityAddress::new(0, vat.id, 0),
            function: "f".into(),
            args: vec![Value::EntityRef(referenced_addr)],
            promise_id: None,
            response: false,
        });

        let stats = run_gc(&mut vat);
        assert_eq!(stats.swept, 0);
    }

    #[test]
    fn cross_vat_references_are_not_edges() {
        let Fixture {
            mut vat, entity_id, ..
        } = single_vat_fixture(vec![]);
        let doomed = extra_entity(&mut vat);
        vat.retire_entity(doomed);

        // An address into another vat must not keep local entity ids alive,
        // even when the raw entity id collides.
        let other_vat = vat.id + 1;
        vat.entity_mut(entity_id).unwrap().data.insert(
            "elsewhere".into(),
            Value::EntityRef(EntityAddress::new(0, other_vat, doomed)),
        );

        let stats = run_gc(&mut vat);
        assert_eq!(stats.swept, 1);
    }
}
