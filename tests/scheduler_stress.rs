//! Scheduler behavior under real worker threads
//!
//! Verifies the two structural guarantees: no two workers ever evaluate
//! against the same vat simultaneously, and a fatal evaluation error kills
//! exactly the worker that hit it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use schist::ast::{EntityDef, Expr, FuncStmt, Module};
use schist::eval::{instantiate, Value};
use schist::native::NativeRegistry;
use schist::runtime::{NodeConfig, NullTransport};
use schist::test_support::{request, test_node_with};

const VATS: usize = 4;
const MSGS_PER_VAT: usize = 50;

#[test]
fn no_two_workers_ever_hold_the_same_vat() {
    let active: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let mut natives = NativeRegistry::with_builtins();
    {
        let active = active.clone();
        let violations = violations.clone();
        let handled = handled.clone();
        natives.register("probe", move |ctx, _args| {
            let vat_id = ctx.vat.id;
            {
                let mut map = active.lock().unwrap();
                let entry = map.entry(vat_id).or_insert(0);
                *entry += 1;
                if *entry > 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }
            // Hold the vat long enough for overlap to be observable.
            std::thread::sleep(Duration::from_micros(200));
            *active.lock().unwrap().get_mut(&vat_id).unwrap() -= 1;
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Nop)
        });
    }

    let worker_def = EntityDef::new("Grinder").with_function(FuncStmt::new(
        "spin",
        vec!["v"],
        vec![Expr::Foreign {
            function: "probe".into(),
            args: vec![Expr::Symbol("v".into())],
        }],
    ));

    let node = test_node_with(
        NodeConfig::new(0, "stress").with_workers(VATS),
        vec![Module::new("test").with_def(worker_def)],
        natives,
        Box::new(NullTransport),
    );

    let module = node.module("test").unwrap();
    let def = module.entity_defs.get("Grinder").cloned().unwrap();

    for _ in 0..VATS {
        let mut vat = node.new_vat();
        let address = instantiate(&node, &mut vat, &def, &module).unwrap();
        for n in 0..MSGS_PER_VAT {
            node.deliver_inbound(request(
                address,
                address,
                "spin",
                vec![Value::Number(n as i64)],
                None,
            ));
        }
        node.submit_vat(vat);
    }

    let _workers = node.start_workers();

    let expected = VATS * MSGS_PER_VAT;
    let deadline = Instant::now() + Duration::from_secs(20);
    while handled.load(Ordering::SeqCst) < expected {
        assert!(
            Instant::now() < deadline,
            "only {} of {expected} messages handled before the deadline",
            handled.load(Ordering::SeqCst)
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        violations.load(Ordering::SeqCst),
        0,
        "two workers evaluated against one vat simultaneously"
    );
}

#[test]
fn fatal_message_kills_the_worker_not_the_process() {
    let node = test_node_with(
        NodeConfig::new(0, "crash").with_workers(1),
        vec![Module::new("test").with_def(EntityDef::new("Empty"))],
        NativeRegistry::with_builtins(),
        Box::new(NullTransport),
    );

    // A vat with no entities: any request dispatch is a fatal error.
    let vat = node.new_vat();
    let vat_id = vat.id;
    node.deliver_inbound(request(
        schist::vat::EntityAddress::new(0, vat_id, 0),
        schist::vat::EntityAddress::new(0, vat_id, 0),
        "anything",
        vec![],
        None,
    ));
    node.submit_vat(vat);

    let mut workers = node.start_workers();
    let worker = workers.remove(0);

    // The worker dies on the poisoned message; join returns rather than
    // hanging, and the thread did not panic.
    assert!(worker.join().is_ok());
}
