//! Test support infrastructure
//!
//! Builders for small entity definitions, a deterministic single-threaded
//! pump loop, and recording doubles for the transport and native seams.
//! Tests drive the runtime with hand-built definition trees, the same
//! shape the module loader hands over in production.

use std::sync::{Arc, Mutex};

use crate::ast::{EntityDef, Expr, FuncStmt, Module};
use crate::eval::{instantiate, EvalError, Value};
use crate::native::NativeRegistry;
use crate::runtime::{NodeConfig, NodeContext, NullTransport, Transport, TransportError};
use crate::vat::{EntityAddress, Msg, Vat};

/// A node, one vat, and one instantiated entity ready for dispatch.
pub struct Fixture {
    pub node: Arc<NodeContext>,
    pub vat: Vat,
    pub entity_id: u32,
    pub address: EntityAddress,
}

/// A node with builtin natives, a null transport, and the given modules.
pub fn test_node(modules: Vec<Module>) -> Arc<NodeContext> {
    test_node_with(
        NodeConfig::new(0, "test-node"),
        modules,
        NativeRegistry::with_builtins(),
        Box::new(NullTransport),
    )
}

pub fn test_node_with(
    config: NodeConfig,
    modules: Vec<Module>,
    natives: NativeRegistry,
    transport: Box<dyn Transport>,
) -> Arc<NodeContext> {
    NodeContext::new(config, modules, natives, transport).expect("test config must validate")
}

/// One vat hosting a `Probe` entity with a `count` field initialized to 0
/// and the given functions.
pub fn single_vat_fixture(funcs: Vec<FuncStmt>) -> Fixture {
    let mut def = EntityDef::new("Probe").with_field("count", Expr::Number(0));
    for func in funcs {
        def = def.with_function(func);
    }
    let module = Module::new("test").with_def(def);

    let node = test_node(vec![module]);
    let module = node.module("test").expect("test module registered");
    let def = module
        .entity_defs
        .get("Probe")
        .cloned()
        .expect("probe def registered");

    let mut vat = node.new_vat();
    let address = instantiate(&node, &mut vat, &def, &module).expect("instantiation succeeds");

    Fixture {
        node,
        vat,
        entity_id: address.entity_id,
        address,
    }
}

/// Process the given vats round-robin until a full round moves nothing.
pub fn pump(node: &NodeContext, vats: &mut [Vat]) -> Result<(), EvalError> {
    for _ in 0..10_000 {
        let mut processed = 0;
        for vat in vats.iter_mut() {
            processed += node.process_vat(vat)?;
        }
        if processed == 0 {
            return Ok(());
        }
    }
    panic!("vats did not quiesce within 10000 rounds");
}

/// Build a request message.
pub fn request(
    src: EntityAddress,
    dst: EntityAddress,
    function: &str,
    args: Vec<Value>,
    promise_id: Option<u32>,
) -> Msg {
    Msg {
        src,
        dst,
        function: function.to_string(),
        args,
        promise_id,
        response: false,
    }
}

/// An echo actor: `ping(payload)` returns the payload unchanged.
pub fn echo_def() -> EntityDef {
    EntityDef::new("Echo").with_function(FuncStmt::new(
        "ping",
        vec!["payload"],
        vec![Expr::Return(Box::new(Expr::Symbol("payload".into())))],
    ))
}

/// Transport double that records every message instead of delivering it.
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<Msg>>>,
}

impl RecordingTransport {
    /// Returns the transport and a handle to its log.
    pub fn new() -> (Self, Arc<Mutex<Vec<Msg>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (Self { sent: sent.clone() }, sent)
    }
}

impl Transport for RecordingTransport {
    fn deliver(&self, msg: Msg) -> Result<(), TransportError> {
        self.sent.lock().expect("transport log poisoned").push(msg);
        Ok(())
    }
}

/// A native that appends its first argument to a shared log. Useful for
/// observing dispatch order and payloads from inside handlers.
pub fn recording_native(registry: &mut NativeRegistry, name: &str) -> Arc<Mutex<Vec<Value>>> {
    let log: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    registry.register(name, move |_ctx, args| {
        sink.lock()
            .expect("recording log poisoned")
            .push(args.into_iter().next().unwrap_or(Value::Nop));
        Ok(Value::Nop)
    });
    log
}
