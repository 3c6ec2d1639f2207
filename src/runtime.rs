//! Node context, message router, and worker scheduler
//!
//! A node hosts many vats and a fixed pool of worker threads. Workers pull
//! owned `Vat` values off one shared blocking queue, so holding the vat IS
//! the exclusivity token: no two workers can ever evaluate against the
//! same vat, and no lock guards entity state.
//!
//! Each scheduler iteration drains the vat's available inbound messages to
//! completion, routes its outbound messages (looping same-vat traffic
//! straight back without touching the transport), and re-enqueues the vat —
//! continuous round-robin rather than event-driven wakeups.
//!
//! A fatal evaluation error is logged with the offending message's full
//! addressing info and kills the worker that hit it: the unit of failure
//! is the unit of concurrency, not the whole process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::ast::Module;
use crate::eval::{EvalContext, EvalError, Value};
use crate::gc;
use crate::native::NativeRegistry;
use crate::promise;
use crate::vat::{Msg, Vat};

/// Startup validation failures, surfaced to the process entry point before
/// any worker starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node name must not be empty")]
    EmptyNodeName,
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("gc cycle threshold must be at least 1")]
    BadGcThreshold,
}

/// Validated node identity and scheduler tuning.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u32,
    pub node_name: String,
    pub workers: usize,
    /// Scheduler iterations between collection passes on each vat.
    pub gc_cycle_threshold: u32,
    /// The distinguished entry function, never replied to.
    pub entry_function: String,
}

impl NodeConfig {
    pub fn new(node_id: u32, node_name: impl Into<String>) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            workers: 1,
            gc_cycle_threshold: 500,
            entry_function: "main".to_string(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_gc_cycle_threshold(mut self, threshold: u32) -> Self {
        self.gc_cycle_threshold = threshold;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.gc_cycle_threshold == 0 {
            return Err(ConfigError::BadGcThreshold);
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to node {0}")]
    NoRoute(u32),
    #[error("transport failure: {0}")]
    Failed(String),
}

/// The seam to the network layer. The router hands it every message
/// addressed to another node; the transport delivers inbound messages by
/// calling [`NodeContext::deliver_inbound`].
pub trait Transport: Send + Sync {
    fn deliver(&self, msg: Msg) -> Result<(), TransportError>;
}

/// A node with no peers: every remote destination is a route miss.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn deliver(&self, msg: Msg) -> Result<(), TransportError> {
        Err(TransportError::NoRoute(msg.dst.node_id))
    }
}

/// Everything a node's workers and evaluator share: validated config,
/// loaded modules, the native registry, and the two cross-worker queues.
/// Built once at startup and passed by `Arc` — there are no ambient
/// globals.
pub struct NodeContext {
    pub config: NodeConfig,
    pub modules: HashMap<String, Arc<Module>>,
    pub natives: NativeRegistry,

    vat_ids: AtomicU32,

    ready_tx: Sender<Vat>,
    ready_rx: Receiver<Vat>,

    net_out_tx: Sender<Msg>,
    net_out_rx: Receiver<Msg>,

    inboxes: RwLock<HashMap<u32, Sender<Msg>>>,
    transport: Box<dyn Transport>,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        modules: Vec<Module>,
        natives: NativeRegistry,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (ready_tx, ready_rx) = unbounded();
        let (net_out_tx, net_out_rx) = unbounded();
        Ok(Arc::new(Self {
            config,
            modules: modules
                .into_iter()
                .map(|m| (m.name.clone(), Arc::new(m)))
                .collect(),
            natives,
            vat_ids: AtomicU32::new(0),
            ready_tx,
            ready_rx,
            net_out_tx,
            net_out_rx,
            inboxes: RwLock::new(HashMap::new()),
            transport,
        }))
    }

    pub fn module(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn alloc_vat_id(&self) -> u32 {
        self.vat_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a vat and register its inbox with the router.
    pub fn new_vat(&self) -> Vat {
        let vat = Vat::new(self.config.node_id, self.alloc_vat_id());
        self.register_vat_inbox(vat.id, vat.inbox_sender());
        vat
    }

    pub fn register_vat_inbox(&self, vat_id: u32, sender: Sender<Msg>) {
        self.inboxes
            .write()
            .expect("inbox registry lock poisoned")
            .insert(vat_id, sender);
    }

    /// Hand a vat to the scheduler's ready queue (non-blocking).
    pub fn submit_vat(&self, vat: Vat) {
        self.ready_tx.send(vat).expect("ready queue closed");
    }

    /// Messages queued for the network layer and not yet pumped.
    pub fn net_out_pending(&self) -> usize {
        self.net_out_rx.len()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Deliver a message arriving from the transport (or from embedding
    /// code) into the destination vat's inbox. A request for an
    /// unregistered vat is answered with a synthesized not-found response —
    /// no entity lookup or dispatch happens.
    pub fn deliver_inbound(&self, msg: Msg) {
        let sender = self
            .inboxes
            .read()
            .expect("inbox registry lock poisoned")
            .get(&msg.dst.vat_id)
            .cloned();
        match sender {
            Some(tx) => {
                if let Err(e) = tx.send(msg) {
                    warn!(msg = %e.into_inner(), "inbox gone, message dropped");
                }
            }
            None => {
                warn!(%msg, "no vat registered for destination");
                if !msg.response {
                    self.route_response(promise::create_response(
                        &msg,
                        Value::Str("not-found".into()),
                    ));
                }
            }
        }
    }

    /// Route a synthesized response without generating further synthetic
    /// traffic on a miss.
    fn route_response(&self, msg: Msg) {
        if msg.dst.node_id == self.config.node_id {
            let sender = self
                .inboxes
                .read()
                .expect("inbox registry lock poisoned")
                .get(&msg.dst.vat_id)
                .cloned();
            match sender {
                Some(tx) => {
                    if let Err(e) = tx.send(msg) {
                        warn!(msg = %e.into_inner(), "inbox gone, response dropped");
                    }
                }
                None => warn!(%msg, "response dropped: unknown local vat"),
            }
        } else {
            self.net_out_tx.send(msg).expect("net-out queue closed");
        }
    }

    /// Drain a vat's outbound queue: same node+vat loops straight back to
    /// its own inbound queue, same-node traffic goes to the sibling vat's
    /// inbox, everything else to the network queue.
    fn route_outbound(&self, vat: &mut Vat) {
        while let Some(msg) = vat.out_messages.pop_front() {
            if msg.dst.node_id == self.config.node_id && msg.dst.vat_id == vat.id {
                vat.messages.push_back(msg);
            } else if msg.dst.node_id == self.config.node_id {
                self.deliver_inbound(msg);
            } else {
                self.net_out_tx.send(msg).expect("net-out queue closed");
            }
        }
    }

    /// Hand queued network-bound messages to the transport. A route miss
    /// on a request synthesizes a not-found response back to the sender.
    pub fn pump_net_out(&self) -> usize {
        let mut delivered = 0;
        while let Ok(msg) = self.net_out_rx.try_recv() {
            delivered += 1;
            match self.transport.deliver(msg.clone()) {
                Ok(()) => {}
                Err(e) => {
                    warn!(error = %e, %msg, "outbound delivery failed");
                    if !msg.response {
                        self.route_response(promise::create_response(
                            &msg,
                            Value::Str("not-found".into()),
                        ));
                    }
                }
            }
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// One scheduler iteration for one vat: GC when the cycle counter
    /// trips, drain inbound to completion, then route outbound. Returns
    /// the number of messages processed.
    pub fn process_vat(&self, vat: &mut Vat) -> Result<usize, EvalError> {
        vat.run_n += 1;
        vat.cycles_since_gc += 1;
        if vat.cycles_since_gc > self.config.gc_cycle_threshold {
            gc::run_gc(vat);
            vat.cycles_since_gc = 0;
        }

        vat.drain_inbox();

        let mut processed = 0;
        while let Some(msg) = vat.messages.pop_front() {
            processed += 1;
            debug!(%msg, vat = vat.id, "processing");
            if let Err(e) = self.handle_message(vat, &msg) {
                error!(
                    error = %e,
                    function = %msg.function,
                    src = %msg.src,
                    dst = %msg.dst,
                    promise = ?msg.promise_id,
                    "fatal error while processing message"
                );
                return Err(e);
            }
        }

        self.route_outbound(vat);
        Ok(processed)
    }

    fn handle_message(&self, vat: &mut Vat, msg: &Msg) -> Result<(), EvalError> {
        if msg.response {
            return promise::deliver_reply(self, vat, msg);
        }

        let entity_id = msg.dst.entity_id;
        if vat.entity(entity_id).is_none() {
            return Err(EvalError::UnknownEntity {
                vat_id: vat.id,
                entity_id,
            });
        }

        let result = {
            let mut ctx = EvalContext::new(self, vat);
            ctx.eval_func_local(entity_id, &msg.function, msg.args.clone())?
        };

        match result {
            Value::Promise(pid) => {
                let pending = vat
                    .promises
                    .get_mut(&pid)
                    .ok_or(EvalError::UnknownPromise(pid))?;
                if pending.resolved {
                    let value = pending.results.first().cloned().unwrap_or(Value::Nop);
                    if msg.function != self.config.entry_function {
                        vat.out_messages
                            .push_back(promise::create_response(msg, value));
                    }
                } else {
                    // Defer the reply until this promise resolves.
                    pending.return_msg = true;
                    pending.msg = Some(msg.clone());
                }
            }
            value => {
                if msg.function != self.config.entry_function {
                    vat.out_messages
                        .push_back(promise::create_response(msg, value));
                }
            }
        }
        Ok(())
    }

    /// Start the configured number of worker threads. Workers run until a
    /// fatal evaluation error kills them; they are not joined on shutdown.
    pub fn start_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|n| {
                let node = Arc::clone(self);
                thread::Builder::new()
                    .name(format!("{}-worker-{n}", node.config.node_name))
                    .spawn(move || worker_loop(&node))
                    .expect("failed to spawn worker thread")
            })
            .collect()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("config", &self.config)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Pull ready vats until the queue closes or a fatal error ends this
/// worker. The error has already been logged with full message context;
/// the vat it was processing dies with the worker.
fn worker_loop(node: &NodeContext) {
    loop {
        let mut vat = match node.ready_rx.recv() {
            Ok(vat) => vat,
            Err(_) => return,
        };
        match node.process_vat(&mut vat) {
            Ok(_) => node.submit_vat(vat),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vat::EntityAddress;

    #[test]
    fn config_validation_catches_bad_settings() {
        assert_eq!(
            NodeContext::new(
                NodeConfig::new(0, ""),
                vec![],
                NativeRegistry::new(),
                Box::new(NullTransport),
            )
            .err(),
            Some(ConfigError::EmptyNodeName)
        );

        assert_eq!(
            NodeContext::new(
                NodeConfig::new(0, "alpha").with_workers(0),
                vec![],
                NativeRegistry::new(),
                Box::new(NullTransport),
            )
            .err(),
            Some(ConfigError::NoWorkers)
        );

        assert_eq!(
            NodeContext::new(
                NodeConfig::new(0, "alpha").with_gc_cycle_threshold(0),
                vec![],
                NativeRegistry::new(),
                Box::new(NullTransport),
            )
            .err(),
            Some(ConfigError::BadGcThreshold)
        );
    }

    #[test]
    fn vat_ids_are_unique_across_allocations() {
        let node = NodeContext::new(
            NodeConfig::new(0, "alpha"),
            vec![],
            NativeRegistry::new(),
            Box::new(NullTransport),
        )
        .unwrap();
        let a = node.new_vat();
        let b = node.new_vat();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn inbound_request_for_unknown_vat_synthesizes_not_found() {
        let node = NodeContext::new(
            NodeConfig::new(0, "alpha"),
            vec![],
            NativeRegistry::new(),
            Box::new(NullTransport),
        )
        .unwrap();
        let mut caller = node.new_vat();

        node.deliver_inbound(Msg {
            src: EntityAddress::new(0, caller.id, 0),
            dst: EntityAddress::new(0, 999, 0),
            function: "lookup".into(),
            args: vec![],
            promise_id: Some(4),
            response: false,
        });

        caller.drain_inbox();
        let reply = caller.messages.pop_front().unwrap();
        assert!(reply.response);
        assert_eq!(reply.promise_id, Some(4));
        assert_eq!(reply.args, vec![Value::Str("not-found".into())]);
    }

    #[test]
    fn inbound_response_for_unknown_vat_is_dropped_without_echo() {
        let node = NodeContext::new(
            NodeConfig::new(0, "alpha"),
            vec![],
            NativeRegistry::new(),
            Box::new(NullTransport),
        )
        .unwrap();

        node.deliver_inbound(Msg {
            src: EntityAddress::new(0, 1, 0),
            dst: EntityAddress::new(0, 999, 0),
            function: "f".into(),
            args: vec![],
            promise_id: Some(1),
            response: true,
        });

        assert_eq!(node.net_out_pending(), 0);
    }

    #[test]
    fn route_miss_on_pump_synthesizes_not_found_for_requests() {
        let node = NodeContext::new(
            NodeConfig::new(0, "alpha"),
            vec![],
            NativeRegistry::new(),
            Box::new(NullTransport),
        )
        .unwrap();
        let mut caller = node.new_vat();

        let mut vat = node.new_vat();
        vat.out_messages.push_back(Msg {
            src: EntityAddress::new(0, caller.id, 0),
            dst: EntityAddress::new(7, 0, 0),
            function: "far".into(),
            args: vec![],
            promise_id: Some(2),
            response: false,
        });
        node.route_outbound(&mut vat);
        assert_eq!(node.net_out_pending(), 1);

        node.pump_net_out();
        assert_eq!(node.net_out_pending(), 0);

        caller.drain_inbox();
        let reply = caller.messages.pop_front().unwrap();
        assert!(reply.response);
        assert_eq!(reply.args, vec![Value::Str("not-found".into())]);
    }
}
