//! Vats, entities, messages, and promise state
//!
//! A vat is the unit of concurrency isolation: a single-threaded execution
//! domain owning a set of entities, an inbound mailbox, an outbound queue,
//! and a promise table. At most one worker processes a vat at a time; the
//! scheduler enforces this by moving owned `Vat` values through a channel,
//! so no locking protects entity state.
//!
//! Entities live in an arena keyed by their stable integer id. The live
//! id-table is the subset of arena ids that messages may be dispatched to;
//! retiring an entity removes it from the live table, and the collector
//! destroys it once nothing reachable still addresses it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::ast::{EntityDef, Expr, Module};
use crate::eval::{EvalError, Value};

pub type PromiseId = u32;
pub type DependentId = u32;

/// The (node, vat, entity) triple uniquely locating an actor.
///
/// Addresses are location-transparent handles: the evaluator never follows
/// them across node boundaries itself, the router does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityAddress {
    pub node_id: u32,
    pub vat_id: u32,
    pub entity_id: u32,
}

impl EntityAddress {
    pub fn new(node_id: u32, vat_id: u32, entity_id: u32) -> Self {
        Self {
            node_id,
            vat_id,
            entity_id,
        }
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.vat_id, self.entity_id)
    }
}

/// An addressed request or reply. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub src: EntityAddress,
    pub dst: EntityAddress,
    pub function: String,
    pub args: Vec<Value>,
    /// Set when the sender expects a reply (requests) or when this message
    /// is the reply itself (responses).
    pub promise_id: Option<PromiseId>,
    pub response: bool,
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.response { "reply" } else { "call" };
        write!(
            f,
            "{} {} {} -> {} (promise {:?}, {} args)",
            kind,
            self.function,
            self.src,
            self.dst,
            self.promise_id,
            self.args.len()
        )
    }
}

/// A live actor instance. Exclusively owned by exactly one vat.
#[derive(Debug)]
pub struct Entity {
    pub def: Arc<EntityDef>,
    pub module: Arc<Module>,
    pub address: EntityAddress,
    /// Declared data fields.
    pub data: HashMap<String, Value>,
    /// Auxiliary free-form store for native extensions.
    pub kdata: HashMap<String, Value>,
}

impl Entity {
    pub fn new(def: Arc<EntityDef>, module: Arc<Module>, address: EntityAddress) -> Self {
        Self {
            def,
            module,
            address,
            data: HashMap::new(),
            kdata: HashMap::new(),
        }
    }
}

/// A callback body registered to run when a promise resolves. The resolved
/// value is rebound under `sym` inside the body's scope.
#[derive(Debug, Clone)]
pub struct PromiseCallback {
    pub sym: String,
    pub body: Vec<Expr>,
}

/// Resolution state for one outstanding asynchronous call.
///
/// Transitions pending -> resolved exactly once; a second resolution is
/// rejected and leaves the first results untouched.
#[derive(Debug, Default)]
pub struct PromiseResult {
    pub resolved: bool,
    pub results: Vec<Value>,
    pub callbacks: Vec<PromiseCallback>,
    pub dependents: Vec<DependentId>,
    /// When set, a reply to `msg`'s sender is synthesized from the resolved
    /// value (the originating request is stashed in `msg`).
    pub return_msg: bool,
    pub msg: Option<Msg>,
}

/// Where a blocked invocation will be sent once its target is known.
#[derive(Debug, Clone)]
pub enum DependTarget {
    Known(EntityAddress),
    /// The target address arrives as the resolution of this promise.
    Pending(PromiseId),
}

/// A pending invocation blocked on a set of promises.
///
/// Each entry in `depends_on` maps a promise id to the argument slot its
/// resolved value fills; the invocation becomes eligible only when every
/// slot (and the target, if pending) is satisfied.
#[derive(Debug)]
pub struct DependPromFunc {
    /// The promise that will carry this invocation's own result.
    pub promise_id: PromiseId,
    pub target: DependTarget,
    pub function: String,
    pub args: Vec<Value>,
    pub depends_on: HashMap<PromiseId, usize>,
}

impl DependPromFunc {
    /// True once the target is known and no argument slot is still waiting.
    pub fn satisfied(&self) -> bool {
        self.depends_on.is_empty() && matches!(self.target, DependTarget::Known(_))
    }
}

/// A single-threaded actor execution domain.
#[derive(Debug)]
pub struct Vat {
    pub id: u32,
    pub node_id: u32,

    entity_ids: u32,
    promise_ids: u32,
    dependent_ids: u32,

    inbox_tx: Sender<Msg>,
    inbox_rx: Receiver<Msg>,

    /// Inbound messages, strictly FIFO.
    pub messages: VecDeque<Msg>,
    /// Messages produced this round, destined elsewhere (or looped back).
    pub out_messages: VecDeque<Msg>,

    pub promises: HashMap<PromiseId, PromiseResult>,
    pub dependents: HashMap<DependentId, DependPromFunc>,

    /// Every entity created and not yet swept.
    pub(crate) arena: HashMap<u32, Entity>,
    /// Ids messages may be dispatched to; a subset of the arena.
    pub(crate) live: BTreeSet<u32>,

    pub cycles_since_gc: u32,
    /// Scheduler iterations this vat has been through.
    pub run_n: u64,
}

impl Vat {
    pub fn new(node_id: u32, id: u32) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            id,
            node_id,
            entity_ids: 0,
            promise_ids: 0,
            dependent_ids: 0,
            inbox_tx,
            inbox_rx,
            messages: VecDeque::new(),
            out_messages: VecDeque::new(),
            promises: HashMap::new(),
            dependents: HashMap::new(),
            arena: HashMap::new(),
            live: BTreeSet::new(),
            cycles_since_gc: 0,
            run_n: 0,
        }
    }

    /// Sender half of the inbox, handed to the router and to transports.
    pub fn inbox_sender(&self) -> Sender<Msg> {
        self.inbox_tx.clone()
    }

    /// Move everything currently queued on the inbox channel onto the
    /// internal FIFO. Only the worker holding the vat calls this.
    pub fn drain_inbox(&mut self) {
        while let Ok(msg) = self.inbox_rx.try_recv() {
            self.messages.push_back(msg);
        }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn alloc_entity_id(&mut self) -> u32 {
        let id = self.entity_ids;
        self.entity_ids += 1;
        id
    }

    /// Register a freshly created entity in the arena and the live table.
    pub fn register_entity(&mut self, entity: Entity) {
        let id = entity.address.entity_id;
        self.live.insert(id);
        self.arena.insert(id, entity);
    }

    /// Look up a dispatchable entity.
    pub fn entity(&self, id: u32) -> Option<&Entity> {
        if self.live.contains(&id) {
            self.arena.get(&id)
        } else {
            None
        }
    }

    pub fn entity_mut(&mut self, id: u32) -> Option<&mut Entity> {
        if self.live.contains(&id) {
            self.arena.get_mut(&id)
        } else {
            None
        }
    }

    /// Remove an entity from the live table. It stays in the arena until a
    /// sweep finds it unreachable; dispatching to it is fatal from now on.
    pub fn retire_entity(&mut self, id: u32) -> bool {
        self.live.remove(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn arena_count(&self) -> usize {
        self.arena.len()
    }

    // ------------------------------------------------------------------
    // Promises
    // ------------------------------------------------------------------

    /// Allocate the next promise id and install an empty pending entry.
    pub fn create_promise(&mut self) -> PromiseId {
        let id = self.promise_ids;
        self.promise_ids += 1;
        self.promises.insert(id, PromiseResult::default());
        id
    }

    /// Record a promise's results, flipping it to resolved.
    ///
    /// A second resolution is a logic error under the id-is-single-use
    /// contract; it is rejected without touching the stored results.
    pub fn resolve_promise(
        &mut self,
        id: PromiseId,
        results: Vec<Value>,
    ) -> Result<(), EvalError> {
        let promise = self
            .promises
            .get_mut(&id)
            .ok_or(EvalError::UnknownPromise(id))?;
        if promise.resolved {
            return Err(EvalError::AlreadyResolved(id));
        }
        promise.resolved = true;
        promise.results = results;
        Ok(())
    }

    pub fn alloc_dependent_id(&mut self) -> DependentId {
        let id = self.dependent_ids;
        self.dependent_ids += 1;
        id
    }
}
