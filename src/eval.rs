//! Tree-walking evaluator
//!
//! Functions execute atomically against a single vat: the evaluator only
//! ever touches the current vat's entity state and queues, and it never
//! blocks its thread. "Synchronous" cross-vat calls are an illusion built
//! from promise registration — the send returns a promise immediately and
//! the reply is chained upstream by the router when it arrives.
//!
//! `Return` is propagated as an explicit control-flow variant ([`Flow`])
//! through nested blocks, and every fatal condition surfaces as an
//! [`EvalError`] that unwinds to the per-vat message loop, never as a
//! panic or a caught exception.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::ast::{
    AssignTarget, CasePattern, CmpKind, CommMode, EntityDef, Expr, Module, OpKind,
};
use crate::runtime::NodeContext;
use crate::vat::{
    DependPromFunc, DependTarget, Entity, EntityAddress, Msg, PromiseCallback, PromiseId, Vat,
};

/// Fatal evaluation errors. These unwind to the per-vat loop boundary and
/// terminate the worker processing the offending message; none of them are
/// caught per-statement and no mutation performed before the failure is
/// rolled back.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unbound symbol: {0}")]
    UnboundSymbol(String),
    #[error("unknown function '{function}' on entity '{entity}'")]
    UnknownFunction { entity: String, function: String },
    #[error("{entity}::{function} expects {expected} arguments, got {got}")]
    ArityMismatch {
        entity: String,
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("type error: {0}")]
    TypeError(String),
    #[error("no entity {entity_id} in vat {vat_id}")]
    UnknownEntity { vat_id: u32, entity_id: u32 },
    #[error("missing table key: {0}")]
    MissingKey(String),
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown promise id {0}")]
    UnknownPromise(PromiseId),
    #[error("promise {0} already resolved")]
    AlreadyResolved(PromiseId),
    #[error("unknown native function: {0}")]
    UnknownNative(String),
    #[error("unknown entity definition: {0}")]
    UnknownDefinition(String),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Runtime values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(i64),
    Str(String),
    Boolean(bool),
    List(Vec<Value>),
    Table(BTreeMap<String, Value>),
    EntityRef(EntityAddress),
    Promise(PromiseId),
    Nop,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Boolean(true) => write!(f, "#t"),
            Value::Boolean(false) => write!(f, "#f"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Table(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::EntityRef(addr) => write!(f, "@{addr}"),
            Value::Promise(id) => write!(f, "promise#{id}"),
            Value::Nop => write!(f, "nop"),
        }
    }
}

/// Result of evaluating a statement block: either fall through to the next
/// statement or carry a `return` out to the enclosing function boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Next(Value),
    Returned(Value),
}

type Scope = HashMap<String, Value>;

/// One entry in the transient evaluation stack: the entity the frame runs
/// against, its module, and the frame's nested lexical scopes.
#[derive(Debug)]
pub struct StackFrame {
    pub entity_id: u32,
    pub address: EntityAddress,
    pub module: Arc<Module>,
    pub function: String,
    scopes: Vec<Scope>,
}

/// Per-dispatch evaluation state. Never persisted; rebuilt for every
/// message the router hands to the evaluator.
pub struct EvalContext<'a> {
    pub node: &'a NodeContext,
    pub vat: &'a mut Vat,
    pub stack: Vec<StackFrame>,
}

impl<'a> EvalContext<'a> {
    pub fn new(node: &'a NodeContext, vat: &'a mut Vat) -> Self {
        Self {
            node,
            vat,
            stack: Vec::new(),
        }
    }

    pub fn push_frame(
        &mut self,
        entity_id: u32,
        address: EntityAddress,
        module: Arc<Module>,
        function: &str,
    ) {
        self.stack.push(StackFrame {
            entity_id,
            address,
            module,
            function: function.to_string(),
            scopes: vec![Scope::new()],
        });
    }

    pub fn pop_frame(&mut self) {
        self.stack.pop();
    }

    fn frame(&self) -> &StackFrame {
        self.stack.last().expect("evaluation outside any stack frame")
    }

    /// The frame currently being evaluated. Natives use this to reach the
    /// entity they were invoked on.
    pub fn current_frame(&self) -> &StackFrame {
        self.frame()
    }

    fn push_scope(&mut self) {
        self.stack
            .last_mut()
            .expect("evaluation outside any stack frame")
            .scopes
            .push(Scope::new());
    }

    fn pop_scope(&mut self) {
        self.stack
            .last_mut()
            .expect("evaluation outside any stack frame")
            .scopes
            .pop();
    }

    fn scope_insert(&mut self, sym: String, value: Value) {
        self.stack
            .last_mut()
            .expect("evaluation outside any stack frame")
            .scopes
            .last_mut()
            .expect("stack frame with no scope")
            .insert(sym, value);
    }

    // ------------------------------------------------------------------
    // Symbol resolution
    // ------------------------------------------------------------------

    /// Walk the scope chain innermost-out, then the entity's data fields,
    /// then the module constants (the global fallback).
    pub fn find_symbol(&self, sym: &str) -> Result<Value, EvalError> {
        let frame = self.frame();
        for scope in frame.scopes.iter().rev() {
            if let Some(v) = scope.get(sym) {
                return Ok(v.clone());
            }
        }
        if let Some(entity) = self.vat.entity(frame.entity_id) {
            if let Some(v) = entity.data.get(sym) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = frame.module.consts.get(sym) {
            return Ok(v.clone());
        }
        Err(EvalError::UnboundSymbol(sym.to_string()))
    }

    /// Assign into the innermost scope that already defines `sym`, falling
    /// through to the entity's data fields; an undefined symbol is bound in
    /// the current innermost scope (implicit declaration on first write).
    fn assign(&mut self, sym: &str, value: Value) {
        let frame = self
            .stack
            .last_mut()
            .expect("evaluation outside any stack frame");
        let entity_id = frame.entity_id;

        if let Some(scope) = frame.scopes.iter_mut().rev().find(|s| s.contains_key(sym)) {
            scope.insert(sym.to_string(), value);
            return;
        }
        if let Some(entity) = self.vat.entity_mut(entity_id) {
            if entity.data.contains_key(sym) {
                entity.data.insert(sym.to_string(), value);
                return;
            }
        }
        self.scope_insert(sym.to_string(), value);
    }

    /// Mutate one element of the list bound to `sym`, wherever it lives.
    fn assign_index(&mut self, sym: &str, index: i64, value: Value) -> Result<(), EvalError> {
        let frame = self
            .stack
            .last_mut()
            .expect("evaluation outside any stack frame");
        let entity_id = frame.entity_id;

        for scope in frame.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(sym) {
                return write_list_element(slot, index, value);
            }
        }

        match self
            .vat
            .entity_mut(entity_id)
            .and_then(|e| e.data.get_mut(sym))
        {
            Some(slot) => write_list_element(slot, index, value),
            None => Err(EvalError::UnboundSymbol(sym.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Evaluate an expression to a value. Total over all node variants;
    /// a `return` escaping into operand position is an internal error
    /// (the front end's type checking rules it out).
    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Boolean(b) => Ok(Value::Boolean(*b)),
            Expr::Nop => Ok(Value::Nop),

            Expr::ListLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::List(out))
            }
            Expr::TableLit(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    out.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Table(out))
            }

            Expr::Symbol(sym) => self.find_symbol(sym),

            Expr::Op { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.apply_op(*op, l, r)
            }
            Expr::Cmp { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.apply_cmp(*op, l, r)
            }

            Expr::Assign { target, value } => {
                let v = self.eval(value)?;
                match target {
                    AssignTarget::Symbol(sym) => self.assign(sym, v.clone()),
                    AssignTarget::Index { symbol, index } => {
                        let idx = match self.eval(index)? {
                            Value::Number(n) => n,
                            other => {
                                return Err(EvalError::TypeError(format!(
                                    "list index must be a number, got {other}"
                                )))
                            }
                        };
                        self.assign_index(symbol, idx, v.clone())?;
                    }
                }
                Ok(v)
            }

            Expr::Field { target, name } => match self.eval(target)? {
                Value::Table(entries) => entries
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::MissingKey(name.clone())),
                other => Err(EvalError::TypeError(format!(
                    "field access on non-table value {other}"
                ))),
            },

            Expr::Index { target, accessor } => {
                let t = self.eval(target)?;
                let a = self.eval(accessor)?;
                match (t, a) {
                    (Value::List(items), Value::Number(n)) => {
                        if n < 0 || n as usize >= items.len() {
                            Err(EvalError::IndexOutOfBounds {
                                index: n,
                                len: items.len(),
                            })
                        } else {
                            Ok(items[n as usize].clone())
                        }
                    }
                    (Value::Table(entries), Value::Str(key)) => entries
                        .get(&key)
                        .cloned()
                        .ok_or(EvalError::MissingKey(key)),
                    (t, a) => Err(EvalError::TypeError(format!(
                        "cannot index {t} with {a}"
                    ))),
                }
            }

            Expr::Message {
                target,
                mode,
                function,
                args,
            } => {
                let target_val = self.eval(target)?;
                let mut arg_vals = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vals.push(self.eval(arg)?);
                }
                self.eval_message_node(target_val, *mode, function, arg_vals)
            }

            Expr::CreateEntity { def_name, new_vat } => {
                let module = self.frame().module.clone();
                let def = module
                    .entity_defs
                    .get(def_name)
                    .cloned()
                    .ok_or_else(|| EvalError::UnknownDefinition(def_name.clone()))?;
                let address = self.create_entity(&def, &module, *new_vat)?;
                Ok(Value::EntityRef(address))
            }

            Expr::Foreign { function, args } => {
                let native = self
                    .node
                    .natives
                    .get(function)
                    .ok_or_else(|| EvalError::UnknownNative(function.clone()))?;
                let mut arg_vals = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vals.push(self.eval(arg)?);
                }
                native(self, arg_vals)
            }

            Expr::OnResolve { sym, body } => {
                let promise_id = match self.find_symbol(sym)? {
                    Value::Promise(id) => id,
                    other => {
                        return Err(EvalError::TypeError(format!(
                            "'{sym}' is not a promise: {other}"
                        )))
                    }
                };
                let promise = self
                    .vat
                    .promises
                    .get_mut(&promise_id)
                    .ok_or(EvalError::UnknownPromise(promise_id))?;

                if promise.resolved {
                    // Late registration is served immediately: there is no
                    // window in which a callback can wait forever on an
                    // already-delivered result.
                    let result = promise.results.first().cloned().unwrap_or(Value::Nop);
                    self.eval_block(body, vec![(sym.clone(), result)])?;
                } else {
                    promise.callbacks.push(PromiseCallback {
                        sym: sym.clone(),
                        body: body.clone(),
                    });
                }
                Ok(Value::Nop)
            }

            Expr::Return(_) | Expr::While { .. } | Expr::For { .. } | Expr::Match { .. } => {
                match self.eval_stmt(expr)? {
                    Flow::Next(v) => Ok(v),
                    Flow::Returned(_) => Err(EvalError::Internal(
                        "return escaped into expression position",
                    )),
                }
            }
        }
    }

    fn apply_op(&self, op: OpKind, l: Value, r: Value) -> Result<Value, EvalError> {
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => match op {
                OpKind::Plus => Ok(Value::Number(a.wrapping_add(b))),
                OpKind::Minus => Ok(Value::Number(a.wrapping_sub(b))),
                OpKind::Times => Ok(Value::Number(a.wrapping_mul(b))),
                OpKind::Divide => {
                    if b == 0 {
                        Err(EvalError::DivisionByZero)
                    } else {
                        Ok(Value::Number(a.wrapping_div(b)))
                    }
                }
            },
            (Value::Str(a), Value::Str(b)) if op == OpKind::Plus => Ok(Value::Str(a + &b)),
            (l, r) => Err(EvalError::TypeError(format!(
                "cannot apply {op:?} to {l} and {r}"
            ))),
        }
    }

    fn apply_cmp(&self, op: CmpKind, l: Value, r: Value) -> Result<Value, EvalError> {
        if op == CmpKind::Eq {
            return match (&l, &r) {
                (Value::Number(_), Value::Number(_))
                | (Value::Str(_), Value::Str(_))
                | (Value::Boolean(_), Value::Boolean(_)) => Ok(Value::Boolean(l == r)),
                _ => Err(EvalError::TypeError(format!("cannot compare {l} and {r}"))),
            };
        }
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Boolean(match op {
                CmpKind::Gt => a > b,
                CmpKind::Lt => a < b,
                CmpKind::Ge => a >= b,
                CmpKind::Le => a <= b,
                CmpKind::Eq => unreachable!(),
            })),
            (l, r) => Err(EvalError::TypeError(format!(
                "relational comparison needs numbers, got {l} and {r}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Statements and blocks
    // ------------------------------------------------------------------

    /// Evaluate a statement, distinguishing fall-through from `return`.
    fn eval_stmt(&mut self, stmt: &Expr) -> Result<Flow, EvalError> {
        match stmt {
            Expr::Return(expr) => {
                let v = self.eval(expr)?;
                Ok(Flow::Returned(v))
            }

            Expr::While { cond, body } => {
                loop {
                    match self.eval(cond)? {
                        Value::Boolean(true) => {}
                        Value::Boolean(false) => break,
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "while condition must be boolean, got {other}"
                            )))
                        }
                    }
                    if let Flow::Returned(v) = self.eval_block(body, vec![])? {
                        return Ok(Flow::Returned(v));
                    }
                }
                Ok(Flow::Next(Value::Nop))
            }

            Expr::For {
                bind,
                generator,
                body,
            } => {
                let items = match self.eval(generator)? {
                    Value::List(items) => items,
                    other => {
                        return Err(EvalError::TypeError(format!(
                            "for generator must be a list, got {other}"
                        )))
                    }
                };
                for item in items {
                    let flow = self.eval_block(body, vec![(bind.clone(), item)])?;
                    if let Flow::Returned(v) = flow {
                        return Ok(Flow::Returned(v));
                    }
                }
                Ok(Flow::Next(Value::Nop))
            }

            Expr::Match { scrutinee, cases } => {
                let subject = self.eval(scrutinee)?;
                for case in cases {
                    match &case.pattern {
                        CasePattern::Fallthrough => return self.eval_block(&case.body, vec![]),
                        CasePattern::Expr(pattern) => {
                            let candidate = self.eval(pattern)?;
                            let equal = match self.apply_cmp(CmpKind::Eq, subject.clone(), candidate)?
                            {
                                Value::Boolean(b) => b,
                                _ => unreachable!(),
                            };
                            if equal {
                                return self.eval_block(&case.body, vec![]);
                            }
                        }
                    }
                }
                Ok(Flow::Next(Value::Nop))
            }

            other => Ok(Flow::Next(self.eval(other)?)),
        }
    }

    /// Evaluate a statement sequence in a fresh child scope, seeding it
    /// with `bindings`. Short-circuits on the first `return`, whose
    /// expression is evaluated in the body's own scope.
    pub fn eval_block(
        &mut self,
        body: &[Expr],
        bindings: Vec<(String, Value)>,
    ) -> Result<Flow, EvalError> {
        self.push_scope();
        for (sym, value) in bindings {
            self.scope_insert(sym, value);
        }

        let mut flow = Flow::Next(Value::Nop);
        let mut failure = None;
        for stmt in body {
            match self.eval_stmt(stmt) {
                Ok(Flow::Next(_)) => {}
                Ok(returned) => {
                    flow = returned;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.pop_scope();
        match failure {
            Some(e) => Err(e),
            None => Ok(flow),
        }
    }

    // ------------------------------------------------------------------
    // Function dispatch
    // ------------------------------------------------------------------

    /// Direct invocation of a function on an entity in the current vat.
    pub fn eval_func_local(
        &mut self,
        entity_id: u32,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        let (def, module, address) = {
            let entity = self
                .vat
                .entity(entity_id)
                .ok_or(EvalError::UnknownEntity {
                    vat_id: self.vat.id,
                    entity_id,
                })?;
            (entity.def.clone(), entity.module.clone(), entity.address)
        };

        let func = def
            .functions
            .get(function)
            .ok_or_else(|| EvalError::UnknownFunction {
                entity: def.name.clone(),
                function: function.to_string(),
            })?;

        if func.params.len() != args.len() {
            return Err(EvalError::ArityMismatch {
                entity: def.name.clone(),
                function: function.to_string(),
                expected: func.params.len(),
                got: args.len(),
            });
        }

        let mut bindings: Vec<(String, Value)> = func
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect();
        bindings.push(("self".to_string(), Value::EntityRef(address)));

        self.push_frame(entity_id, address, module, function);
        let flow = self.eval_block(&func.body, bindings);
        self.pop_frame();

        match flow? {
            Flow::Next(v) | Flow::Returned(v) => Ok(v),
        }
    }

    // ------------------------------------------------------------------
    // Message sends
    // ------------------------------------------------------------------

    /// The single entry point for sending a message into the actor system.
    ///
    /// A `Sync` send to an entity of the current vat is a direct call that
    /// returns the actual value. Every other send registers a fresh promise
    /// and returns it immediately; the reply chains through the promise
    /// engine when it arrives.
    pub fn eval_message_node(
        &mut self,
        target: Value,
        mode: CommMode,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        match (mode, &target) {
            (CommMode::Sync, Value::EntityRef(addr))
                if addr.node_id == self.vat.node_id && addr.vat_id == self.vat.id =>
            {
                self.eval_func_local(addr.entity_id, function, args)
            }
            (_, Value::EntityRef(_)) | (_, Value::Promise(_)) => {
                self.send_with_promise(target, function, args)
            }
            (_, other) => Err(EvalError::TypeError(format!(
                "message target must be an entity or promise, got {other}"
            ))),
        }
    }

    /// Register a promise for an asynchronous send. When the target or any
    /// argument is an unresolved promise the send becomes a dependency
    /// join: a deferred invocation that fires exactly once, after every
    /// dependency has resolved. Already-resolved promise inputs are
    /// substituted on the spot.
    fn send_with_promise(
        &mut self,
        target: Value,
        function: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        let src = self.frame().address;

        let target = match target {
            Value::EntityRef(addr) => DependTarget::Known(addr),
            Value::Promise(pid) => {
                let promise = self
                    .vat
                    .promises
                    .get(&pid)
                    .ok_or(EvalError::UnknownPromise(pid))?;
                if promise.resolved {
                    match promise.results.first() {
                        Some(Value::EntityRef(addr)) => DependTarget::Known(*addr),
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "promise {pid} did not resolve to an entity: {other:?}"
                            )))
                        }
                    }
                } else {
                    DependTarget::Pending(pid)
                }
            }
            other => {
                return Err(EvalError::TypeError(format!(
                    "message target must be an entity or promise, got {other}"
                )))
            }
        };

        let mut depends_on: HashMap<PromiseId, usize> = HashMap::new();
        for (slot, arg) in args.iter_mut().enumerate() {
            if let Value::Promise(pid) = *arg {
                let promise = self
                    .vat
                    .promises
                    .get(&pid)
                    .ok_or(EvalError::UnknownPromise(pid))?;
                if promise.resolved {
                    *arg = promise.results.first().cloned().unwrap_or(Value::Nop);
                } else {
                    depends_on.insert(pid, slot);
                }
            }
        }

        let result_pid = self.vat.create_promise();

        if depends_on.is_empty() {
            if let DependTarget::Known(dst) = target {
                self.vat.out_messages.push_back(Msg {
                    src,
                    dst,
                    function: function.to_string(),
                    args,
                    promise_id: Some(result_pid),
                    response: false,
                });
                return Ok(Value::Promise(result_pid));
            }
        }

        // Blocked: park the invocation and register it with every promise
        // it waits on.
        let dependent_id = self.vat.alloc_dependent_id();
        let mut waiting: Vec<PromiseId> = depends_on.keys().copied().collect();
        if let DependTarget::Pending(pid) = target {
            waiting.push(pid);
        }

        self.vat.dependents.insert(
            dependent_id,
            DependPromFunc {
                promise_id: result_pid,
                target,
                function: function.to_string(),
                args,
                depends_on,
            },
        );
        for pid in waiting {
            self.vat
                .promises
                .get_mut(&pid)
                .expect("dependency promise vanished during registration")
                .dependents
                .push(dependent_id);
        }

        Ok(Value::Promise(result_pid))
    }

    // ------------------------------------------------------------------
    // Entity creation
    // ------------------------------------------------------------------

    /// Instantiate a definition, either into the current vat or into a
    /// freshly allocated one that is registered with the router and
    /// submitted to the ready queue.
    pub fn create_entity(
        &mut self,
        def: &Arc<EntityDef>,
        module: &Arc<Module>,
        new_vat: bool,
    ) -> Result<EntityAddress, EvalError> {
        if !new_vat {
            return instantiate(self.node, self.vat, def, module);
        }

        let vat_id = self.node.alloc_vat_id();
        let mut vat = Vat::new(self.node.config.node_id, vat_id);
        self.node.register_vat_inbox(vat_id, vat.inbox_sender());
        let address = instantiate(self.node, &mut vat, def, module)?;
        self.node.submit_vat(vat);
        Ok(address)
    }
}

fn write_list_element(slot: &mut Value, index: i64, value: Value) -> Result<(), EvalError> {
    match slot {
        Value::List(items) => {
            if index < 0 || index as usize >= items.len() {
                return Err(EvalError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            items[index as usize] = value;
            Ok(())
        }
        other => Err(EvalError::TypeError(format!(
            "cannot index-assign into {other}"
        ))),
    }
}

/// Create an entity inside `vat`: allocate its id, register it, evaluate
/// its field initializers, and run its `create` constructor when the
/// definition has one.
pub fn instantiate(
    node: &NodeContext,
    vat: &mut Vat,
    def: &Arc<EntityDef>,
    module: &Arc<Module>,
) -> Result<EntityAddress, EvalError> {
    let entity_id = vat.alloc_entity_id();
    let address = EntityAddress::new(vat.node_id, vat.id, entity_id);
    debug!(entity = %def.name, %address, "creating entity");

    vat.register_entity(Entity::new(def.clone(), module.clone(), address));

    let mut ctx = EvalContext::new(node, vat);
    ctx.push_frame(entity_id, address, module.clone(), "create");

    for (field, init) in &def.data {
        let value = ctx.eval(init)?;
        ctx.vat
            .entity_mut(entity_id)
            .expect("entity vanished during initialization")
            .data
            .insert(field.clone(), value);
    }

    if def.functions.contains_key("create") {
        ctx.eval_func_local(entity_id, "create", vec![])?;
    }

    Ok(address)
}
