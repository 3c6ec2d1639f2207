//! Abstract syntax tree for the actor language
//!
//! The tree arrives here already parsed and type-checked by the front end;
//! the runtime only walks it. Entity definitions are immutable templates
//! shared by every instance, so they are `Arc`-wrapped and never mutated
//! after module load.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// How a message send interacts with the caller's continuation.
///
/// `Sync` sends logically block the calling function until the reply is
/// available; `Async` sends fire and continue. Neither ever blocks an OS
/// thread — see the evaluator for how the suspension illusion is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Sync,
    Async,
}

/// Arithmetic operators. Arithmetic is wrapping signed 64-bit; `Plus`
/// doubles as string concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Plus,
    Minus,
    Times,
    Divide,
}

/// Comparison operators. Relational forms require numbers; `Eq` also
/// covers strings and booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Optional static type tag carried on formal parameters.
///
/// The runtime trusts the front end's type checking and only uses these
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Number,
    Str,
    Boolean,
    List,
    Table,
    Promise,
    Entity,
}

/// Assignment target: a plain symbol or an indexed element of a named list.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Symbol(String),
    Index { symbol: String, index: Box<Expr> },
}

/// A single `match` case: an expression pattern compared for equality, or
/// the fallthrough case taken unconditionally when reached in order.
#[derive(Debug, Clone, PartialEq)]
pub enum CasePattern {
    Expr(Expr),
    Fallthrough,
}

/// One arm of a `match`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: CasePattern,
    pub body: Vec<Expr>,
}

/// Expression and statement nodes.
///
/// A single closed sum covers both; the evaluator matches exhaustively and
/// treats any semantically impossible combination (e.g. `Return` in operand
/// position) as a fatal internal error rather than a recoverable one.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Str(String),
    Boolean(bool),
    ListLit(Vec<Expr>),
    TableLit(Vec<(String, Expr)>),
    Symbol(String),

    Op {
        op: OpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Cmp {
        op: CmpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Assign {
        target: AssignTarget,
        value: Box<Expr>,
    },
    Return(Box<Expr>),
    While {
        cond: Box<Expr>,
        body: Vec<Expr>,
    },
    For {
        bind: String,
        generator: Box<Expr>,
        body: Vec<Expr>,
    },
    Match {
        scrutinee: Box<Expr>,
        cases: Vec<MatchCase>,
    },

    /// Symbolic table access: `target.name`.
    Field {
        target: Box<Expr>,
        name: String,
    },
    /// Computed access: list position or table key from an evaluated
    /// accessor expression ("breakthrough" addressing).
    Index {
        target: Box<Expr>,
        accessor: Box<Expr>,
    },

    /// Send `function(args)` to the entity `target` evaluates to.
    Message {
        target: Box<Expr>,
        mode: CommMode,
        function: String,
        args: Vec<Expr>,
    },
    /// Instantiate a definition from the current module, optionally into a
    /// freshly allocated vat.
    CreateEntity {
        def_name: String,
        new_vat: bool,
    },
    /// Call a registered native with evaluated arguments.
    Foreign {
        function: String,
        args: Vec<Expr>,
    },
    /// Register `body` to run when the promise bound to `sym` resolves;
    /// inside the body `sym` is rebound to the resolved value.
    OnResolve {
        sym: String,
        body: Vec<Expr>,
    },

    Nop,
}

/// A function defined on an entity: formal parameters and a statement body.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncStmt {
    pub name: String,
    pub params: Vec<String>,
    /// Declared parameter types, parallel to `params` when present.
    pub param_types: Vec<TypeTag>,
    pub body: Vec<Expr>,
}

impl FuncStmt {
    pub fn new(name: impl Into<String>, params: Vec<&str>, body: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().map(String::from).collect(),
            param_types: Vec::new(),
            body,
        }
    }

    pub fn with_types(mut self, types: Vec<TypeTag>) -> Self {
        self.param_types = types;
        self
    }
}

/// Immutable entity template: functions plus declared data fields with
/// their initializer expressions. Created once per loaded module and shared
/// read-only by every instance.
///
/// A definition may declare a `create` function; it runs as the constructor
/// at instantiation time when present.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub name: String,
    pub functions: HashMap<String, FuncStmt>,
    pub data: BTreeMap<String, Expr>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_function(mut self, func: FuncStmt) -> Self {
        self.functions.insert(func.name.clone(), func);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, init: Expr) -> Self {
        self.data.insert(name.into(), init);
        self
    }
}

/// A loaded module: entity definitions plus module-level constants, the
/// outermost fallback scope for symbol resolution.
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    pub entity_defs: HashMap<String, Arc<EntityDef>>,
    pub consts: HashMap<String, crate::eval::Value>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_defs: HashMap::new(),
            consts: HashMap::new(),
        }
    }

    pub fn with_def(mut self, def: EntityDef) -> Self {
        self.entity_defs.insert(def.name.clone(), Arc::new(def));
        self
    }

    pub fn with_const(mut self, name: impl Into<String>, value: crate::eval::Value) -> Self {
        self.consts.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_def_builder_registers_functions_and_fields() {
        let def = EntityDef::new("Counter")
            .with_field("count", Expr::Number(0))
            .with_function(FuncStmt::new(
                "bump",
                vec![],
                vec![Expr::Assign {
                    target: AssignTarget::Symbol("count".into()),
                    value: Box::new(Expr::Op {
                        op: OpKind::Plus,
                        left: Box::new(Expr::Symbol("count".into())),
                        right: Box::new(Expr::Number(1)),
                    }),
                }],
            ));

        assert_eq!(def.name, "Counter");
        assert!(def.functions.contains_key("bump"));
        assert_eq!(def.data.get("count"), Some(&Expr::Number(0)));
    }

    #[test]
    fn module_builder_shares_defs() {
        let module = Module::new("demo").with_def(EntityDef::new("Echo"));
        let def = module.entity_defs.get("Echo").unwrap();
        assert_eq!(def.name, "Echo");
    }
}
