//! Schist - a distributed actor runtime core
//!
//! Programs define entities (actors) whose functions execute atomically in
//! response to messages. Entities live in vats — single-threaded execution
//! domains scheduled across a worker pool — and communicate only by
//! message passing, with replies suspended behind promises that resolve
//! later. A per-vat mark-sweep collector reclaims entities unreachable
//! from live state or in-flight promise results.
//!
//! The front end (lexer, parser, type checker), wire serialization, and
//! socket plumbing are external collaborators: modules arrive here fully
//! built, and the network is reached through the [`runtime::Transport`]
//! seam.

pub mod ast;
pub mod eval;
pub mod gc;
pub mod native;
pub mod promise;
pub mod runtime;
pub mod test_support;
pub mod vat;

pub use ast::{CommMode, EntityDef, Expr, FuncStmt, Module, TypeTag};
pub use eval::{instantiate, EvalContext, EvalError, Flow, Value};
pub use gc::{run_gc, GcStats};
pub use native::{NativeFn, NativeRegistry};
pub use runtime::{ConfigError, NodeConfig, NodeContext, NullTransport, Transport, TransportError};
pub use vat::{EntityAddress, Msg, PromiseId, Vat};
