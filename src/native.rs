//! Foreign (native) function registry
//!
//! Natives are invoked by the evaluator exactly like language-defined
//! functions: evaluated arguments plus the current evaluation context,
//! which gives them the same powers — enqueue messages, create entities,
//! mutate auxiliary entity state, return promises.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{EntityDef, Expr, FuncStmt};
use crate::eval::{EvalContext, EvalError, Value};

/// A registered native callable.
pub type NativeFn =
    Arc<dyn Fn(&mut EvalContext, Vec<Value>) -> Result<Value, EvalError> + Send + Sync>;

/// Name-indexed table of native callables, built once at startup.
#[derive(Default, Clone)]
pub struct NativeRegistry {
    table: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in natives.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("print", native_print);
        registry.register("len", native_len);
        registry.register("append", native_append);
        registry.register("retire", native_retire);
        registry.register("kput", native_kput);
        registry.register("kget", native_kget);
        registry
    }

    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut EvalContext, Vec<Value>) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.table.insert(name.to_string(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.table.get(name).cloned()
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("NativeRegistry").field("names", &names).finish()
    }
}

/// Wrap natives as an entity definition: each function's body is a single
/// foreign call over its bound formals, so collaborator-facing natives are
/// addressable like any other actor.
pub fn native_entity_def(name: &str, functions: &[(&str, &[&str], &str)]) -> EntityDef {
    let mut def = EntityDef::new(name);
    for (func_name, params, native_name) in functions {
        let args = params
            .iter()
            .map(|p| Expr::Symbol((*p).to_string()))
            .collect();
        def = def.with_function(FuncStmt::new(
            *func_name,
            params.to_vec(),
            vec![Expr::Return(Box::new(Expr::Foreign {
                function: (*native_name).to_string(),
                args,
            }))],
        ));
    }
    def
}

fn native_print(_ctx: &mut EvalContext, args: Vec<Value>) -> Result<Value, EvalError> {
    let line: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    println!("{}", line.join(" "));
    Ok(Value::Nop)
}

fn native_len(_ctx: &mut EvalContext, args: Vec<Value>) -> Result<Value, EvalError> {
    match args.first() {
        Some(Value::List(items)) => Ok(Value::Number(items.len() as i64)),
        Some(Value::Str(s)) => Ok(Value::Number(s.chars().count() as i64)),
        Some(Value::Table(entries)) => Ok(Value::Number(entries.len() as i64)),
        other => Err(EvalError::TypeError(format!("len over {other:?}"))),
    }
}

fn native_append(_ctx: &mut EvalContext, mut args: Vec<Value>) -> Result<Value, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::TypeError(format!(
            "append expects (list, value), got {} arguments",
            args.len()
        )));
    }
    let value = args.pop().expect("length checked");
    match args.pop().expect("length checked") {
        Value::List(mut items) => {
            items.push(value);
            Ok(Value::List(items))
        }
        other => Err(EvalError::TypeError(format!("append to non-list {other}"))),
    }
}

/// Remove an entity of the current vat from the live table; the collector
/// destroys it once nothing reachable addresses it.
fn native_retire(ctx: &mut EvalContext, args: Vec<Value>) -> Result<Value, EvalError> {
    match args.first() {
        Some(Value::EntityRef(addr))
            if addr.node_id == ctx.vat.node_id && addr.vat_id == ctx.vat.id =>
        {
            ctx.vat.retire_entity(addr.entity_id);
            Ok(Value::Nop)
        }
        Some(Value::EntityRef(addr)) => Err(EvalError::TypeError(format!(
            "cannot retire entity {addr} owned by another vat"
        ))),
        other => Err(EvalError::TypeError(format!("retire over {other:?}"))),
    }
}

/// Store a value in the current entity's auxiliary `kdata` map, the
/// free-form store reserved for native extensions.
fn native_kput(ctx: &mut EvalContext, mut args: Vec<Value>) -> Result<Value, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::TypeError(format!(
            "kput expects (key, value), got {} arguments",
            args.len()
        )));
    }
    let value = args.pop().expect("length checked");
    let key = match args.pop().expect("length checked") {
        Value::Str(s) => s,
        other => return Err(EvalError::TypeError(format!("kput key must be a string, got {other}"))),
    };

    let entity_id = ctx.current_frame().entity_id;
    let vat_id = ctx.vat.id;
    let entity = ctx
        .vat
        .entity_mut(entity_id)
        .ok_or(EvalError::UnknownEntity { vat_id, entity_id })?;
    entity.kdata.insert(key, value);
    Ok(Value::Nop)
}

fn native_kget(ctx: &mut EvalContext, args: Vec<Value>) -> Result<Value, EvalError> {
    let key = match args.first() {
        Some(Value::Str(s)) => s.clone(),
        other => return Err(EvalError::TypeError(format!("kget key must be a string, got {other:?}"))),
    };

    let entity_id = ctx.current_frame().entity_id;
    let vat_id = ctx.vat.id;
    let entity = ctx
        .vat
        .entity(entity_id)
        .ok_or(EvalError::UnknownEntity { vat_id, entity_id })?;
    entity
        .kdata
        .get(&key)
        .cloned()
        .ok_or(EvalError::MissingKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{single_vat_fixture, Fixture};

    #[test]
    fn registry_resolves_builtins_and_misses_cleanly() {
        let registry = NativeRegistry::with_builtins();
        assert!(registry.get("len").is_some());
        assert!(registry.get("no-such-native").is_none());
    }

    #[test]
    fn len_and_append_over_lists() {
        let Fixture { node, mut vat, .. } = single_vat_fixture(vec![]);
        let mut ctx = EvalContext::new(&node, &mut vat);

        let grown = native_append(
            &mut ctx,
            vec![Value::List(vec![Value::Number(1)]), Value::Number(2)],
        )
        .unwrap();
        assert_eq!(grown, Value::List(vec![Value::Number(1), Value::Number(2)]));

        let len = native_len(&mut ctx, vec![grown]).unwrap();
        assert_eq!(len, Value::Number(2));
    }

    #[test]
    fn retire_rejects_foreign_vat_addresses() {
        let Fixture { node, mut vat, .. } = single_vat_fixture(vec![]);
        let foreign = crate::vat::EntityAddress::new(0, vat.id + 1, 0);
        let mut ctx = EvalContext::new(&node, &mut vat);
        let err = native_retire(&mut ctx, vec![Value::EntityRef(foreign)]).unwrap_err();
        assert!(matches!(err, EvalError::TypeError(_)));
    }

    #[test]
    fn kdata_round_trips_through_the_auxiliary_store() {
        let Fixture {
            node,
            mut vat,
            entity_id,
            address,
        } = single_vat_fixture(vec![]);
        let module = vat.entity(entity_id).unwrap().module.clone();
        let mut ctx = EvalContext::new(&node, &mut vat);
        ctx.push_frame(entity_id, address, module, "test");

        native_kput(
            &mut ctx,
            vec![Value::Str("marker".into()), Value::Number(5)],
        )
        .unwrap();
        let back = native_kget(&mut ctx, vec![Value::Str("marker".into())]).unwrap();
        assert_eq!(back, Value::Number(5));

        let err = native_kget(&mut ctx, vec![Value::Str("ghost".into())]).unwrap_err();
        assert_eq!(err, EvalError::MissingKey("ghost".into()));
    }

    #[test]
    fn native_entity_def_wraps_foreign_calls() {
        let def = native_entity_def("Io", &[("print", &["val"], "print")]);
        let func = def.functions.get("print").unwrap();
        assert_eq!(func.params, vec!["val"]);
        assert!(matches!(
            func.body.first(),
            Some(Expr::Return(inner)) if matches!(**inner, Expr::Foreign { .. })
        ));
    }
}
