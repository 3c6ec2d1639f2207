//! Promise resolution and dependency joins
//!
//! A promise is created whenever a message send expects a reply. This
//! module handles the other half: a `response` message arriving at the
//! vat that registered the promise. Resolution runs registered callback
//! bodies, feeds dependency joins, and — when the promise was itself
//! standing in for an upstream reply — synthesizes the response message
//! that completes the original "synchronous" call.

use std::mem;

use tracing::warn;

use crate::eval::{EvalContext, EvalError, Value};
use crate::runtime::NodeContext;
use crate::vat::{DependTarget, Msg, Vat};

/// Build the reply to `request` carrying `value`. Source and destination
/// are swapped and the request's promise id is echoed so the requester's
/// vat can find the promise to resolve.
pub fn create_response(request: &Msg, value: Value) -> Msg {
    Msg {
        src: request.dst,
        dst: request.src,
        function: request.function.clone(),
        args: vec![value],
        promise_id: request.promise_id,
        response: true,
    }
}

/// Process a reply delivered to `vat`.
///
/// A reply for an unknown promise id is silently discarded — the caller is
/// no longer interested. A second resolution of an already-resolved
/// promise is rejected defensively without touching the stored results.
/// Otherwise the promise flips to resolved exactly once and its callbacks,
/// dependents, and deferred upstream reply all fire in that order, in this
/// same scheduler iteration.
pub fn deliver_reply(node: &NodeContext, vat: &mut Vat, msg: &Msg) -> Result<(), EvalError> {
    let promise_id = match msg.promise_id {
        Some(id) => id,
        None => {
            warn!(%msg, "reply without promise id dropped");
            return Ok(());
        }
    };

    if !vat.promises.contains_key(&promise_id) {
        warn!(%msg, promise_id, "reply for unknown promise dropped");
        return Ok(());
    }

    match vat.resolve_promise(promise_id, msg.args.clone()) {
        Ok(()) => {}
        Err(EvalError::AlreadyResolved(_)) => {
            warn!(%msg, promise_id, "duplicate resolution rejected");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let (callbacks, dependent_ids, stashed_request) = {
        let promise = vat
            .promises
            .get_mut(&promise_id)
            .expect("promise vanished during resolution");
        let stashed = if promise.return_msg {
            promise.msg.clone()
        } else {
            None
        };
        (
            mem::take(&mut promise.callbacks),
            mem::take(&mut promise.dependents),
            stashed,
        )
    };

    let result = vat.promises[&promise_id]
        .results
        .first()
        .cloned()
        .unwrap_or(Value::Nop);

    // Callback bodies run against the entity the reply is addressed to —
    // the original requester.
    if !callbacks.is_empty() {
        let entity_id = msg.dst.entity_id;
        let (module, address) = {
            let entity = vat.entity(entity_id).ok_or(EvalError::UnknownEntity {
                vat_id: vat.id,
                entity_id,
            })?;
            (entity.module.clone(), entity.address)
        };

        let mut ctx = EvalContext::new(node, vat);
        ctx.push_frame(entity_id, address, module, "on-resolve");
        for crate::vat::PromiseCallback { sym, body } in callbacks {
            ctx.eval_block(&body, vec![(sym, result.clone())])?;
        }
    }

    // Feed dependency joins: this resolution fills whichever slots waited
    // on it; an invocation whose every dependency is now satisfied fires
    // exactly once.
    for dependent_id in dependent_ids {
        let ready = {
            let dpf = match vat.dependents.get_mut(&dependent_id) {
                Some(d) => d,
                None => continue,
            };
            if let DependTarget::Pending(pid) = dpf.target {
                if pid == promise_id {
                    match &result {
                        Value::EntityRef(addr) => dpf.target = DependTarget::Known(*addr),
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "promise {promise_id} did not resolve to an entity: {other}"
                            )))
                        }
                    }
                }
            }
            if let Some(slot) = dpf.depends_on.remove(&promise_id) {
                dpf.args[slot] = result.clone();
            }
            dpf.satisfied()
        };

        if ready {
            let dpf = vat
                .dependents
                .remove(&dependent_id)
                .expect("satisfied dependent vanished");
            let dst = match dpf.target {
                DependTarget::Known(addr) => addr,
                DependTarget::Pending(_) => unreachable!("satisfied dependent has no target"),
            };
            vat.out_messages.push_back(Msg {
                src: msg.dst,
                dst,
                function: dpf.function,
                args: dpf.args,
                promise_id: Some(dpf.promise_id),
                response: false,
            });
        }
    }

    // Forward the result upstream when this promise deferred a reply —
    // except for the entry point, which is never replied to.
    if let Some(request) = stashed_request {
        if request.function != node.config.entry_function {
            vat.out_messages.push_back(create_response(&request, result));
        }
    }

    Ok(())
}
