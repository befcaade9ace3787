// src/runtime/helpers.rs
//! Built-in helpers and decorators registered on every engine.
//!
//! All built-ins are plain functions so the default registries never allocate
//! closures. Each one receives the same `HelperCall` either backend builds,
//! which is what keeps their behavior backend-independent.

use std::rc::Rc;

use crate::runtime::context::{append_context_path, BlockParamsFrame, DataFrame};
use crate::runtime::registry::{Decorator, Helper, Registry};
use crate::runtime::value::Value;
use crate::runtime::{
    resolve_lambda, DecoratorCall, DecoratorProps, FrameOverrides, HelperCall, NoopProgram,
    ProgramCall, RenderContext,
};
use crate::RenderError;

pub fn register_builtins(helpers: &mut Registry<Helper>, decorators: &mut Registry<Decorator>) {
    helpers.register("each", Helper::Native(each));
    helpers.register("if", Helper::Native(if_helper));
    helpers.register("unless", Helper::Native(unless));
    helpers.register("with", Helper::Native(with));
    helpers.register("log", Helper::Native(log_helper));
    helpers.register("lookup", Helper::Native(lookup));
    helpers.register("helperMissing", Helper::Native(helper_missing));
    helpers.register("blockHelperMissing", Helper::Native(block_helper_missing));

    decorators.register("inline", Decorator::Native(inline));
}

/// `{{#each iterable}}` with `@index`/`@key`/`@first`/`@last` and the
/// `as |value key|` block params.
fn each(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    if call.params.is_empty() {
        return Err(RenderError::MissingArgument("each".into()));
    }
    let iterable = resolve_lambda(call.param(0), &call.context)?;

    // trackIds: the base path every item's contextPath extends.
    let context_path = match (&call.data, call.param_id(0)) {
        (Some(data), Some(id)) => id.as_str().map(|id| {
            format!(
                "{}.",
                append_context_path(data.context_path().as_deref(), id)
            )
        }),
        _ => None,
    };

    let mut out = String::new();
    let mut iterated = false;

    let mut exec = |value: &Value,
                    key: Value,
                    index: usize,
                    last: bool|
     -> Result<(), RenderError> {
        iterated = true;

        let (data, item_path) = match &call.data {
            Some(parent) => {
                let mut frame = DataFrame::frame(parent);
                frame.set("key", key.clone());
                frame.set("index", Value::Int(index as i64));
                frame.set("first", Value::Bool(index == 0));
                frame.set("last", Value::Bool(last));
                let item_path = context_path
                    .as_ref()
                    .map(|base| format!("{}{}", base, key.render(false)));
                if let Some(path) = &item_path {
                    frame.set("contextPath", Value::from(path.clone()));
                }
                (Some(Rc::new(frame)), item_path)
            }
            None => (None, None),
        };

        let paths = match item_path {
            Some(path) => vec![Value::from(path), Value::Null],
            None => Vec::new(),
        };
        let frame = FrameOverrides {
            data,
            block_params: Some(BlockParamsFrame::new(vec![value.clone(), key], paths)),
        };
        out.push_str(&call.call_program(rcx, value, frame)?);
        Ok(())
    };

    match &iterable {
        Value::Array(items) => {
            let last = items.len().saturating_sub(1);
            for (i, item) in items.iter().enumerate() {
                exec(item, Value::Int(i as i64), i, i == last)?;
            }
        }
        Value::Object(map) => {
            let last = map.len().saturating_sub(1);
            for (i, (key, value)) in map.iter().enumerate() {
                exec(value, Value::from(key.clone()), i, i == last)?;
            }
        }
        _ => {}
    }
    drop(exec);

    if iterated {
        Ok(Value::from(out))
    } else {
        Ok(Value::from(call.call_inverse(
            rcx,
            &call.context,
            FrameOverrides::default(),
        )?))
    }
}

fn if_helper(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    if call.params.len() != 1 {
        return Err(RenderError::MissingArgument("if".into()));
    }
    let conditional = resolve_lambda(call.param(0), &call.context)?;
    let include_zero = call
        .hash_value("includeZero")
        .map(|v| !v.is_falsy())
        .unwrap_or(false);

    let truthy = !conditional.is_falsy()
        || (include_zero && matches!(conditional, Value::Int(0)));
    let body = if truthy {
        call.call_program(rcx, &call.context, FrameOverrides::default())?
    } else {
        call.call_inverse(rcx, &call.context, FrameOverrides::default())?
    };
    Ok(Value::from(body))
}

fn unless(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    if call.params.len() != 1 {
        return Err(RenderError::MissingArgument("unless".into()));
    }
    let conditional = resolve_lambda(call.param(0), &call.context)?;
    let body = if conditional.is_falsy() {
        call.call_program(rcx, &call.context, FrameOverrides::default())?
    } else {
        call.call_inverse(rcx, &call.context, FrameOverrides::default())?
    };
    Ok(Value::from(body))
}

fn with(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    if call.params.len() != 1 {
        return Err(RenderError::MissingArgument("with".into()));
    }
    let value = resolve_lambda(call.param(0), &call.context)?;

    if value.is_nullish() {
        return Ok(Value::from(call.call_inverse(
            rcx,
            &call.context,
            FrameOverrides::default(),
        )?));
    }

    let (data, path) = match (&call.data, call.param_id(0)) {
        (Some(parent), Some(id)) => match id.as_str() {
            Some(id) => {
                let mut frame = DataFrame::frame(parent);
                let path = append_context_path(parent.context_path().as_deref(), id);
                frame.set("contextPath", Value::from(path.clone()));
                (Some(Rc::new(frame)), Some(path))
            }
            None => (None, None),
        },
        _ => (None, None),
    };

    let paths = match path {
        Some(p) => vec![Value::from(p)],
        None => Vec::new(),
    };
    let frame = FrameOverrides {
        data,
        block_params: Some(BlockParamsFrame::new(vec![value.clone()], paths)),
    };
    Ok(Value::from(call.call_program(rcx, &value, frame)?))
}

/// `{{log msg}}`: routed through the `log` crate, level picked by the
/// `level` hash argument.
fn log_helper(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    let message = call
        .params
        .iter()
        .map(|p| p.render(rcx.flags.js_compat))
        .collect::<Vec<_>>()
        .join(" ");

    let level = call
        .hash_value("level")
        .and_then(Value::as_str)
        .unwrap_or("info");
    match level {
        "trace" => log::trace!("{message}"),
        "debug" => log::debug!("{message}"),
        "warn" => log::warn!("{message}"),
        "error" => log::error!("{message}"),
        _ => log::info!("{message}"),
    }
    Ok(Value::from(""))
}

fn lookup(call: &HelperCall, _rcx: &RenderContext) -> Result<Value, RenderError> {
    let object = call.param(0);
    if object.is_nullish() || object.is_missing() {
        return Ok(Value::Missing);
    }
    let field = call.param(1).render(false);
    Ok(object.get(&field).cloned().unwrap_or(Value::Missing))
}

/// Fallback for a mustache that resolved to nothing: no arguments renders
/// empty, arguments mean a helper call that cannot be satisfied.
fn helper_missing(call: &HelperCall, _rcx: &RenderContext) -> Result<Value, RenderError> {
    if call.params.is_empty() {
        Ok(Value::Missing)
    } else {
        Err(RenderError::HelperMissing(call.name.clone()))
    }
}

/// Fallback for `{{#name}}` blocks whose name resolved to a plain value
/// rather than a helper.
fn block_helper_missing(call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
    let value = call.param(0);

    if let Value::Bool(true) = value {
        return Ok(Value::from(call.call_program(
            rcx,
            &call.context,
            FrameOverrides::default(),
        )?));
    }
    if value.is_falsy() {
        return Ok(Value::from(call.call_inverse(
            rcx,
            &call.context,
            FrameOverrides::default(),
        )?));
    }

    if let Value::Array(items) = &value {
        if items.is_empty() {
            return Ok(Value::from(call.call_inverse(
                rcx,
                &call.context,
                FrameOverrides::default(),
            )?));
        }
        // Non-empty arrays iterate like {{#each}}; the block's own name
        // becomes the id the iteration extends.
        let mut each_call = HelperCall::bare(call.name.clone(), call.context.clone());
        each_call.params = vec![value.clone()];
        each_call.data = call.data.clone();
        each_call.program = call.program.clone();
        each_call.inverse = call.inverse.clone();
        if call.ids.is_some() {
            each_call.ids = Some(vec![Value::from(call.name.clone())]);
        }
        return each(&each_call, rcx);
    }

    let data = match (&call.data, &call.ids) {
        (Some(parent), Some(_)) => {
            let mut frame = DataFrame::frame(parent);
            let path = append_context_path(parent.context_path().as_deref(), &call.name);
            frame.set("contextPath", Value::from(path));
            Some(Rc::new(frame))
        }
        _ => call.data.clone(),
    };
    Ok(Value::from(call.call_program(
        rcx,
        &value,
        FrameOverrides {
            data,
            block_params: None,
        },
    )?))
}

/// `{{#*inline "name"}}`: binds the decorated block as a partial visible for
/// the rest of the surrounding program's activation.
fn inline(
    call: &DecoratorCall,
    _decorated: &Rc<dyn ProgramCall>,
    props: &mut DecoratorProps,
    _rcx: &RenderContext,
) -> Result<Option<Rc<dyn ProgramCall>>, RenderError> {
    let name = call
        .params
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| RenderError::InvalidPartialName("inline partial without a name".into()))?;

    let program: Rc<dyn ProgramCall> = match &call.program {
        Some(p) => Rc::clone(p),
        None => Rc::new(NoopProgram),
    };
    props
        .partials
        .insert(name.to_string(), crate::runtime::Partial::Bound(program));
    Ok(None)
}
