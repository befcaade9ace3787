// src/runtime/mod.rs
//! Shared runtime services used identically by both execution backends
//!
//! Everything here is backend-neutral: helper dispatch, the program-call
//! capability, decorator props, lambda resolution and the per-render context
//! holding the layered registries.

pub mod context;
pub mod escape;
pub mod helpers;
pub mod partial;
pub mod registry;
pub mod value;
pub mod vm;

use crate::compiler::opcode::CompiledFlags;
use crate::RenderError;
use ahash::HashMap;
use std::cell::RefCell;
use std::rc::Rc;

pub use context::{append_context_path, BlockParams, BlockParamsFrame, DataFrame, DepthList};
pub use registry::{Decorator, Helper, Partial, Registry};
pub use value::{Lambda, Value, ValueMap};

/// Render-time inputs of the render contract:
/// `render(context, {helpers, partials, decorators, data})`.
#[derive(Default)]
pub struct RenderOptions {
    pub helpers: HashMap<String, Helper>,
    pub partials: HashMap<String, Partial>,
    pub decorators: HashMap<String, Decorator>,
    pub data: Option<Value>,
}

impl RenderOptions {
    pub fn with_helper(mut self, name: impl Into<String>, helper: Helper) -> Self {
        self.helpers.insert(name.into(), helper);
        self
    }

    pub fn with_partial(mut self, name: impl Into<String>, partial: Partial) -> Self {
        self.partials.insert(name.into(), partial);
        self
    }

    pub fn with_decorator(mut self, name: impl Into<String>, decorator: Decorator) -> Self {
        self.decorators.insert(name.into(), decorator);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-render-call state shared by every program activation: the layered
/// registries, the compiled flags and the inline-partial scopes registered by
/// decorators. One is built per render call; compiled templates stay free of
/// mutable state.
pub struct RenderContext {
    pub helpers: Registry<Helper>,
    pub partials: Registry<Partial>,
    pub decorators: Registry<Decorator>,
    pub flags: Rc<CompiledFlags>,
    inline_partials: RefCell<Vec<HashMap<String, Partial>>>,
}

impl RenderContext {
    pub fn new(
        helpers: Registry<Helper>,
        partials: Registry<Partial>,
        decorators: Registry<Decorator>,
        flags: Rc<CompiledFlags>,
    ) -> Self {
        Self {
            helpers,
            partials,
            decorators,
            flags,
            inline_partials: RefCell::new(Vec::new()),
        }
    }

    /// Open an inline-partial scope for a decorated program activation.
    pub fn push_inline_partials(&self, map: HashMap<String, Partial>) {
        self.inline_partials.borrow_mut().push(map);
    }

    pub fn pop_inline_partials(&self) {
        self.inline_partials.borrow_mut().pop();
    }

    /// Partial resolution: innermost inline scope first, then the layered
    /// registry view.
    pub fn lookup_partial(&self, name: &str) -> Option<Partial> {
        let scopes = self.inline_partials.borrow();
        for scope in scopes.iter().rev() {
            if let Some(p) = scope.get(name) {
                return Some(p.clone());
            }
        }
        self.partials.get(name).cloned()
    }
}

/// Replacement data/block-params supplied when a helper invokes a block.
#[derive(Default)]
pub struct FrameOverrides {
    pub data: Option<Rc<DataFrame>>,
    pub block_params: Option<BlockParamsFrame>,
}

impl FrameOverrides {
    pub fn with_data(data: Rc<DataFrame>) -> Self {
        Self {
            data: Some(data),
            block_params: None,
        }
    }
}

/// The capability both backends expose for invoking a compiled program:
/// generated closures and interpreter activations implement the same trait,
/// so helpers and decorators cannot tell the backends apart.
pub trait ProgramCall {
    fn call(
        &self,
        rcx: &RenderContext,
        context: &Value,
        frame: FrameOverrides,
    ) -> Result<String, RenderError>;
}

/// The empty program: renders nothing.
pub struct NoopProgram;

impl ProgramCall for NoopProgram {
    fn call(
        &self,
        _rcx: &RenderContext,
        _context: &Value,
        _frame: FrameOverrides,
    ) -> Result<String, RenderError> {
        Ok(String::new())
    }
}

/// Everything a helper receives: positional params, hash, block programs,
/// the data frame, and — in the instrumentation modes — id/type/context
/// metadata captured alongside each argument.
pub struct HelperCall {
    pub name: String,
    pub context: Value,
    pub params: Vec<Value>,
    pub hash: ValueMap,
    pub data: Option<Rc<DataFrame>>,
    pub program: Option<Rc<dyn ProgramCall>>,
    pub inverse: Option<Rc<dyn ProgramCall>>,
    /// trackIds metadata, parallel to `params`.
    pub ids: Option<Vec<Value>>,
    pub hash_ids: Option<ValueMap>,
    /// stringParams metadata, parallel to `params`.
    pub param_types: Option<Vec<Value>>,
    pub param_contexts: Option<Vec<Value>>,
    pub hash_types: Option<ValueMap>,
    pub hash_contexts: Option<ValueMap>,
}

impl HelperCall {
    /// A bare call with no params, block or metadata.
    pub fn bare(name: impl Into<String>, context: Value) -> Self {
        HelperCall {
            name: name.into(),
            context,
            params: Vec::new(),
            hash: ValueMap::new(),
            data: None,
            program: None,
            inverse: None,
            ids: None,
            hash_ids: None,
            param_types: None,
            param_contexts: None,
            hash_types: None,
            hash_contexts: None,
        }
    }

    pub fn param(&self, index: usize) -> Value {
        self.params.get(index).cloned().unwrap_or(Value::Missing)
    }

    pub fn hash_value(&self, key: &str) -> Option<&Value> {
        self.hash.get(key)
    }

    /// Render the block body; empty when the call has none.
    pub fn call_program(
        &self,
        rcx: &RenderContext,
        context: &Value,
        frame: FrameOverrides,
    ) -> Result<String, RenderError> {
        match &self.program {
            Some(p) => p.call(rcx, context, frame),
            None => Ok(String::new()),
        }
    }

    /// Render the `{{else}}` body; empty when the call has none.
    pub fn call_inverse(
        &self,
        rcx: &RenderContext,
        context: &Value,
        frame: FrameOverrides,
    ) -> Result<String, RenderError> {
        match &self.inverse {
            Some(p) => p.call(rcx, context, frame),
            None => Ok(String::new()),
        }
    }

    /// The trackIds id of param `index`, when that mode is on.
    pub fn param_id(&self, index: usize) -> Option<Value> {
        self.ids.as_ref().and_then(|ids| ids.get(index)).cloned()
    }
}

/// Arguments handed to a decorator.
pub struct DecoratorCall {
    pub name: String,
    pub context: Value,
    pub params: Vec<Value>,
    pub hash: ValueMap,
    pub data: Option<Rc<DataFrame>>,
    /// The decorator block's own body, when it has one.
    pub program: Option<Rc<dyn ProgramCall>>,
}

/// Side-channel state decorators attach to the program they wrap; currently
/// partial registrations made by `inline`.
#[derive(Default)]
pub struct DecoratorProps {
    pub partials: HashMap<String, Partial>,
}

/// The helper fallback chain shared by both backends, first hit wins:
/// registry helper (only meaningful for simple names) → the path-resolved
/// ambient value when callable → the `helperMissing` hook → fatal.
pub fn invoke_helper_chain(
    rcx: &RenderContext,
    lookup_registry: bool,
    fallback: Value,
    call: HelperCall,
) -> Result<Value, RenderError> {
    if lookup_registry {
        if let Some(helper) = rcx.helpers.get(&call.name) {
            return helper.call(&call, rcx);
        }
    }
    if let Value::Lambda(lambda) = &fallback {
        return lambda.call(&call.context, &call.params);
    }
    if let Some(hook) = rcx.helpers.get("helperMissing") {
        return hook.call(&call, rcx);
    }
    Err(RenderError::HelperMissing(call.name))
}

/// Dispatch to the `blockHelperMissing` hook for a block whose subject
/// resolved to a plain value.
pub(crate) fn block_helper_missing_hook(
    rcx: &RenderContext,
    call: HelperCall,
) -> Result<Value, RenderError> {
    let helper = rcx
        .helpers
        .get("blockHelperMissing")
        .cloned()
        .ok_or_else(|| RenderError::HelperMissing("blockHelperMissing".into()))?;
    helper.call(&call, rcx)
}

/// If `value` is callable, invoke it with the current context and use the
/// result in its place.
pub fn resolve_lambda(value: Value, context: &Value) -> Result<Value, RenderError> {
    match value {
        Value::Lambda(lambda) => lambda.call(context, &[]),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> RenderContext {
        RenderContext::new(
            Registry::new(),
            Registry::new(),
            Registry::new(),
            Rc::new(CompiledFlags::default()),
        )
    }

    #[test]
    fn test_inline_partial_scopes_shadow_registry() {
        let mut partials: Registry<Partial> = Registry::new();
        partials.register(
            "p",
            Partial::Template(Rc::new(crate::compiler::opcode::Program::default())),
        );
        let rcx = RenderContext::new(
            Registry::new(),
            partials,
            Registry::new(),
            Rc::new(CompiledFlags::default()),
        );

        assert!(matches!(
            rcx.lookup_partial("p"),
            Some(Partial::Template(_))
        ));

        let mut scope = HashMap::default();
        scope.insert("p".to_string(), Partial::Bound(Rc::new(NoopProgram)));
        rcx.push_inline_partials(scope);
        assert!(matches!(rcx.lookup_partial("p"), Some(Partial::Bound(_))));

        rcx.pop_inline_partials();
        assert!(matches!(
            rcx.lookup_partial("p"),
            Some(Partial::Template(_))
        ));
    }

    #[test]
    fn test_helper_chain_prefers_registry_then_lambda() {
        let mut rcx = test_context();
        rcx.helpers
            .register("greet", Helper::from_fn(|_, _| Ok(Value::from("hi"))));

        let call = HelperCall::bare("greet", Value::Null);
        let out = invoke_helper_chain(&rcx, true, Value::Missing, call).unwrap();
        assert_eq!(out, Value::from("hi"));

        let lambda = Value::Lambda(Lambda::new(|_| Ok(Value::from("fallback"))));
        let call = HelperCall::bare("nope", Value::Null);
        let out = invoke_helper_chain(&rcx, true, lambda, call).unwrap();
        assert_eq!(out, Value::from("fallback"));
    }

    #[test]
    fn test_helper_chain_errors_without_hook() {
        let rcx = test_context();
        let call = HelperCall::bare("gone", Value::Null);
        let err = invoke_helper_chain(&rcx, true, Value::Missing, call).unwrap_err();
        assert!(matches!(err, RenderError::HelperMissing(name) if name == "gone"));
    }
}
