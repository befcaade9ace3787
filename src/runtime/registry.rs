// src/runtime/registry.rs
//! Named, override-capable collections of helpers, partials and decorators
//!
//! A registry is a stack of immutable layers. Render-time overrides push a
//! layer over the engine's base registries; lookups scan top-down, so local
//! entries shadow global ones without mutating shared state.

use crate::compiler::opcode::Program;
use crate::runtime::value::Value;
use crate::runtime::{DecoratorCall, DecoratorProps, HelperCall, ProgramCall, RenderContext};
use crate::RenderError;
use ahash::HashMap;
use std::rc::Rc;

#[derive(Clone)]
pub struct Registry<T: Clone> {
    layers: Vec<Rc<HashMap<String, T>>>,
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into the top layer, copying it first if it is shared.
    pub fn register(&mut self, name: impl Into<String>, entry: T) {
        if self.layers.is_empty() {
            self.layers.push(Rc::new(HashMap::default()));
        }
        let top = self.layers.last_mut().unwrap();
        Rc::make_mut(top).insert(name.into(), entry);
    }

    /// A view with `extra` layered on top; the receiver is untouched.
    pub fn layered(&self, extra: HashMap<String, T>) -> Registry<T> {
        let mut layers = self.layers.clone();
        if !extra.is_empty() {
            layers.push(Rc::new(extra));
        }
        Registry { layers }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// A named callable invocable from a template: either a built-in (plain fn)
/// or a user-supplied closure.
#[derive(Clone)]
pub enum Helper {
    Native(NativeHelperFn),
    Callable(Rc<dyn Fn(&HelperCall, &RenderContext) -> Result<Value, RenderError>>),
}

pub type NativeHelperFn = fn(&HelperCall, &RenderContext) -> Result<Value, RenderError>;

impl Helper {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&HelperCall, &RenderContext) -> Result<Value, RenderError> + 'static,
    {
        Helper::Callable(Rc::new(f))
    }

    pub fn call(&self, call: &HelperCall, rcx: &RenderContext) -> Result<Value, RenderError> {
        match self {
            Helper::Native(f) => f(call, rcx),
            Helper::Callable(f) => f(call, rcx),
        }
    }
}

/// A registered partial: a compiled template body, or a program bound at
/// render time by the `inline` decorator.
#[derive(Clone)]
pub enum Partial {
    Template(Rc<Program>),
    Bound(Rc<dyn ProgramCall>),
}

/// A construct that wraps or replaces a program's rendering function before
/// invocation. `decorated` is the current invocation closure for the program
/// being decorated: the bare body, or the replacement installed by an
/// earlier decorator on the same program. Returning `Some` installs a new
/// replacement, so successive decorators chain; decorators may instead (or
/// additionally) attach side-channel state to the props.
#[derive(Clone)]
pub enum Decorator {
    Native(NativeDecoratorFn),
    Callable(
        Rc<
            dyn Fn(
                &DecoratorCall,
                &Rc<dyn ProgramCall>,
                &mut DecoratorProps,
                &RenderContext,
            ) -> Result<Option<Rc<dyn ProgramCall>>, RenderError>,
        >,
    ),
}

pub type NativeDecoratorFn = fn(
    &DecoratorCall,
    &Rc<dyn ProgramCall>,
    &mut DecoratorProps,
    &RenderContext,
) -> Result<Option<Rc<dyn ProgramCall>>, RenderError>;

impl Decorator {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(
                &DecoratorCall,
                &Rc<dyn ProgramCall>,
                &mut DecoratorProps,
                &RenderContext,
            ) -> Result<Option<Rc<dyn ProgramCall>>, RenderError>
            + 'static,
    {
        Decorator::Callable(Rc::new(f))
    }

    pub fn call(
        &self,
        call: &DecoratorCall,
        decorated: &Rc<dyn ProgramCall>,
        props: &mut DecoratorProps,
        rcx: &RenderContext,
    ) -> Result<Option<Rc<dyn ProgramCall>>, RenderError> {
        match self {
            Decorator::Native(f) => f(call, decorated, props, rcx),
            Decorator::Callable(f) => f(call, decorated, props, rcx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layering_shadows_without_mutation() {
        let mut base: Registry<i32> = Registry::new();
        base.register("a", 1);
        base.register("b", 2);

        let mut overlay = HashMap::default();
        overlay.insert("a".to_string(), 10);
        let view = base.layered(overlay);

        assert_eq!(view.get("a"), Some(&10));
        assert_eq!(view.get("b"), Some(&2));
        // base unchanged
        assert_eq!(base.get("a"), Some(&1));
    }

    #[test]
    fn test_register_after_layering_copies() {
        let mut base: Registry<i32> = Registry::new();
        base.register("a", 1);
        let view = base.layered(HashMap::default());
        base.register("a", 5);

        assert_eq!(view.get("a"), Some(&1));
        assert_eq!(base.get("a"), Some(&5));
    }
}
