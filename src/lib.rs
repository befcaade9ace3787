// src/lib.rs
//! # Stencil Engine
//!
//! A template engine that compiles a parsed template AST into a compact
//! opcode program and renders it through one of two interchangeable
//! backends: a closure-composition code generator and a stack-machine
//! interpreter. Both backends speak the same runtime protocol, so helpers,
//! partials and decorators behave identically — and produce byte-identical
//! output — regardless of which one runs the template.
//!
//! ## Example
//!
//! ```rust
//! use stencil_engine::ast::{Expr, Node, SubExpr, Template};
//! use stencil_engine::compiler::CompileOptions;
//! use stencil_engine::runtime::{RenderOptions, Value};
//! use stencil_engine::{Backend, Engine};
//!
//! let template = Template::new(vec![
//!     Node::content("Hello "),
//!     Node::mustache(SubExpr::new(Expr::path(&["name"]))),
//!     Node::content("!"),
//! ]);
//!
//! let engine = Engine::new(Backend::CodeGen);
//! let compiled = engine.compile(&template, &CompileOptions::default()).unwrap();
//!
//! let context: Value = serde_json::json!({"name": "World"}).into();
//! let out = engine
//!     .render(&compiled, &context, &RenderOptions::default())
//!     .unwrap();
//! assert_eq!(out, "Hello World!");
//! ```

pub mod ast;
pub mod codegen;
pub mod compiler;
pub mod runtime;

use std::rc::Rc;

use thiserror::Error;

use codegen::CodeGenTemplate;
use runtime::vm::VmTemplate;
use runtime::{Decorator, Helper, Partial, Registry, RenderContext, RenderOptions};

pub use compiler::{CompileOptions, CompiledFlags, Program, COMPILER_REVISION};
pub use runtime::value::Value;

/// Errors raised while turning an AST into an executable template.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A helper call could not be resolved under `known_helpers_only`.
    #[error("Unknown helper: {0}")]
    UnknownHelper(String),

    #[error("Malformed template node: {0}")]
    MalformedNode(String),

    /// A program reference survived flattening without a table entry.
    #[error("No child program with guid {0}")]
    UnresolvedProgram(usize),

    /// The opcode stream fails the abstract stack simulation.
    #[error("Opcode stack imbalance: {0}")]
    StackImbalance(String),

    #[error("Artifact error: {0}")]
    Artifact(#[from] bincode::Error),

    #[error("Artifact compiled with revision {found}, expected {expected}")]
    RevisionMismatch { found: u32, expected: u32 },
}

/// Errors raised while rendering. All are fatal for the render call; no
/// partial output is returned.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Helper missing: {0}")]
    HelperMissing(String),

    #[error("Missing required argument to {0}")]
    MissingArgument(String),

    #[error("Partial missing: {0}")]
    PartialMissing(String),

    #[error("Decorator missing: {0}")]
    DecoratorMissing(String),

    /// An array, object or unresolvable lambda reached escaped output.
    #[error("Cannot render a non-scalar value in escaped position")]
    NonScalarOutput,

    #[error("Invalid partial name: {0}")]
    InvalidPartialName(String),

    #[error("Value stack underflow")]
    StackUnderflow,

    #[error("Internal render error: {0}")]
    Internal(String),
}

/// The capability both backends expose: render a compiled program against a
/// context under a prepared render context.
pub trait Renderer {
    fn render(
        &self,
        rcx: &RenderContext,
        context: &Value,
        data: Option<&Value>,
    ) -> Result<String, RenderError>;
}

/// Which execution backend an engine builds templates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    CodeGen,
    Vm,
}

/// A template ready to render: the persistable program, its compiled flags
/// and the backend-specific executable form.
pub struct CompiledTemplate {
    program: Rc<Program>,
    flags: Rc<CompiledFlags>,
    renderer: Box<dyn Renderer>,
}

impl std::fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("program", &self.program)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl CompiledTemplate {
    /// Serialize the compiled program for storage or hot reload. The
    /// backend-specific executable is rebuilt on load.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CompileError> {
        let artifact = (
            COMPILER_REVISION,
            self.program.as_ref(),
            self.flags.as_ref(),
        );
        Ok(bincode::serialize(&artifact)?)
    }

    pub fn flags(&self) -> &CompiledFlags {
        &self.flags
    }

    pub fn program(&self) -> &Program {
        &self.program
    }
}

/// Engine entry point: holds the construction-time registries and the
/// configured backend. Render-time options layer over the registries without
/// mutating them, so one engine serves many concurrent render calls.
pub struct Engine {
    backend: Backend,
    helpers: Registry<Helper>,
    partials: Registry<Partial>,
    decorators: Registry<Decorator>,
}

impl Engine {
    /// An engine with the built-in helpers (`each`, `if`, `unless`, `with`,
    /// `log`, `lookup`, the missing-hooks) and the `inline` decorator
    /// registered.
    pub fn new(backend: Backend) -> Self {
        let mut helpers = Registry::new();
        let mut decorators = Registry::new();
        runtime::helpers::register_builtins(&mut helpers, &mut decorators);
        Self {
            backend,
            helpers,
            partials: Registry::new(),
            decorators,
        }
    }

    pub fn register_helper(&mut self, name: impl Into<String>, helper: Helper) {
        self.helpers.register(name, helper);
    }

    pub fn register_partial(&mut self, name: impl Into<String>, partial: Partial) {
        self.partials.register(name, partial);
    }

    pub fn register_decorator(&mut self, name: impl Into<String>, decorator: Decorator) {
        self.decorators.register(name, decorator);
    }

    /// Compile an AST into an executable template for this engine's backend.
    pub fn compile(
        &self,
        template: &ast::Template,
        options: &CompileOptions,
    ) -> Result<CompiledTemplate, CompileError> {
        let (program, flags) = compiler::compile(template, options)?;
        self.build(program, flags)
    }

    /// Rebuild a template from a stored artifact, rejecting programs
    /// compiled under a different opcode revision.
    pub fn template_from_bytes(&self, bytes: &[u8]) -> Result<CompiledTemplate, CompileError> {
        let (revision, program, flags): (u32, Program, CompiledFlags) =
            bincode::deserialize(bytes)?;
        if revision != COMPILER_REVISION {
            return Err(CompileError::RevisionMismatch {
                found: revision,
                expected: COMPILER_REVISION,
            });
        }
        self.build(program, flags)
    }

    fn build(
        &self,
        program: Program,
        flags: CompiledFlags,
    ) -> Result<CompiledTemplate, CompileError> {
        let program = Rc::new(program);
        let flags = Rc::new(flags);
        let renderer: Box<dyn Renderer> = match self.backend {
            Backend::CodeGen => Box::new(CodeGenTemplate::new(&program, Rc::clone(&flags))?),
            Backend::Vm => Box::new(VmTemplate::new(&program, Rc::clone(&flags))?),
        };
        Ok(CompiledTemplate {
            program,
            flags,
            renderer,
        })
    }

    /// Render a compiled template. Helpers, partials and decorators in
    /// `options` shadow the engine registrations for this call only.
    pub fn render(
        &self,
        template: &CompiledTemplate,
        context: &Value,
        options: &RenderOptions,
    ) -> Result<String, RenderError> {
        let rcx = RenderContext::new(
            self.helpers.layered(options.helpers.clone()),
            self.partials.layered(options.partials.clone()),
            self.decorators.layered(options.decorators.clone()),
            Rc::clone(&template.flags),
        );
        template.renderer.render(&rcx, context, options.data.as_ref())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Backend::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Node, SubExpr, Template};

    fn greeting() -> Template {
        Template::new(vec![
            Node::content("Hello "),
            Node::mustache(SubExpr::new(Expr::path(&["name"]))),
        ])
    }

    fn context() -> Value {
        serde_json::json!({"name": "World"}).into()
    }

    #[test]
    fn test_engine_renders_on_both_backends() {
        for backend in [Backend::CodeGen, Backend::Vm] {
            let engine = Engine::new(backend);
            let compiled = engine
                .compile(&greeting(), &CompileOptions::default())
                .unwrap();
            let out = engine
                .render(&compiled, &context(), &RenderOptions::default())
                .unwrap();
            assert_eq!(out, "Hello World");
        }
    }

    #[test]
    fn test_artifact_round_trip() {
        let engine = Engine::new(Backend::Vm);
        let compiled = engine
            .compile(&greeting(), &CompileOptions::default())
            .unwrap();
        let bytes = compiled.to_bytes().unwrap();

        let reloaded = engine.template_from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.program(), compiled.program());
        let out = engine
            .render(&reloaded, &context(), &RenderOptions::default())
            .unwrap();
        assert_eq!(out, "Hello World");
    }

    #[test]
    fn test_artifact_rejects_other_revision() {
        let engine = Engine::default();
        let compiled = engine
            .compile(&greeting(), &CompileOptions::default())
            .unwrap();
        let stale = (
            COMPILER_REVISION + 1,
            compiled.program(),
            compiled.flags(),
        );
        let bytes = bincode::serialize(&stale).unwrap();

        let err = engine.template_from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CompileError::RevisionMismatch { found, expected }
                if found == COMPILER_REVISION + 1 && expected == COMPILER_REVISION
        ));
    }

    #[test]
    fn test_registered_helper_is_shadowed_by_render_options() {
        let shout = Helper::from_fn(|_, _| Ok(Value::from("base")));
        let louder = Helper::from_fn(|_, _| Ok(Value::from("layered")));

        let mut engine = Engine::new(Backend::CodeGen);
        engine.register_helper("shout", shout);

        let template = Template::new(vec![Node::mustache(SubExpr::helper("shout", vec![]))]);
        let compiled = engine
            .compile(&template, &CompileOptions::default())
            .unwrap();

        let out = engine
            .render(&compiled, &Value::Null, &RenderOptions::default())
            .unwrap();
        assert_eq!(out, "base");

        let layered = RenderOptions::default().with_helper("shout", louder);
        let out = engine.render(&compiled, &Value::Null, &layered).unwrap();
        assert_eq!(out, "layered");
    }
}
