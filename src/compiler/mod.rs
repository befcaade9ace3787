// src/compiler/mod.rs
//! Compiler that turns template ASTs into the opcode IR

pub mod compiler;
pub mod flatten;
pub mod opcode;

use crate::ast::Template;
use crate::CompileError;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

pub use opcode::{CompiledFlags, Literal, Opcode, Program, COMPILER_REVISION};

/// Helpers the compiler may always resolve statically.
pub const ALWAYS_KNOWN_HELPERS: &[&str] = &[
    "helperMissing",
    "blockHelperMissing",
    "each",
    "if",
    "unless",
    "with",
    "log",
    "lookup",
];

/// Named flags consumed by the compiler and the backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Depth-scanning lookup for unresolved simple paths.
    pub compat: bool,
    /// Replace params with their source strings plus type/context metadata.
    pub string_params: bool,
    /// Push path-id metadata ahead of each param.
    pub track_ids: bool,
    /// Force ancestor-context tracking even when no `../` path needs it.
    pub use_depths: bool,
    /// Extra names the compiler may resolve statically.
    pub known_helpers: Vec<String>,
    /// Calls the compiler cannot resolve statically become fatal.
    pub known_helpers_only: bool,
    pub no_escape: bool,
    /// Enable `@`-data frame lookups.
    pub data: bool,
    /// Emit partial indentation as plain content instead of re-indenting.
    pub prevent_indent: bool,
    /// Partials with no context argument run against an undefined context.
    pub explicit_partial_context: bool,
    /// Parser-side whitespace option, carried through for the contract.
    pub ignore_standalone: bool,
    /// Reverse the decorator wrapping order.
    pub alternate_decorators: bool,
    /// Disable JS-style stringification of arrays and objects.
    pub disable_js_compat: bool,
    /// Template name recorded in the compiled flags.
    pub src_name: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            compat: false,
            string_params: false,
            track_ids: false,
            use_depths: false,
            known_helpers: Vec::new(),
            known_helpers_only: false,
            no_escape: false,
            data: true,
            prevent_indent: false,
            explicit_partial_context: false,
            ignore_standalone: false,
            alternate_decorators: false,
            disable_js_compat: false,
            src_name: None,
        }
    }
}

impl CompileOptions {
    pub fn is_known_helper(&self, name: &str) -> bool {
        ALWAYS_KNOWN_HELPERS.contains(&name) || self.known_helpers.iter().any(|h| h == name)
    }
}

/// Compile an AST into the opcode IR plus the top-level flags both backends
/// read at render time.
pub fn compile(
    template: &Template,
    options: &CompileOptions,
) -> Result<(Program, CompiledFlags), CompileError> {
    let guid_counter = Rc::new(Cell::new(0));
    let program = compiler::Compiler::compile(template, options, guid_counter, &[])?;

    let flags = CompiledFlags {
        use_data: options.data || tree_any(&program, &|p| {
            p.opcodes
                .iter()
                .chain(p.decorator_opcodes.iter())
                .any(|op| matches!(op, Opcode::LookupData { .. }))
        }),
        use_depths: options.use_depths
            || options.compat
            || tree_any(&program, &|p| p.use_depths),
        use_block_params: tree_any(&program, &|p| p.block_param_count > 0),
        use_partial: program.use_partial,
        use_decorators: tree_any(&program, &|p| p.use_decorators),
        compat: options.compat,
        string_params: options.string_params,
        track_ids: options.track_ids,
        js_compat: !options.disable_js_compat,
        alternate_decorators: options.alternate_decorators,
        src_name: options.src_name.clone(),
    };

    Ok((program, flags))
}

fn tree_any(program: &Program, pred: &dyn Fn(&Program) -> bool) -> bool {
    pred(program) || program.children.iter().any(|c| tree_any(c, pred))
}
