// src/compiler/opcode.rs
//! Opcode instruction set and the compiled `Program` IR
//!
//! The instruction set is closed: both execution backends match exhaustively
//! on it, so an unsupported opcode is a type error rather than a runtime
//! surprise. Instructions are immutable once emitted.
//!
//! Stack protocol (identical in both backends):
//!
//! * per helper param, push order is `[id]?` (trackIds) or
//!   `[context, type]?` (stringParams, which replaces the value with the
//!   param's source string) followed by the value;
//! * `PushHash .. AssignToHash .. PopHash` builds a hash; `PopHash` and
//!   `EmptyHash` push `[ids]? [contexts, types]? values`;
//! * a full mustache pushes params..., program, inverse, hash — invokes pop
//!   in exact reverse order.

use serde::{Deserialize, Serialize};

/// Bumped whenever the opcode set or its stack protocol changes; persisted
/// artifacts from other revisions are rejected at load.
pub const COMPILER_REVISION: u32 = 1;

/// Literal values that may be embedded in an instruction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Identity metadata pushed ahead of each param in trackIds mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamId {
    /// Path params report their dotted source path.
    Path(String),
    /// Literal params have no id.
    Literal,
    /// Sub-expression params report `true`.
    SubExpression,
    /// Block params report the path recorded when the binding was created,
    /// plus any trailing segments.
    BlockParam { param: [usize; 2], child: String },
}

/// Single tagged instruction; the IR's atomic unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    // Output
    AppendContent(String),
    Append,
    AppendEscaped,

    // Context registers
    GetContext(usize),
    PushContext,

    // Lookups
    LookupOnContext {
        parts: Vec<String>,
        falsy: bool,
        strict: bool,
        scoped: bool,
    },
    LookupData {
        depth: usize,
        parts: Vec<String>,
        strict: bool,
    },
    LookupBlockParam {
        param: [usize; 2],
        parts: Vec<String>,
    },
    ResolvePossibleLambda,

    // Literals and programs
    PushLiteral(Literal),
    PushProgram(Option<usize>),

    // Hash building
    PushHash,
    AssignToHash(String),
    PopHash,
    EmptyHash {
        omit_empty: bool,
    },

    // Invocation
    InvokeHelper {
        param_size: usize,
        name: String,
        is_simple: bool,
    },
    InvokeKnownHelper {
        param_size: usize,
        name: String,
    },
    InvokeAmbiguous {
        name: String,
        is_block: bool,
    },
    InvokePartial {
        is_dynamic: bool,
        name: Option<String>,
        indent: String,
    },

    // Simple-mustache block resolution
    BlockValue(String),
    AmbiguousBlockValue,

    // Decorators
    RegisterDecorator {
        param_size: usize,
        name: String,
    },

    // Instrumentation modes
    PushId(ParamId),
    PushStringParam {
        string: String,
        param_type: String,
    },
}

/// A compiled unit: one per template body, nested block body and partial
/// body. Built once by the compiler, immutable thereafter, safe to share
/// across concurrent render calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Program {
    pub opcodes: Vec<Opcode>,
    pub children: Vec<Program>,
    /// Guid assigned to each child, parallel to `children`. Guids come from a
    /// counter shared by every compiler instance of one compile call, so a
    /// `PushProgram` guid identifies exactly one declared child.
    pub child_guids: Vec<usize>,
    /// Decorator registrations, kept apart from the main sequence so the
    /// preprocessor can give them their own table entry.
    pub decorator_opcodes: Vec<Opcode>,
    pub is_simple: bool,
    pub use_depths: bool,
    pub use_partial: bool,
    pub use_decorators: bool,
    pub block_param_count: usize,
    /// Ancestor depths reached by paths in this program, innermost-first.
    pub captured_depths: Vec<usize>,
}

impl Program {
    /// Position of the child registered under `guid`.
    pub fn child_index(&self, guid: usize) -> Option<usize> {
        self.child_guids.iter().position(|g| *g == guid)
    }
}

/// Top-level flags of a compiled template, shared by both backends and
/// persisted alongside the `Program`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompiledFlags {
    pub use_data: bool,
    pub use_depths: bool,
    pub use_block_params: bool,
    pub use_partial: bool,
    pub use_decorators: bool,
    pub compat: bool,
    pub string_params: bool,
    pub track_ids: bool,
    /// JS-style stringification of arrays and objects in unescaped output.
    pub js_compat: bool,
    /// Reverse the decorator wrapping order.
    pub alternate_decorators: bool,
    pub src_name: Option<String>,
}
