// src/compiler/compiler.rs
//! AST to opcode translation.
//!
//! Each template program compiles in isolation; nested programs get their own
//! compiler instance that shares only the guid counter and the lexical
//! block-param scope with its parent. The opcode sequences this emits follow a
//! strict stack discipline: every mustache-style invocation pushes its params,
//! then its program references, then its hash, and the executing backend pops
//! them in exactly the reverse order.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::ast::{Expr, HashNode, Node, PartialName, PathExpr, SubExpr, Template};
use crate::compiler::opcode::{Literal, Opcode, ParamId, Program};
use crate::compiler::CompileOptions;
use crate::CompileError;

/// What kind of call site a sub-expression is, decided statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SexprKind {
    /// Definitely a helper call: has arguments, or names a known helper.
    Helper,
    /// A bare simple id that may be a helper or a context property.
    Ambiguous,
    /// A plain path or literal, resolved against the context.
    Simple,
}

pub struct Compiler<'o> {
    options: &'o CompileOptions,
    guid_counter: Rc<Cell<usize>>,
    opcodes: Vec<Opcode>,
    decorator_opcodes: Vec<Opcode>,
    in_decorator: bool,
    children: Vec<Program>,
    child_guids: Vec<usize>,
    depths: BTreeSet<usize>,
    use_depths: bool,
    use_partial: bool,
    use_decorators: bool,
    /// Lexical block-param scope, innermost frame first. One frame per
    /// program, pushed even when empty so frame offsets line up with
    /// program nesting at runtime.
    block_params_stack: Vec<Vec<String>>,
}

impl<'o> Compiler<'o> {
    pub fn compile(
        template: &Template,
        options: &'o CompileOptions,
        guid_counter: Rc<Cell<usize>>,
        enclosing_block_params: &[Vec<String>],
    ) -> Result<Program, CompileError> {
        let mut block_params_stack = Vec::with_capacity(enclosing_block_params.len() + 1);
        block_params_stack.push(template.block_params.clone());
        block_params_stack.extend_from_slice(enclosing_block_params);

        let mut compiler = Compiler {
            options,
            guid_counter,
            opcodes: Vec::new(),
            decorator_opcodes: Vec::new(),
            in_decorator: false,
            children: Vec::new(),
            child_guids: Vec::new(),
            depths: BTreeSet::new(),
            use_depths: false,
            use_partial: false,
            use_decorators: false,
            block_params_stack,
        };

        for node in &template.body {
            compiler.accept(node)?;
        }

        let is_simple = template.body.len() == 1
            && matches!(
                template.body[0],
                Node::Mustache {
                    decorator: false,
                    ..
                }
            );

        log::trace!(
            "compiled program: {} opcodes, {} children",
            compiler.opcodes.len(),
            compiler.children.len()
        );

        Ok(Program {
            opcodes: compiler.opcodes,
            children: compiler.children,
            child_guids: compiler.child_guids,
            decorator_opcodes: compiler.decorator_opcodes,
            is_simple,
            use_depths: compiler.use_depths,
            use_partial: compiler.use_partial,
            use_decorators: compiler.use_decorators,
            block_param_count: template.block_params.len(),
            captured_depths: compiler.depths.iter().copied().collect(),
        })
    }

    fn accept(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Content(text) => {
                if !text.is_empty() {
                    self.opcode(Opcode::AppendContent(text.clone()));
                }
                Ok(())
            }
            Node::Comment(_) => Ok(()),
            Node::Mustache {
                sexpr,
                decorator: true,
                ..
            } => self.decorator_statement(sexpr, None),
            Node::Mustache { sexpr, escaped, .. } => {
                self.sub_expression(sexpr)?;
                if *escaped && !self.options.no_escape {
                    self.opcode(Opcode::AppendEscaped);
                } else {
                    self.opcode(Opcode::Append);
                }
                Ok(())
            }
            Node::Block {
                sexpr,
                program,
                decorator: true,
                ..
            } => self.decorator_statement(sexpr, program.as_ref()),
            Node::Block {
                sexpr,
                program,
                inverse,
                ..
            } => self.block_statement(sexpr, program.as_ref(), inverse.as_ref()),
            Node::Partial {
                name,
                context,
                hash,
                indent,
            } => self.partial_statement(name, context.as_ref(), hash.as_ref(), indent),
        }
    }

    fn block_statement(
        &mut self,
        sexpr: &SubExpr,
        program: Option<&Template>,
        inverse: Option<&Template>,
    ) -> Result<(), CompileError> {
        let program_guid = program.map(|p| self.compile_child(p)).transpose()?;
        let inverse_guid = inverse.map(|p| self.compile_child(p)).transpose()?;

        match self.classify(sexpr)? {
            SexprKind::Helper => self.helper_sexpr(sexpr, program_guid, inverse_guid)?,
            SexprKind::Simple => {
                self.simple_sexpr(sexpr)?;
                self.opcode(Opcode::PushProgram(program_guid));
                self.opcode(Opcode::PushProgram(inverse_guid));
                self.opcode(Opcode::EmptyHash { omit_empty: false });
                self.opcode(Opcode::BlockValue(sexpr_name(sexpr)));
            }
            SexprKind::Ambiguous => {
                self.ambiguous_sexpr(sexpr, program_guid, inverse_guid)?;
                self.opcode(Opcode::PushProgram(program_guid));
                self.opcode(Opcode::PushProgram(inverse_guid));
                self.opcode(Opcode::EmptyHash { omit_empty: false });
                self.opcode(Opcode::AmbiguousBlockValue);
            }
        }

        self.opcode(Opcode::Append);
        Ok(())
    }

    fn partial_statement(
        &mut self,
        name: &PartialName,
        context: Option<&Expr>,
        hash: Option<&HashNode>,
        indent: &str,
    ) -> Result<(), CompileError> {
        self.use_partial = true;

        let is_dynamic = matches!(name, PartialName::Dynamic(_));
        if let PartialName::Dynamic(sub) = name {
            self.sub_expression(sub)?;
        }

        let context_expr = match context {
            Some(expr) => expr.clone(),
            None if self.options.explicit_partial_context => Expr::Undefined,
            None => Expr::this(),
        };
        self.push_param(&context_expr)?;
        self.opcode(Opcode::PushProgram(None));
        self.opcode(Opcode::PushProgram(None));
        match hash {
            Some(h) => self.hash(h)?,
            None => self.opcode(Opcode::EmptyHash { omit_empty: true }),
        }

        let mut indent = indent.to_string();
        if self.options.prevent_indent && !indent.is_empty() {
            self.opcode(Opcode::AppendContent(indent));
            indent = String::new();
        }

        let static_name = match name {
            PartialName::Static(n) => Some(n.clone()),
            PartialName::Dynamic(_) => None,
        };
        self.opcode(Opcode::InvokePartial {
            is_dynamic,
            name: static_name,
            indent,
        });
        self.opcode(Opcode::Append);
        Ok(())
    }

    /// A decorator statement's opcodes, params included, land in the owning
    /// program's decorator stream so the backends can run them before the
    /// body executes.
    fn decorator_statement(
        &mut self,
        sexpr: &SubExpr,
        program: Option<&Template>,
    ) -> Result<(), CompileError> {
        self.use_decorators = true;

        let program_guid = program.map(|p| self.compile_child(p)).transpose()?;

        let was_in_decorator = std::mem::replace(&mut self.in_decorator, true);
        self.setup_full_mustache_params(sexpr, program_guid, None, false)?;
        self.opcode(Opcode::RegisterDecorator {
            param_size: sexpr.params.len(),
            name: sexpr_name(sexpr),
        });
        self.in_decorator = was_in_decorator;
        Ok(())
    }

    fn sub_expression(&mut self, sexpr: &SubExpr) -> Result<(), CompileError> {
        match self.classify(sexpr)? {
            SexprKind::Helper => self.helper_sexpr(sexpr, None, None),
            SexprKind::Simple => self.simple_sexpr(sexpr),
            SexprKind::Ambiguous => self.ambiguous_sexpr(sexpr, None, None),
        }
    }

    fn classify(&self, sexpr: &SubExpr) -> Result<SexprKind, CompileError> {
        let path = sexpr.path_expr();
        let is_simple_path = path.map(|p| p.is_simple_id()).unwrap_or(false);
        let is_block_param = is_simple_path
            && path
                .map(|p| self.block_param_index(p.head()).is_some())
                .unwrap_or(false);
        let is_helper = !is_block_param && sexpr.is_helper_call();
        let is_eligible = !is_block_param && (is_helper || is_simple_path);

        if is_eligible && !is_helper {
            let name = path.map(PathExpr::head).unwrap_or_default();
            if self.options.is_known_helper(name) {
                return Ok(SexprKind::Helper);
            }
            if self.options.known_helpers_only {
                return Err(CompileError::UnknownHelper(name.to_string()));
            }
        }

        if is_helper {
            Ok(SexprKind::Helper)
        } else if is_eligible {
            Ok(SexprKind::Ambiguous)
        } else {
            Ok(SexprKind::Simple)
        }
    }

    fn helper_sexpr(
        &mut self,
        sexpr: &SubExpr,
        program: Option<usize>,
        inverse: Option<usize>,
    ) -> Result<(), CompileError> {
        let param_size = sexpr.params.len();
        self.setup_full_mustache_params(sexpr, program, inverse, false)?;

        let path = sexpr
            .path_expr()
            .ok_or_else(|| CompileError::MalformedNode("helper call without a path".into()))?;
        let name = path.head().to_string();

        if self.options.is_known_helper(&name) {
            self.opcode(Opcode::InvokeKnownHelper { param_size, name });
        } else if self.options.known_helpers_only {
            return Err(CompileError::UnknownHelper(name));
        } else {
            // The helper value itself is looked up so a context-held callable
            // can stand in when the registry has no entry.
            self.compile_path(path, true, true)?;
            self.opcode(Opcode::InvokeHelper {
                param_size,
                name: path.original.clone(),
                is_simple: path.is_simple_id(),
            });
        }
        Ok(())
    }

    fn ambiguous_sexpr(
        &mut self,
        sexpr: &SubExpr,
        program: Option<usize>,
        inverse: Option<usize>,
    ) -> Result<(), CompileError> {
        let path = sexpr
            .path_expr()
            .ok_or_else(|| CompileError::MalformedNode("ambiguous call without a path".into()))?;
        let name = path.head().to_string();

        self.add_depth(path.depth);
        self.opcode(Opcode::GetContext(path.depth));
        self.opcode(Opcode::PushProgram(program));
        self.opcode(Opcode::PushProgram(inverse));

        self.compile_path(path, true, path.falsy)?;

        self.opcode(Opcode::InvokeAmbiguous {
            name,
            is_block: program.is_some() || inverse.is_some(),
        });
        Ok(())
    }

    fn simple_sexpr(&mut self, sexpr: &SubExpr) -> Result<(), CompileError> {
        self.accept_expr(&sexpr.path)?;
        self.opcode(Opcode::ResolvePossibleLambda);
        Ok(())
    }

    fn accept_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Path(path) => self.compile_path(path, false, path.falsy),
            Expr::String(s) => {
                self.opcode(Opcode::PushLiteral(Literal::String(s.clone())));
                Ok(())
            }
            Expr::Number(n) => {
                self.opcode(Opcode::PushLiteral(number_literal(*n)));
                Ok(())
            }
            Expr::Boolean(b) => {
                self.opcode(Opcode::PushLiteral(Literal::Bool(*b)));
                Ok(())
            }
            Expr::Null => {
                self.opcode(Opcode::PushLiteral(Literal::Null));
                Ok(())
            }
            Expr::Undefined => {
                self.opcode(Opcode::PushLiteral(Literal::Undefined));
                Ok(())
            }
            Expr::SubExpr(sub) => self.sub_expression(sub),
        }
    }

    fn compile_path(
        &mut self,
        path: &PathExpr,
        strict: bool,
        falsy: bool,
    ) -> Result<(), CompileError> {
        self.add_depth(path.depth);
        self.opcode(Opcode::GetContext(path.depth));

        let name = path.head();
        let block_param = if path.depth == 0 && !path.scoped && !path.data {
            self.block_param_index(name)
        } else {
            None
        };

        if let Some(param) = block_param {
            self.opcode(Opcode::LookupBlockParam {
                param,
                parts: path.parts.clone(),
            });
        } else if name.is_empty() {
            // Bare `this` or `.`
            self.opcode(Opcode::PushContext);
        } else if path.data {
            self.opcode(Opcode::LookupData {
                depth: path.depth,
                parts: path.parts.clone(),
                strict,
            });
        } else {
            self.opcode(Opcode::LookupOnContext {
                parts: path.parts.clone(),
                falsy,
                strict,
                scoped: path.scoped,
            });
        }
        Ok(())
    }

    fn setup_full_mustache_params(
        &mut self,
        sexpr: &SubExpr,
        program: Option<usize>,
        inverse: Option<usize>,
        omit_empty: bool,
    ) -> Result<(), CompileError> {
        for param in &sexpr.params {
            self.push_param(param)?;
        }
        self.opcode(Opcode::PushProgram(program));
        self.opcode(Opcode::PushProgram(inverse));
        match &sexpr.hash {
            Some(h) => self.hash(h)?,
            None => self.opcode(Opcode::EmptyHash { omit_empty }),
        }
        Ok(())
    }

    fn push_param(&mut self, value: &Expr) -> Result<(), CompileError> {
        if self.options.string_params {
            let (string, param_type, depth) = describe_param(value);
            self.add_depth(depth);
            self.opcode(Opcode::GetContext(depth));
            self.opcode(Opcode::PushStringParam { string, param_type });
            if let Expr::SubExpr(sub) = value {
                // The sub-expression value rides along after its metadata.
                self.sub_expression(sub)?;
            }
            Ok(())
        } else {
            if self.options.track_ids {
                let id = self.param_id(value);
                self.opcode(Opcode::PushId(id));
            }
            self.accept_expr(value)
        }
    }

    fn param_id(&self, value: &Expr) -> ParamId {
        match value {
            Expr::Path(path) => {
                let block_param = if path.depth == 0 && !path.scoped && !path.data {
                    self.block_param_index(path.head())
                } else {
                    None
                };
                if let Some(param) = block_param {
                    ParamId::BlockParam {
                        param,
                        child: path.parts[1..].join("."),
                    }
                } else {
                    ParamId::Path(strip_this_prefix(&path.original))
                }
            }
            Expr::SubExpr(_) => ParamId::SubExpression,
            _ => ParamId::Literal,
        }
    }

    fn hash(&mut self, hash: &HashNode) -> Result<(), CompileError> {
        self.opcode(Opcode::PushHash);
        for (_, value) in &hash.pairs {
            self.push_param(value)?;
        }
        for (key, _) in hash.pairs.iter().rev() {
            self.opcode(Opcode::AssignToHash(key.clone()));
        }
        self.opcode(Opcode::PopHash);
        Ok(())
    }

    fn compile_child(&mut self, template: &Template) -> Result<usize, CompileError> {
        let child = Compiler::compile(
            template,
            self.options,
            Rc::clone(&self.guid_counter),
            &self.block_params_stack,
        )?;
        let guid = self.guid_counter.get();
        self.guid_counter.set(guid + 1);

        self.use_partial |= child.use_partial;
        // A child's reference to depth N is depth N-1 from here; depth 1
        // means this program's own context and needs no tracking.
        for &depth in &child.captured_depths {
            if depth >= 2 {
                self.add_depth(depth - 1);
            }
        }

        self.children.push(child);
        self.child_guids.push(guid);
        Ok(guid)
    }

    fn block_param_index(&self, name: &str) -> Option<[usize; 2]> {
        for (frame, params) in self.block_params_stack.iter().enumerate() {
            if let Some(slot) = params.iter().position(|p| p == name) {
                return Some([frame, slot]);
            }
        }
        None
    }

    fn add_depth(&mut self, depth: usize) {
        if depth > 0 {
            self.depths.insert(depth);
            self.use_depths = true;
        }
    }

    fn opcode(&mut self, op: Opcode) {
        if self.in_decorator {
            self.decorator_opcodes.push(op);
        } else {
            self.opcodes.push(op);
        }
    }
}

/// Display name for an invocation target, used in block-value dispatch and
/// error messages.
fn sexpr_name(sexpr: &SubExpr) -> String {
    match &sexpr.path {
        Expr::Path(path) => path.original.clone(),
        Expr::String(s) => s.clone(),
        Expr::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        Expr::Boolean(b) => b.to_string(),
        Expr::Null => "null".into(),
        Expr::Undefined => "undefined".into(),
        Expr::SubExpr(inner) => sexpr_name(inner),
    }
}

fn number_literal(n: f64) -> Literal {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
        Literal::Int(n as i64)
    } else {
        Literal::Float(n)
    }
}

/// Normalize a path for id tracking: explicit current-context prefixes drop,
/// ancestor segments stay.
fn strip_this_prefix(original: &str) -> String {
    let s = original;
    let s = s.strip_prefix("./").unwrap_or(s);
    if s == "this" || s == "." {
        return String::new();
    }
    s.strip_prefix("this.").unwrap_or(s).to_string()
}

/// String form plus type tag for string-params mode.
fn describe_param(value: &Expr) -> (String, String, usize) {
    match value {
        Expr::Path(path) => {
            let mut s = path.original.as_str();
            while let Some(rest) = s.strip_prefix("../") {
                s = rest;
            }
            (
                strip_this_prefix(s),
                "PathExpression".into(),
                path.depth,
            )
        }
        Expr::String(s) => (s.clone(), "StringLiteral".into(), 0),
        Expr::Number(n) => {
            let text = match number_literal(*n) {
                Literal::Int(i) => i.to_string(),
                other => match other {
                    Literal::Float(f) => f.to_string(),
                    _ => unreachable!(),
                },
            };
            (text, "NumberLiteral".into(), 0)
        }
        Expr::Boolean(b) => (b.to_string(), "BooleanLiteral".into(), 0),
        Expr::Null => ("null".into(), "NullLiteral".into(), 0),
        Expr::Undefined => ("undefined".into(), "UndefinedLiteral".into(), 0),
        Expr::SubExpr(_) => (String::new(), "SubExpression".into(), 0),
    }
}
