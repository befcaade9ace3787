// src/runtime/vm.rs
//! Stack-machine interpreter over the flattened opcode table.
//!
//! One `Exec` exists per program activation; it owns the value stack, the
//! hash builders and the two dispatch registers (`last_context`,
//! `last_helper`). Nested programs run through `VmProgram`, which captures
//! the activation state a block body needs and implements the same
//! `ProgramCall` capability the generated-closure backend exposes, so helper
//! code cannot tell which backend invoked it.

use std::rc::Rc;

use crate::compiler::flatten::FlatTable;
use crate::compiler::opcode::{CompiledFlags, Literal, Opcode, ParamId, Program};
use crate::runtime::context::{BlockParams, BlockParamsFrame, DataFrame, DepthList};
use crate::runtime::escape::escape_expression;
use crate::runtime::partial::{indent_lines, partial_context, partial_name_from_value, resolve_partial};
use crate::runtime::value::{Value, ValueMap};
use crate::runtime::{
    block_helper_missing_hook, invoke_helper_chain, resolve_lambda, DecoratorCall,
    DecoratorProps, FrameOverrides, HelperCall, Partial, ProgramCall, RenderContext,
};
use crate::{CompileError, RenderError, Renderer};

/// The interpreting backend: a validated flat table plus the compiled flags.
#[derive(Debug)]
pub struct VmTemplate {
    table: Rc<FlatTable>,
    flags: Rc<CompiledFlags>,
}

impl VmTemplate {
    pub fn new(program: &Program, flags: Rc<CompiledFlags>) -> Result<Self, CompileError> {
        let table = FlatTable::build(program)?;
        validate_stack_balance(&table, &flags)?;
        Ok(Self {
            table: Rc::new(table),
            flags,
        })
    }
}

impl Renderer for VmTemplate {
    fn render(
        &self,
        rcx: &RenderContext,
        context: &Value,
        data: Option<&Value>,
    ) -> Result<String, RenderError> {
        let data = if self.flags.use_data || data.is_some() {
            Some(DataFrame::root(data, context))
        } else {
            None
        };
        run_program(
            &self.table,
            0,
            rcx,
            context,
            &DepthList::default(),
            data,
            &BlockParams::default(),
            None,
        )
    }
}

/// A block body captured as a callable: the bridge between opcode execution
/// and the helper protocol.
struct VmProgram {
    table: Rc<FlatTable>,
    id: usize,
    depths: DepthList,
    data: Option<Rc<DataFrame>>,
    block_params: BlockParams,
}

impl ProgramCall for VmProgram {
    fn call(
        &self,
        rcx: &RenderContext,
        context: &Value,
        frame: FrameOverrides,
    ) -> Result<String, RenderError> {
        let data = frame.data.or_else(|| self.data.clone());
        run_program(
            &self.table,
            self.id,
            rcx,
            context,
            &self.depths,
            data,
            &self.block_params,
            frame.block_params,
        )
    }
}

/// The bare, undecorated body of a program: the innermost link of the
/// decorator wrapping chain. Calling it never re-runs the decorator stream.
struct VmBody {
    table: Rc<FlatTable>,
    id: usize,
    depths: DepthList,
    data: Option<Rc<DataFrame>>,
    block_params: BlockParams,
    frame: Option<BlockParamsFrame>,
}

impl ProgramCall for VmBody {
    fn call(
        &self,
        rcx: &RenderContext,
        context: &Value,
        overrides: FrameOverrides,
    ) -> Result<String, RenderError> {
        let data = overrides.data.or_else(|| self.data.clone());
        let frame = overrides.block_params.or_else(|| self.frame.clone());
        run_body(
            &self.table,
            self.id,
            rcx,
            context,
            &self.depths,
            data,
            &self.block_params,
            frame,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn run_program(
    table: &Rc<FlatTable>,
    id: usize,
    rcx: &RenderContext,
    context: &Value,
    parent_depths: &DepthList,
    data: Option<Rc<DataFrame>>,
    parent_block_params: &BlockParams,
    frame: Option<BlockParamsFrame>,
) -> Result<String, RenderError> {
    let flat = table
        .program(id)
        .ok_or_else(|| RenderError::Internal(format!("no program {id} in table")))?;

    if !flat.use_decorators {
        return run_body(
            table,
            id,
            rcx,
            context,
            parent_depths,
            data,
            parent_block_params,
            frame,
        );
    }

    // The registration stream runs under the activation's own state.
    let depths = parent_depths.pushed(context);
    let mut block_params = parent_block_params.clone();
    block_params.push_frame(frame.clone().unwrap_or_default());
    let mut exec = Exec {
        rcx,
        table,
        context,
        depths: &depths,
        data: data.clone(),
        block_params: &block_params,
        stack: Vec::new(),
        hash_stack: Vec::new(),
        last_context: 0,
        last_helper: None,
        out: String::new(),
        pending_decorators: Vec::new(),
    };
    let stream = table.decorators(id).unwrap_or(&[]);
    exec.run(stream)?;
    let registrations = std::mem::take(&mut exec.pending_decorators);

    // Each decorator sees the chain built so far and may replace it.
    let mut props = DecoratorProps::default();
    let mut current: Rc<dyn ProgramCall> = Rc::new(VmBody {
        table: Rc::clone(table),
        id,
        depths: parent_depths.clone(),
        data,
        block_params: parent_block_params.clone(),
        frame,
    });
    let ordered: Box<dyn Iterator<Item = (String, DecoratorCall)>> = if rcx.flags.alternate_decorators {
        Box::new(registrations.into_iter().rev())
    } else {
        Box::new(registrations.into_iter())
    };
    for (name, call) in ordered {
        let decorator = rcx
            .decorators
            .get(&name)
            .ok_or_else(|| RenderError::DecoratorMissing(name.clone()))?
            .clone();
        if let Some(wrapped) = decorator.call(&call, &current, &mut props, rcx)? {
            current = wrapped;
        }
    }

    rcx.push_inline_partials(props.partials);
    let result = current.call(rcx, context, FrameOverrides::default());
    rcx.pop_inline_partials();
    result
}

#[allow(clippy::too_many_arguments)]
fn run_body(
    table: &Rc<FlatTable>,
    id: usize,
    rcx: &RenderContext,
    context: &Value,
    parent_depths: &DepthList,
    data: Option<Rc<DataFrame>>,
    parent_block_params: &BlockParams,
    frame: Option<BlockParamsFrame>,
) -> Result<String, RenderError> {
    let flat = table
        .program(id)
        .ok_or_else(|| RenderError::Internal(format!("no program {id} in table")))?;

    let depths = parent_depths.pushed(context);
    let mut block_params = parent_block_params.clone();
    // One frame per activation keeps runtime indices aligned with the
    // compiler's lexical frames.
    block_params.push_frame(frame.unwrap_or_default());

    let mut exec = Exec {
        rcx,
        table,
        context,
        depths: &depths,
        data,
        block_params: &block_params,
        stack: Vec::new(),
        hash_stack: Vec::new(),
        last_context: 0,
        last_helper: None,
        out: String::new(),
        pending_decorators: Vec::new(),
    };
    exec.run(&flat.opcodes)?;
    Ok(exec.out)
}

enum StackItem {
    Value(Value),
    Program(Option<usize>),
    Hash(HashBuilder),
}

#[derive(Default)]
struct HashBuilder {
    values: ValueMap,
    ids: ValueMap,
    types: ValueMap,
    contexts: ValueMap,
    /// An omitted empty hash renders as "no hash at all" for partials.
    omitted: bool,
}

/// A fully-popped invocation: the helper call plus hash presence.
struct CallParts {
    call: HelperCall,
    hash_omitted: bool,
}

struct Exec<'a> {
    rcx: &'a RenderContext,
    table: &'a Rc<FlatTable>,
    context: &'a Value,
    depths: &'a DepthList,
    data: Option<Rc<DataFrame>>,
    block_params: &'a BlockParams,
    stack: Vec<StackItem>,
    hash_stack: Vec<HashBuilder>,
    last_context: usize,
    last_helper: Option<String>,
    out: String,
    pending_decorators: Vec<(String, DecoratorCall)>,
}

impl Exec<'_> {
    fn run(&mut self, opcodes: &[Opcode]) -> Result<(), RenderError> {
        for op in opcodes {
            self.step(op)?;
        }
        Ok(())
    }

    fn step(&mut self, op: &Opcode) -> Result<(), RenderError> {
        match op {
            Opcode::AppendContent(text) => {
                self.out.push_str(text);
            }
            Opcode::Append => {
                let value = self.pop_value()?;
                if !value.is_nullish() {
                    self.out.push_str(&value.render(self.rcx.flags.js_compat));
                }
            }
            Opcode::AppendEscaped => {
                let value = self.pop_value()?;
                let escaped = escape_expression(&value, self.context)?;
                self.out.push_str(&escaped);
            }
            Opcode::GetContext(depth) => {
                self.last_context = *depth;
            }
            Opcode::PushContext => {
                let value = self.depths.at(self.last_context);
                self.push_value(value);
            }
            Opcode::LookupOnContext {
                parts,
                falsy,
                strict: _,
                scoped,
            } => {
                let mut rest = parts.as_slice();
                let head = match parts.first() {
                    Some(h) => h,
                    None => {
                        self.push_value(self.depths.at(self.last_context));
                        return Ok(());
                    }
                };
                let value = if !scoped && self.rcx.flags.compat && self.last_context == 0 {
                    // Compat semantics: scan outward for the first ancestor
                    // defining the head segment.
                    rest = &parts[1..];
                    self.depths
                        .find_containing(head)
                        .and_then(|ctx| ctx.get(head))
                        .cloned()
                        .unwrap_or(Value::Missing)
                } else {
                    self.depths.at(self.last_context)
                };
                self.push_value(resolve_parts(value, rest, *falsy));
            }
            Opcode::LookupData {
                depth,
                parts,
                strict: _,
            } => {
                let frame = self
                    .data
                    .as_ref()
                    .and_then(|d| DataFrame::at_depth(d, *depth));
                let value = match (&frame, parts.first()) {
                    (Some(frame), Some(head)) => frame.get(head),
                    _ => Value::Missing,
                };
                let value = resolve_parts(value, parts.get(1..).unwrap_or(&[]), true);
                self.push_value(value);
            }
            Opcode::LookupBlockParam { param, parts } => {
                let value = self.block_params.value(*param);
                let value = resolve_parts(value, parts.get(1..).unwrap_or(&[]), false);
                self.push_value(value);
            }
            Opcode::ResolvePossibleLambda => {
                let value = self.pop_value()?;
                let resolved = resolve_lambda(value, self.context)?;
                self.push_value(resolved);
            }
            Opcode::PushLiteral(literal) => {
                self.push_value(literal_value(literal));
            }
            Opcode::PushProgram(id) => {
                self.stack.push(StackItem::Program(*id));
            }
            Opcode::PushHash => {
                self.hash_stack.push(HashBuilder::default());
            }
            Opcode::AssignToHash(key) => {
                let value = self.pop_value()?;
                let id = if self.rcx.flags.track_ids {
                    Some(self.pop_value()?)
                } else {
                    None
                };
                let (param_type, param_context) = if self.rcx.flags.string_params {
                    (Some(self.pop_value()?), Some(self.pop_value()?))
                } else {
                    (None, None)
                };

                let hash = self
                    .hash_stack
                    .last_mut()
                    .ok_or_else(|| RenderError::Internal("hash assignment without builder".into()))?;
                hash.values.insert(key.clone(), value);
                if let Some(id) = id {
                    hash.ids.insert(key.clone(), id);
                }
                if let Some(t) = param_type {
                    hash.types.insert(key.clone(), t);
                }
                if let Some(c) = param_context {
                    hash.contexts.insert(key.clone(), c);
                }
            }
            Opcode::PopHash => {
                let hash = self
                    .hash_stack
                    .pop()
                    .ok_or_else(|| RenderError::Internal("pop of missing hash builder".into()))?;
                self.stack.push(StackItem::Hash(hash));
            }
            Opcode::EmptyHash { omit_empty } => {
                self.stack.push(StackItem::Hash(HashBuilder {
                    omitted: *omit_empty,
                    ..HashBuilder::default()
                }));
            }
            Opcode::InvokeHelper {
                param_size,
                name,
                is_simple,
            } => {
                let fallback = self.pop_value()?;
                let parts = self.setup_params(name, *param_size)?;
                let result = invoke_helper_chain(self.rcx, *is_simple, fallback, parts.call)?;
                self.push_value(result);
            }
            Opcode::InvokeKnownHelper { param_size, name } => {
                let parts = self.setup_params(name, *param_size)?;
                let helper = self
                    .rcx
                    .helpers
                    .get(name)
                    .ok_or_else(|| RenderError::HelperMissing(name.clone()))?
                    .clone();
                let result = helper.call(&parts.call, self.rcx)?;
                self.push_value(result);
            }
            Opcode::InvokeAmbiguous { name, is_block: _ } => {
                let value = self.pop_value()?;
                // The preamble pushed only programs; the hash is synthetic.
                self.stack.push(StackItem::Hash(HashBuilder::default()));
                let parts = self.setup_params(name, 0)?;

                let result = if let Some(helper) = self.rcx.helpers.get(name).cloned() {
                    self.last_helper = Some(name.clone());
                    helper.call(&parts.call, self.rcx)?
                } else {
                    self.last_helper = None;
                    match value {
                        Value::Lambda(lambda) => lambda.call(self.context, &[])?,
                        v if v.is_nullish() => {
                            invoke_helper_chain(self.rcx, false, Value::Missing, parts.call)?
                        }
                        v => v,
                    }
                };
                self.push_value(result);
            }
            Opcode::InvokePartial {
                is_dynamic,
                name,
                indent,
            } => {
                let static_name = name.clone().unwrap_or_default();
                let parts = self.setup_params(&static_name, 1)?;
                let name = if *is_dynamic {
                    partial_name_from_value(&self.pop_value()?)?
                } else {
                    static_name
                };

                let hash = if parts.hash_omitted {
                    None
                } else {
                    Some(&parts.call.hash)
                };
                let context = partial_context(&parts.call.param(0), hash);
                let rendered = self.render_partial(&name, &context)?;
                let rendered = if indent.is_empty() {
                    rendered
                } else {
                    indent_lines(&rendered, indent)
                };
                self.push_value(Value::from(rendered));
            }
            Opcode::BlockValue(name) => {
                let mut parts = self.setup_params(name, 0)?;
                let value = self.pop_value()?;
                parts.call.params = vec![value];
                let result = block_helper_missing_hook(self.rcx, parts.call)?;
                self.push_value(result);
            }
            Opcode::AmbiguousBlockValue => {
                let mut parts = self.setup_params("", 0)?;
                if self.last_helper.is_none() {
                    let current = self.pop_value()?;
                    parts.call.params = vec![current];
                    let result = block_helper_missing_hook(self.rcx, parts.call)?;
                    self.push_value(result);
                }
            }
            Opcode::RegisterDecorator { param_size, name } => {
                let parts = self.setup_params(name, *param_size)?;
                let call = DecoratorCall {
                    name: name.clone(),
                    context: parts.call.context,
                    params: parts.call.params,
                    hash: parts.call.hash,
                    data: parts.call.data,
                    program: parts.call.program,
                };
                self.pending_decorators.push((name.clone(), call));
            }
            Opcode::PushId(id) => {
                let value = match id {
                    ParamId::Path(path) => Value::from(path.clone()),
                    ParamId::Literal => Value::Null,
                    ParamId::SubExpression => Value::Bool(true),
                    ParamId::BlockParam { param, child } => {
                        let base = self.block_params.path(*param).render(false);
                        if child.is_empty() {
                            Value::from(base)
                        } else {
                            Value::from(format!("{base}.{child}"))
                        }
                    }
                };
                self.push_value(value);
            }
            Opcode::PushStringParam { string, param_type } => {
                self.push_value(self.depths.at(self.last_context));
                self.push_value(Value::from(param_type.clone()));
                if param_type != "SubExpression" {
                    self.push_value(Value::from(string.clone()));
                }
            }
        }
        Ok(())
    }

    fn render_partial(&self, name: &str, context: &Value) -> Result<String, RenderError> {
        render_resolved_partial(self.rcx, name, context, self.depths, self.data.clone())
    }

    /// Pop a full invocation in reverse push order: hash, inverse, program,
    /// then each param (with its per-mode metadata) back to front.
    fn setup_params(&mut self, name: &str, param_size: usize) -> Result<CallParts, RenderError> {
        let hash = self.pop_hash()?;
        let inverse = self.pop_program()?;
        let program = self.pop_program()?;

        let track_ids = self.rcx.flags.track_ids;
        let string_params = self.rcx.flags.string_params;

        let mut params = vec![Value::Missing; param_size];
        let mut ids = vec![Value::Null; if track_ids { param_size } else { 0 }];
        let mut types = vec![Value::Null; if string_params { param_size } else { 0 }];
        let mut contexts = vec![Value::Null; if string_params { param_size } else { 0 }];

        for i in (0..param_size).rev() {
            let value = self.pop_value()?;
            if track_ids {
                ids[i] = self.pop_value()?;
            }
            if string_params {
                types[i] = self.pop_value()?;
                contexts[i] = self.pop_value()?;
            }
            params[i] = value;
        }

        let call = HelperCall {
            name: name.to_string(),
            context: self.context.clone(),
            params,
            hash: hash.values,
            data: self.data.clone(),
            program: self.program_ref(program),
            inverse: self.program_ref(inverse),
            ids: track_ids.then_some(ids),
            hash_ids: track_ids.then_some(hash.ids),
            param_types: string_params.then_some(types),
            param_contexts: string_params.then_some(contexts),
            hash_types: string_params.then_some(hash.types),
            hash_contexts: string_params.then_some(hash.contexts),
        };
        Ok(CallParts {
            call,
            hash_omitted: hash.omitted,
        })
    }

    fn program_ref(&self, id: Option<usize>) -> Option<Rc<dyn ProgramCall>> {
        id.map(|id| {
            Rc::new(VmProgram {
                table: Rc::clone(self.table),
                id,
                depths: self.depths.clone(),
                data: self.data.clone(),
                block_params: self.block_params.clone(),
            }) as Rc<dyn ProgramCall>
        })
    }

    fn push_value(&mut self, value: Value) {
        self.stack.push(StackItem::Value(value));
    }

    fn pop_value(&mut self) -> Result<Value, RenderError> {
        match self.stack.pop() {
            Some(StackItem::Value(v)) => Ok(v),
            Some(_) => Err(RenderError::Internal("expected value on stack".into())),
            None => Err(RenderError::StackUnderflow),
        }
    }

    fn pop_program(&mut self) -> Result<Option<usize>, RenderError> {
        match self.stack.pop() {
            Some(StackItem::Program(p)) => Ok(p),
            Some(_) => Err(RenderError::Internal("expected program on stack".into())),
            None => Err(RenderError::StackUnderflow),
        }
    }

    fn pop_hash(&mut self) -> Result<HashBuilder, RenderError> {
        match self.stack.pop() {
            Some(StackItem::Hash(h)) => Ok(h),
            Some(_) => Err(RenderError::Internal("expected hash on stack".into())),
            None => Err(RenderError::StackUnderflow),
        }
    }
}

/// Partial dispatch shared by both backends: resolve the name, then run the
/// registered body as its own root program. Compat-compiled templates pass
/// their ancestor contexts through; otherwise the partial starts a fresh
/// depth chain. Bound partials (inline registrations) run as the program
/// they captured.
pub(crate) fn render_resolved_partial(
    rcx: &RenderContext,
    name: &str,
    context: &Value,
    caller_depths: &DepthList,
    data: Option<Rc<DataFrame>>,
) -> Result<String, RenderError> {
    match resolve_partial(rcx, name)? {
        Partial::Template(program) => {
            let table =
                FlatTable::build(&program).map_err(|e| RenderError::Internal(e.to_string()))?;
            let depths = if rcx.flags.compat {
                caller_depths.clone()
            } else {
                DepthList::default()
            };
            run_program(
                &Rc::new(table),
                0,
                rcx,
                context,
                &depths,
                data,
                &BlockParams::default(),
                None,
            )
        }
        Partial::Bound(program) => {
            let frame = match data {
                Some(data) => FrameOverrides::with_data(data),
                None => FrameOverrides::default(),
            };
            program.call(rcx, context, frame)
        }
    }
}

/// Walk trailing path segments. Without `falsy`, a nullish intermediate is
/// carried through unchanged; with it, any falsy intermediate short-circuits.
pub(crate) fn resolve_parts(mut value: Value, parts: &[String], falsy: bool) -> Value {
    for part in parts {
        let walkable = if falsy {
            !value.is_falsy()
        } else {
            !value.is_nullish()
        };
        if !walkable {
            return value;
        }
        value = value.get(part).cloned().unwrap_or(Value::Missing);
    }
    value
}

pub(crate) fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Undefined => Value::Missing,
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::from(s.clone()),
    }
}

/// Abstract stack simulation over every stream in the table: depth must
/// never go negative and must return to zero, or the compile is rejected
/// before anything executes.
pub(crate) fn validate_stack_balance(
    table: &FlatTable,
    flags: &CompiledFlags,
) -> Result<(), CompileError> {
    for id in 0..table.len() {
        if let Some(flat) = table.program(id) {
            check_stream(&flat.opcodes, flags)
                .map_err(|msg| CompileError::StackImbalance(format!("program {id}: {msg}")))?;
        }
        if let Some(stream) = table.decorators(id) {
            check_stream(stream, flags).map_err(|msg| {
                CompileError::StackImbalance(format!("decorators of program {id}: {msg}"))
            })?;
        }
    }
    Ok(())
}

fn check_stream(opcodes: &[Opcode], flags: &CompiledFlags) -> Result<(), String> {
    // Stack cost of one pushed param, metadata included.
    let per_param: i64 = 1 + flags.track_ids as i64 + 2 * flags.string_params as i64;
    let mut depth: i64 = 0;
    let mut hash_depth: i64 = 0;

    for op in opcodes {
        let delta = match op {
            Opcode::AppendContent(_) | Opcode::GetContext(_) | Opcode::ResolvePossibleLambda => 0,
            Opcode::Append | Opcode::AppendEscaped => -1,
            Opcode::PushContext
            | Opcode::LookupOnContext { .. }
            | Opcode::LookupData { .. }
            | Opcode::LookupBlockParam { .. }
            | Opcode::PushLiteral(_)
            | Opcode::PushProgram(_)
            | Opcode::EmptyHash { .. }
            | Opcode::PushId(_) => 1,
            Opcode::PushHash => {
                hash_depth += 1;
                0
            }
            Opcode::AssignToHash(_) => -per_param,
            Opcode::PopHash => {
                hash_depth -= 1;
                if hash_depth < 0 {
                    return Err("hash builder underflow".into());
                }
                1
            }
            Opcode::PushStringParam { param_type, .. } => {
                if param_type == "SubExpression" {
                    2
                } else {
                    3
                }
            }
            Opcode::InvokeHelper { param_size, .. } => -(3 + per_param * *param_size as i64),
            Opcode::InvokeKnownHelper { param_size, .. } => -(2 + per_param * *param_size as i64),
            Opcode::InvokeAmbiguous { .. } => -2,
            Opcode::InvokePartial { is_dynamic, .. } => {
                -(2 + per_param) - i64::from(*is_dynamic)
            }
            Opcode::BlockValue(_) => -3,
            Opcode::AmbiguousBlockValue => -3,
            Opcode::RegisterDecorator { param_size, .. } => {
                -(3 + per_param * *param_size as i64)
            }
        };
        depth += delta;
        if depth < 0 {
            return Err(format!("stack underflow at {op:?}"));
        }
    }

    if depth != 0 {
        return Err(format!("stream ends with {depth} values on the stack"));
    }
    if hash_depth != 0 {
        return Err(format!("stream ends with {hash_depth} open hash builders"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, HashNode, Node, SubExpr, Template};
    use crate::compiler::{compile, CompileOptions};
    use crate::runtime::helpers::register_builtins;
    use crate::runtime::{Registry, RenderOptions};

    fn render(template: Template, context: Value) -> String {
        render_with(template, context, CompileOptions::default(), RenderOptions::default())
    }

    fn render_with(
        template: Template,
        context: Value,
        compile_options: CompileOptions,
        render_options: RenderOptions,
    ) -> String {
        try_render(template, context, compile_options, render_options).unwrap()
    }

    fn try_render(
        template: Template,
        context: Value,
        compile_options: CompileOptions,
        render_options: RenderOptions,
    ) -> Result<String, RenderError> {
        let (program, flags) = compile(&template, &compile_options).unwrap();
        let flags = Rc::new(flags);
        let vm = VmTemplate::new(&program, Rc::clone(&flags)).unwrap();

        let mut helpers = Registry::new();
        let mut decorators = Registry::new();
        register_builtins(&mut helpers, &mut decorators);
        let rcx = RenderContext::new(
            helpers.layered(render_options.helpers),
            Registry::new().layered(render_options.partials),
            decorators.layered(render_options.decorators),
            flags,
        );
        vm.render(&rcx, &context, render_options.data.as_ref())
    }

    fn object(pairs: &[(&str, Value)]) -> Value {
        let mut map = ValueMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        Value::object(map)
    }

    #[test]
    fn test_escaped_interpolation() {
        let template = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["name"])))]);
        let context = object(&[("name", Value::from("A&B"))]);
        assert_eq!(render(template, context), "A&amp;B");
    }

    #[test]
    fn test_unescaped_interpolation() {
        let template = Template::new(vec![Node::unescaped(SubExpr::new(Expr::path(&["name"])))]);
        let context = object(&[("name", Value::from("A&B"))]);
        assert_eq!(render(template, context), "A&B");
    }

    #[test]
    fn test_missing_value_renders_empty() {
        let template = Template::new(vec![
            Node::content("["),
            Node::mustache(SubExpr::new(Expr::path(&["gone"]))),
            Node::content("]"),
        ]);
        assert_eq!(render(template, object(&[])), "[]");
    }

    #[test]
    fn test_dotted_path_walk() {
        let template = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&[
            "user", "name",
        ])))]);
        let context = object(&[("user", object(&[("name", Value::from("Ada"))]))]);
        assert_eq!(render(template, context), "Ada");
    }

    #[test]
    fn test_each_with_index_data() {
        let inner = Template::new(vec![
            Node::mustache(SubExpr::new(Expr::data_path(&["index"]))),
            Node::content(":"),
            Node::mustache(SubExpr::new(Expr::this())),
            Node::content(" "),
        ]);
        let template = Template::new(vec![Node::block(
            SubExpr::helper("each", vec![Expr::path(&["items"])]),
            Some(inner),
            None,
        )]);
        let context = object(&[("items", Value::from(vec!["x", "y"]))]);
        assert_eq!(render(template, context), "0:x 1:y ");
    }

    #[test]
    fn test_parent_context_lookup() {
        let inner = Template::new(vec![
            Node::mustache(SubExpr::new(Expr::parent_path(&["title"], 1))),
            Node::content("/"),
            Node::mustache(SubExpr::new(Expr::path(&["name"]))),
        ]);
        let template = Template::new(vec![Node::block(
            SubExpr::helper("with", vec![Expr::path(&["person"])]),
            Some(inner),
            None,
        )]);
        let context = object(&[
            ("title", Value::from("T")),
            ("person", object(&[("name", Value::from("N"))])),
        ]);
        assert_eq!(render(template, context), "T/N");
    }

    #[test]
    fn test_if_else_branches() {
        let build = |flag: bool| {
            let template = Template::new(vec![Node::block(
                SubExpr::helper("if", vec![Expr::path(&["ok"])]),
                Some(Template::new(vec![Node::content("yes")])),
                Some(Template::new(vec![Node::content("no")])),
            )]);
            render(template, object(&[("ok", Value::Bool(flag))]))
        };
        assert_eq!(build(true), "yes");
        assert_eq!(build(false), "no");
    }

    #[test]
    fn test_ambiguous_block_over_plain_value() {
        let inner = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["name"])))]);
        let template = Template::new(vec![Node::block(
            SubExpr::new(Expr::path(&["person"])),
            Some(inner),
            None,
        )]);
        let context = object(&[("person", object(&[("name", Value::from("Ada"))]))]);
        assert_eq!(render(template, context), "Ada");
    }

    #[test]
    fn test_ambiguous_block_over_array_iterates() {
        let inner = Template::new(vec![Node::mustache(SubExpr::new(Expr::this()))]);
        let template = Template::new(vec![Node::block(
            SubExpr::new(Expr::path(&["items"])),
            Some(inner),
            None,
        )]);
        let context = object(&[("items", Value::from(vec!["a", "b"]))]);
        assert_eq!(render(template, context), "ab");
    }

    #[test]
    fn test_helper_missing_error() {
        let sexpr = SubExpr::helper("foo", vec![Expr::Number(1.0)]);
        let template = Template::new(vec![Node::mustache(sexpr)]);
        let err = try_render(
            template,
            object(&[]),
            CompileOptions::default(),
            RenderOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Helper missing: foo");
    }

    #[test]
    fn test_custom_helper_with_hash() {
        use crate::runtime::Helper;
        let sexpr = SubExpr::new(Expr::path(&["wrap"])).with_hash(HashNode::new(vec![(
            "tag",
            Expr::String("b".into()),
        )]));
        let template = Template::new(vec![Node::mustache(sexpr)]);
        let options = RenderOptions::default().with_helper(
            "wrap",
            Helper::from_fn(|call, _| {
                let tag = call.hash_value("tag").cloned().unwrap_or(Value::Missing);
                Ok(Value::from(format!("<{}>", tag.render(false))))
            }),
        );
        assert_eq!(
            render_with(template, object(&[]), CompileOptions::default(), options),
            "&lt;b&gt;"
        );
    }

    #[test]
    fn test_lambda_resolution_in_mustache() {
        use crate::runtime::Lambda;
        let template = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["now"])))]);
        let context = object(&[(
            "now",
            Value::Lambda(Lambda::new(|_| Ok(Value::from("later")))),
        )]);
        assert_eq!(render(template, context), "later");
    }

    #[test]
    fn test_partial_invocation_with_indent() {
        let (partial, _) = compile(
            &Template::new(vec![
                Node::content("a\nb"),
            ]),
            &CompileOptions::default(),
        )
        .unwrap();
        let template = Template::new(vec![match Node::partial("p") {
            Node::Partial {
                name,
                context,
                hash,
                ..
            } => Node::Partial {
                name,
                context,
                hash,
                indent: "  ".into(),
            },
            _ => unreachable!(),
        }]);
        let options = RenderOptions::default()
            .with_partial("p", Partial::Template(Rc::new(partial)));
        assert_eq!(
            render_with(template, object(&[]), CompileOptions::default(), options),
            "  a\n  b"
        );
    }

    #[test]
    fn test_partial_missing_error() {
        let template = Template::new(vec![Node::partial("absent")]);
        let err = try_render(
            template,
            object(&[]),
            CompileOptions::default(),
            RenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::PartialMissing(name) if name == "absent"));
    }

    #[test]
    fn test_partial_hash_merges_over_context() {
        let (partial, _) = compile(
            &Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["x"])))]),
            &CompileOptions::default(),
        )
        .unwrap();
        let template = Template::new(vec![match Node::partial("p") {
            Node::Partial { name, context, .. } => Node::Partial {
                name,
                context,
                hash: Some(HashNode::new(vec![("x", Expr::String("h".into()))])),
                indent: String::new(),
            },
            _ => unreachable!(),
        }]);
        let options = RenderOptions::default()
            .with_partial("p", Partial::Template(Rc::new(partial)));
        let context = object(&[("x", Value::from("c"))]);
        assert_eq!(
            render_with(template, context, CompileOptions::default(), options),
            "h"
        );
    }

    #[test]
    fn test_block_params_bind_value_and_key() {
        let inner = Template::new(vec![
            Node::mustache(SubExpr::new(Expr::path(&["idx"]))),
            Node::content("="),
            Node::mustache(SubExpr::new(Expr::path(&["v"]))),
            Node::content(";"),
        ])
        .with_block_params(vec!["v".into(), "idx".into()]);
        let template = Template::new(vec![Node::block(
            SubExpr::helper("each", vec![Expr::path(&["items"])]),
            Some(inner),
            None,
        )]);
        let context = object(&[("items", Value::from(vec!["a", "b"]))]);
        assert_eq!(render(template, context), "0=a;1=b;");
    }

    struct Tagged {
        tag: &'static str,
        inner: Rc<dyn ProgramCall>,
    }

    impl ProgramCall for Tagged {
        fn call(
            &self,
            rcx: &RenderContext,
            context: &Value,
            frame: FrameOverrides,
        ) -> Result<String, RenderError> {
            let body = self.inner.call(rcx, context, frame)?;
            Ok(format!("{}({})", self.tag, body))
        }
    }

    fn tagging(tag: &'static str) -> crate::runtime::Decorator {
        crate::runtime::Decorator::from_fn(move |_, decorated, _, _| {
            Ok(Some(Rc::new(Tagged {
                tag,
                inner: Rc::clone(decorated),
            }) as Rc<dyn ProgramCall>))
        })
    }

    fn double_decorated() -> Template {
        Template::new(vec![
            Node::decorator_block(SubExpr::helper("first", vec![]), Template::new(vec![])),
            Node::decorator_block(SubExpr::helper("second", vec![]), Template::new(vec![])),
            Node::content("body"),
        ])
    }

    #[test]
    fn test_decorators_chain_around_the_body() {
        let options = RenderOptions::default()
            .with_decorator("first", tagging("first"))
            .with_decorator("second", tagging("second"));
        // The later registration wraps the earlier one's replacement.
        assert_eq!(
            render_with(
                double_decorated(),
                object(&[]),
                CompileOptions::default(),
                options
            ),
            "second(first(body))"
        );
    }

    #[test]
    fn test_alternate_decorators_reverse_the_chain() {
        let compile_options = CompileOptions {
            alternate_decorators: true,
            ..CompileOptions::default()
        };
        let options = RenderOptions::default()
            .with_decorator("first", tagging("first"))
            .with_decorator("second", tagging("second"));
        assert_eq!(
            render_with(double_decorated(), object(&[]), compile_options, options),
            "first(second(body))"
        );
    }

    #[test]
    fn test_inline_decorator_registers_partial() {
        let body = Template::new(vec![Node::content("inlined")]);
        let template = Template::new(vec![
            Node::decorator_block(
                SubExpr::helper("inline", vec![Expr::String("note".into())]),
                body,
            ),
            Node::partial("note"),
        ]);
        assert_eq!(render(template, object(&[])), "inlined");
    }

    #[test]
    fn test_compat_mode_depthed_lookup() {
        let inner = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["title"])))]);
        let template = Template::new(vec![Node::block(
            SubExpr::helper("with", vec![Expr::path(&["person"])]),
            Some(inner),
            None,
        )]);
        let context = object(&[
            ("title", Value::from("T")),
            ("person", object(&[("name", Value::from("N"))])),
        ]);

        // Without compat the inner lookup misses; with it the ancestor scan
        // finds the root value.
        assert_eq!(
            render_with(
                template.clone(),
                context.clone(),
                CompileOptions::default(),
                RenderOptions::default()
            ),
            ""
        );
        let compat = CompileOptions {
            compat: true,
            ..CompileOptions::default()
        };
        assert_eq!(
            render_with(template, context, compat, RenderOptions::default()),
            "T"
        );
    }

    #[test]
    fn test_root_data_reference() {
        let inner = Template::new(vec![Node::mustache(SubExpr::new(Expr::data_path(&[
            "root", "site",
        ])))]);
        let template = Template::new(vec![Node::block(
            SubExpr::helper("each", vec![Expr::path(&["items"])]),
            Some(inner),
            None,
        )]);
        let context = object(&[
            ("site", Value::from("S")),
            ("items", Value::from(vec!["x"])),
        ]);
        assert_eq!(render(template, context), "S");
    }

    #[test]
    fn test_stack_validation_rejects_corrupt_stream() {
        let mut program = Program::default();
        program.opcodes.push(Opcode::Append);
        let err = VmTemplate::new(&program, Rc::new(CompiledFlags::default())).unwrap_err();
        assert!(matches!(err, CompileError::StackImbalance(_)));
    }

    #[test]
    fn test_track_ids_context_path() {
        use crate::runtime::Helper;
        let sexpr = SubExpr::helper("whoami", vec![Expr::path(&["user", "name"])]);
        let template = Template::new(vec![Node::mustache(sexpr)]);
        let compile_options = CompileOptions {
            track_ids: true,
            ..CompileOptions::default()
        };
        let options = RenderOptions::default().with_helper(
            "whoami",
            Helper::from_fn(|call, _| {
                Ok(call.param_id(0).unwrap_or(Value::Missing))
            }),
        );
        let context = object(&[(
            "user",
            object(&[("name", Value::from("Ada"))]),
        )]);
        assert_eq!(
            render_with(template, context, compile_options, options),
            "user.name"
        );
    }
}
