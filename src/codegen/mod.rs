// src/codegen/mod.rs
//! Closure-composition backend.
//!
//! Where the interpreter walks opcodes at render time, this backend walks
//! them once at template-construction time, maintaining a compile-time stack
//! of value thunks and lowering each append into a statement closure. Render
//! calls then just execute the statement list. Cross-program references go
//! through a shared table cell that is populated after every program has
//! been lowered, so a block body can reference a sibling compiled later.
//!
//! The runtime protocol (helper calls, data frames, depth lists, partial
//! dispatch) is the same code the interpreter uses, which is what keeps the
//! two backends byte-identical.

use std::cell::OnceCell;
use std::rc::Rc;

use crate::compiler::flatten::FlatTable;
use crate::compiler::opcode::{CompiledFlags, Opcode, ParamId, Program};
use crate::runtime::context::{BlockParams, BlockParamsFrame, DataFrame, DepthList};
use crate::runtime::escape::escape_expression;
use crate::runtime::partial::{indent_lines, partial_context, partial_name_from_value};
use crate::runtime::value::{Value, ValueMap};
use crate::runtime::vm::{
    literal_value, render_resolved_partial, resolve_parts, validate_stack_balance,
};
use crate::runtime::{
    block_helper_missing_hook, invoke_helper_chain, resolve_lambda, DecoratorCall,
    DecoratorProps, FrameOverrides, HelperCall, ProgramCall, RenderContext,
};
use crate::{CompileError, RenderError, Renderer};

/// Activation state threaded to every generated closure.
pub struct Scope {
    pub context: Value,
    pub depths: DepthList,
    pub data: Option<Rc<DataFrame>>,
    pub block_params: BlockParams,
}

type Table = Rc<OnceCell<Vec<CgProgram>>>;
type ValueThunk = Rc<dyn Fn(&Scope, &RenderContext) -> Result<Value, RenderError>>;
/// Ambiguous resolution: the value plus whether a registry helper answered.
type AmbiguousThunk = Rc<dyn Fn(&Scope, &RenderContext) -> Result<(Value, bool), RenderError>>;
type DecoratorThunk = Rc<dyn Fn(&Scope, &RenderContext) -> Result<DecoratorCall, RenderError>>;

enum CgStatement {
    Content(String),
    Append(ValueThunk),
    AppendEscaped(ValueThunk),
}

struct CgProgram {
    statements: Vec<CgStatement>,
    decorators: Vec<(String, DecoratorThunk)>,
}

/// The generating backend: a table of lowered programs plus the compiled
/// flags.
pub struct CodeGenTemplate {
    table: Table,
    flags: Rc<CompiledFlags>,
}

impl CodeGenTemplate {
    pub fn new(program: &Program, flags: Rc<CompiledFlags>) -> Result<Self, CompileError> {
        let flat = FlatTable::build(program)?;
        validate_stack_balance(&flat, &flags)?;

        let table: Table = Rc::new(OnceCell::new());
        let mut programs = Vec::with_capacity(flat.len());
        for id in 0..flat.len() {
            let entry = flat
                .program(id)
                .ok_or_else(|| CompileError::UnresolvedProgram(id))?;
            let mut lowerer = Lowerer::new(&table, &flags);
            lowerer.run(&entry.opcodes)?;
            let statements = lowerer.finish_statements(id)?;

            let decorators = match flat.decorators(id) {
                Some(stream) => {
                    let mut lowerer = Lowerer::new(&table, &flags);
                    lowerer.run(stream)?;
                    lowerer.finish_decorators(id)?
                }
                None => Vec::new(),
            };

            programs.push(CgProgram {
                statements,
                decorators,
            });
        }
        let _ = table.set(programs);

        Ok(Self { table, flags })
    }
}

impl Renderer for CodeGenTemplate {
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
        run_cg(
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

/// A lowered block body captured as a callable.
struct CgBound {
    table: Table,
    id: usize,
    depths: DepthList,
    data: Option<Rc<DataFrame>>,
    block_params: BlockParams,
}

impl ProgramCall for CgBound {
    fn call(
        &self,
        rcx: &RenderContext,
        context: &Value,
        frame: FrameOverrides,
    ) -> Result<String, RenderError> {
        let data = frame.data.or_else(|| self.data.clone());
        run_cg(
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

/// The bare, undecorated statement list of a program: the innermost link of
/// the decorator wrapping chain.
struct CgBody {
    table: Table,
    id: usize,
    depths: DepthList,
    data: Option<Rc<DataFrame>>,
    block_params: BlockParams,
    frame: Option<BlockParamsFrame>,
}

impl ProgramCall for CgBody {
    fn call(
        &self,
        rcx: &RenderContext,
        context: &Value,
        overrides: FrameOverrides,
    ) -> Result<String, RenderError> {
        let program = lookup_program(&self.table, self.id)?;
        let data = overrides.data.or_else(|| self.data.clone());
        let frame = overrides.block_params.or_else(|| self.frame.clone());
        let scope = activation_scope(context, &self.depths, data, &self.block_params, frame);
        exec_statements(program, &scope, rcx)
    }
}

fn lookup_program(table: &Table, id: usize) -> Result<&CgProgram, RenderError> {
    table
        .get()
        .ok_or_else(|| RenderError::Internal("program table not populated".into()))?
        .get(id)
        .ok_or_else(|| RenderError::Internal(format!("no program {id} in table")))
}

fn activation_scope(
    context: &Value,
    parent_depths: &DepthList,
    data: Option<Rc<DataFrame>>,
    parent_block_params: &BlockParams,
    frame: Option<BlockParamsFrame>,
) -> Scope {
    let mut block_params = parent_block_params.clone();
    block_params.push_frame(frame.unwrap_or_default());
    Scope {
        context: context.clone(),
        depths: parent_depths.pushed(context),
        data,
        block_params,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_cg(
    table: &Table,
    id: usize,
    rcx: &RenderContext,
    context: &Value,
    parent_depths: &DepthList,
    data: Option<Rc<DataFrame>>,
    parent_block_params: &BlockParams,
    frame: Option<BlockParamsFrame>,
) -> Result<String, RenderError> {
    let program = lookup_program(table, id)?;

    if !program.decorators.is_empty() {
        // Registration thunks evaluate under the activation's own state.
        let scope = activation_scope(
            context,
            parent_depths,
            data.clone(),
            parent_block_params,
            frame.clone(),
        );

        // Each decorator sees the chain built so far and may replace it.
        let mut props = DecoratorProps::default();
        let mut current: Rc<dyn ProgramCall> = Rc::new(CgBody {
            table: Rc::clone(table),
            id,
            depths: parent_depths.clone(),
            data,
            block_params: parent_block_params.clone(),
            frame,
        });
        let ordered: Box<dyn Iterator<Item = &(String, DecoratorThunk)>> =
            if rcx.flags.alternate_decorators {
                Box::new(program.decorators.iter().rev())
            } else {
                Box::new(program.decorators.iter())
            };
        for (name, thunk) in ordered {
            let call = thunk(&scope, rcx)?;
            let decorator = rcx
                .decorators
                .get(name)
                .ok_or_else(|| RenderError::DecoratorMissing(name.clone()))?
                .clone();
            if let Some(wrapped) = decorator.call(&call, &current, &mut props, rcx)? {
                current = wrapped;
            }
        }

        rcx.push_inline_partials(props.partials);
        let result = current.call(rcx, context, FrameOverrides::default());
        rcx.pop_inline_partials();
        return result;
    }

    let scope = activation_scope(context, parent_depths, data, parent_block_params, frame);
    exec_statements(program, &scope, rcx)
}

fn exec_statements(
    program: &CgProgram,
    scope: &Scope,
    rcx: &RenderContext,
) -> Result<String, RenderError> {
    let mut out = String::new();
    for statement in &program.statements {
        match statement {
            CgStatement::Content(text) => out.push_str(text),
            CgStatement::Append(thunk) => {
                let value = thunk(scope, rcx)?;
                if !value.is_nullish() {
                    out.push_str(&value.render(rcx.flags.js_compat));
                }
            }
            CgStatement::AppendEscaped(thunk) => {
                let value = thunk(scope, rcx)?;
                out.push_str(&escape_expression(&value, &scope.context)?);
            }
        }
    }
    Ok(out)
}

fn cg_program_ref(table: &Table, id: Option<usize>, scope: &Scope) -> Option<Rc<dyn ProgramCall>> {
    id.map(|id| {
        Rc::new(CgBound {
            table: Rc::clone(table),
            id,
            depths: scope.depths.clone(),
            data: scope.data.clone(),
            block_params: scope.block_params.clone(),
        }) as Rc<dyn ProgramCall>
    })
}

/// Everything popped for one invocation, still as thunks.
struct CgCall {
    name: String,
    params: Vec<ValueThunk>,
    ids: Option<Vec<ValueThunk>>,
    types: Option<Vec<ValueThunk>>,
    contexts: Option<Vec<ValueThunk>>,
    hash: CgHash,
    program: Option<usize>,
    inverse: Option<usize>,
}

impl CgCall {
    /// Evaluate into the backend-neutral call record. The bool reports an
    /// omitted empty hash.
    fn build(
        &self,
        scope: &Scope,
        rcx: &RenderContext,
        table: &Table,
    ) -> Result<(HelperCall, bool), RenderError> {
        let eval_all = |thunks: &[ValueThunk]| -> Result<Vec<Value>, RenderError> {
            thunks.iter().map(|t| t(scope, rcx)).collect()
        };
        let eval_map = |pairs: &[(String, ValueThunk)]| -> Result<ValueMap, RenderError> {
            pairs
                .iter()
                .map(|(k, t)| Ok((k.clone(), t(scope, rcx)?)))
                .collect()
        };

        let call = HelperCall {
            name: self.name.clone(),
            context: scope.context.clone(),
            params: eval_all(&self.params)?,
            hash: eval_map(&self.hash.values)?,
            data: scope.data.clone(),
            program: cg_program_ref(table, self.program, scope),
            inverse: cg_program_ref(table, self.inverse, scope),
            ids: self.ids.as_deref().map(eval_all).transpose()?,
            hash_ids: self
                .ids
                .is_some()
                .then(|| eval_map(&self.hash.ids))
                .transpose()?,
            param_types: self.types.as_deref().map(eval_all).transpose()?,
            param_contexts: self.contexts.as_deref().map(eval_all).transpose()?,
            hash_types: self
                .types
                .is_some()
                .then(|| eval_map(&self.hash.types))
                .transpose()?,
            hash_contexts: self
                .contexts
                .is_some()
                .then(|| eval_map(&self.hash.contexts))
                .transpose()?,
        };
        Ok((call, self.hash.omitted))
    }
}

#[derive(Default)]
struct CgHash {
    values: Vec<(String, ValueThunk)>,
    ids: Vec<(String, ValueThunk)>,
    types: Vec<(String, ValueThunk)>,
    contexts: Vec<(String, ValueThunk)>,
    omitted: bool,
}

enum CgItem {
    Value(ValueThunk),
    Ambiguous(AmbiguousThunk),
    Program(Option<usize>),
    Hash(CgHash),
}

/// Lowers one opcode stream. The stack here exists only while lowering; at
/// render time nothing is pushed or popped.
struct Lowerer<'a> {
    table: &'a Table,
    flags: &'a CompiledFlags,
    stack: Vec<CgItem>,
    hash_stack: Vec<CgHash>,
    last_context: usize,
    statements: Vec<CgStatement>,
    decorators: Vec<(String, DecoratorThunk)>,
}

impl<'a> Lowerer<'a> {
    fn new(table: &'a Table, flags: &'a CompiledFlags) -> Self {
        Self {
            table,
            flags,
            stack: Vec::new(),
            hash_stack: Vec::new(),
            last_context: 0,
            statements: Vec::new(),
            decorators: Vec::new(),
        }
    }

    fn finish_statements(self, id: usize) -> Result<Vec<CgStatement>, CompileError> {
        if !self.stack.is_empty() {
            return Err(CompileError::StackImbalance(format!(
                "program {id} left {} items while lowering",
                self.stack.len()
            )));
        }
        Ok(self.statements)
    }

    fn finish_decorators(
        self,
        id: usize,
    ) -> Result<Vec<(String, DecoratorThunk)>, CompileError> {
        if !self.stack.is_empty() {
            return Err(CompileError::StackImbalance(format!(
                "decorators of program {id} left {} items while lowering",
                self.stack.len()
            )));
        }
        Ok(self.decorators)
    }

    fn run(&mut self, opcodes: &[Opcode]) -> Result<(), CompileError> {
        for op in opcodes {
            self.step(op)?;
        }
        Ok(())
    }

    fn step(&mut self, op: &Opcode) -> Result<(), CompileError> {
        match op {
            Opcode::AppendContent(text) => {
                // Coalesce adjacent content runs into one statement.
                if let Some(CgStatement::Content(existing)) = self.statements.last_mut() {
                    existing.push_str(text);
                } else {
                    self.statements.push(CgStatement::Content(text.clone()));
                }
            }
            Opcode::Append => {
                let thunk = self.pop_value()?;
                self.statements.push(CgStatement::Append(thunk));
            }
            Opcode::AppendEscaped => {
                let thunk = self.pop_value()?;
                self.statements.push(CgStatement::AppendEscaped(thunk));
            }
            Opcode::GetContext(depth) => {
                self.last_context = *depth;
            }
            Opcode::PushContext => {
                let depth = self.last_context;
                self.push_value(Rc::new(move |s, _| Ok(s.depths.at(depth))));
            }
            Opcode::LookupOnContext {
                parts,
                falsy,
                strict: _,
                scoped,
            } => {
                let parts = parts.clone();
                let falsy = *falsy;
                let compat_scan = !scoped && self.flags.compat && self.last_context == 0;
                let depth = self.last_context;
                self.push_value(Rc::new(move |s, _| {
                    let head = match parts.first() {
                        Some(h) => h,
                        None => return Ok(s.depths.at(depth)),
                    };
                    let (value, rest) = if compat_scan {
                        let value = s
                            .depths
                            .find_containing(head)
                            .and_then(|ctx| ctx.get(head))
                            .cloned()
                            .unwrap_or(Value::Missing);
                        (value, &parts[1..])
                    } else {
                        (s.depths.at(depth), &parts[..])
                    };
                    Ok(resolve_parts(value, rest, falsy))
                }));
            }
            Opcode::LookupData {
                depth,
                parts,
                strict: _,
            } => {
                let depth = *depth;
                let parts = parts.clone();
                self.push_value(Rc::new(move |s, _| {
                    let frame = s.data.as_ref().and_then(|d| DataFrame::at_depth(d, depth));
                    let value = match (&frame, parts.first()) {
                        (Some(frame), Some(head)) => frame.get(head),
                        _ => Value::Missing,
                    };
                    Ok(resolve_parts(
                        value,
                        parts.get(1..).unwrap_or(&[]),
                        true,
                    ))
                }));
            }
            Opcode::LookupBlockParam { param, parts } => {
                let param = *param;
                let parts = parts.clone();
                self.push_value(Rc::new(move |s, _| {
                    let value = s.block_params.value(param);
                    Ok(resolve_parts(
                        value,
                        parts.get(1..).unwrap_or(&[]),
                        false,
                    ))
                }));
            }
            Opcode::ResolvePossibleLambda => {
                let inner = self.pop_value()?;
                self.push_value(Rc::new(move |s, r| {
                    resolve_lambda(inner(s, r)?, &s.context)
                }));
            }
            Opcode::PushLiteral(literal) => {
                let value = literal_value(literal);
                self.push_value(Rc::new(move |_, _| Ok(value.clone())));
            }
            Opcode::PushProgram(id) => {
                self.stack.push(CgItem::Program(*id));
            }
            Opcode::PushHash => {
                self.hash_stack.push(CgHash::default());
            }
            Opcode::AssignToHash(key) => {
                let value = self.pop_value()?;
                let id = if self.flags.track_ids {
                    Some(self.pop_value()?)
                } else {
                    None
                };
                let (param_type, param_context) = if self.flags.string_params {
                    (Some(self.pop_value()?), Some(self.pop_value()?))
                } else {
                    (None, None)
                };

                let hash = self.hash_stack.last_mut().ok_or_else(|| {
                    CompileError::StackImbalance("hash assignment without builder".into())
                })?;
                hash.values.push((key.clone(), value));
                if let Some(id) = id {
                    hash.ids.push((key.clone(), id));
                }
                if let Some(t) = param_type {
                    hash.types.push((key.clone(), t));
                }
                if let Some(c) = param_context {
                    hash.contexts.push((key.clone(), c));
                }
            }
            Opcode::PopHash => {
                let hash = self.hash_stack.pop().ok_or_else(|| {
                    CompileError::StackImbalance("pop of missing hash builder".into())
                })?;
                self.stack.push(CgItem::Hash(hash));
            }
            Opcode::EmptyHash { omit_empty } => {
                self.stack.push(CgItem::Hash(CgHash {
                    omitted: *omit_empty,
                    ..CgHash::default()
                }));
            }
            Opcode::InvokeHelper {
                param_size,
                name,
                is_simple,
            } => {
                let fallback = self.pop_value()?;
                let call = self.setup_params(name, *param_size)?;
                let table = Rc::clone(self.table);
                let is_simple = *is_simple;
                self.push_value(Rc::new(move |s, r| {
                    let fallback = fallback(s, r)?;
                    let (call, _) = call.build(s, r, &table)?;
                    invoke_helper_chain(r, is_simple, fallback, call)
                }));
            }
            Opcode::InvokeKnownHelper { param_size, name } => {
                let call = self.setup_params(name, *param_size)?;
                let name = name.clone();
                let table = Rc::clone(self.table);
                self.push_value(Rc::new(move |s, r| {
                    let helper = r
                        .helpers
                        .get(&name)
                        .ok_or_else(|| RenderError::HelperMissing(name.clone()))?
                        .clone();
                    let (call, _) = call.build(s, r, &table)?;
                    helper.call(&call, r)
                }));
            }
            Opcode::InvokeAmbiguous { name, is_block: _ } => {
                let value = self.pop_value()?;
                // The preamble pushed only programs; the hash is synthetic.
                self.stack.push(CgItem::Hash(CgHash::default()));
                let call = self.setup_params(name, 0)?;
                let name = name.clone();
                let table = Rc::clone(self.table);
                self.stack.push(CgItem::Ambiguous(Rc::new(move |s, r| {
                    if let Some(helper) = r.helpers.get(&name).cloned() {
                        let (call, _) = call.build(s, r, &table)?;
                        return Ok((helper.call(&call, r)?, true));
                    }
                    let resolved = value(s, r)?;
                    let out = match resolved {
                        Value::Lambda(lambda) => lambda.call(&s.context, &[])?,
                        v if v.is_nullish() => {
                            let (call, _) = call.build(s, r, &table)?;
                            invoke_helper_chain(r, false, Value::Missing, call)?
                        }
                        v => v,
                    };
                    Ok((out, false))
                })));
            }
            Opcode::InvokePartial {
                is_dynamic,
                name,
                indent,
            } => {
                let static_name = name.clone().unwrap_or_default();
                let call = self.setup_params(&static_name, 1)?;
                let name_thunk = if *is_dynamic {
                    Some(self.pop_value()?)
                } else {
                    None
                };
                let indent = indent.clone();
                let table = Rc::clone(self.table);
                self.push_value(Rc::new(move |s, r| {
                    let (call, hash_omitted) = call.build(s, r, &table)?;
                    let name = match &name_thunk {
                        Some(thunk) => partial_name_from_value(&thunk(s, r)?)?,
                        None => static_name.clone(),
                    };
                    let hash = if hash_omitted { None } else { Some(&call.hash) };
                    let context = partial_context(&call.param(0), hash);
                    let rendered =
                        render_resolved_partial(r, &name, &context, &s.depths, s.data.clone())?;
                    let rendered = if indent.is_empty() {
                        rendered
                    } else {
                        indent_lines(&rendered, &indent)
                    };
                    Ok(Value::from(rendered))
                }));
            }
            Opcode::BlockValue(name) => {
                let call = self.setup_params(name, 0)?;
                let value = self.pop_value()?;
                let table = Rc::clone(self.table);
                self.push_value(Rc::new(move |s, r| {
                    let (mut call, _) = call.build(s, r, &table)?;
                    call.params = vec![value(s, r)?];
                    block_helper_missing_hook(r, call)
                }));
            }
            Opcode::AmbiguousBlockValue => {
                let call = self.setup_params("", 0)?;
                let ambiguous = self.pop_ambiguous()?;
                let table = Rc::clone(self.table);
                self.push_value(Rc::new(move |s, r| {
                    let (current, found_helper) = ambiguous(s, r)?;
                    if found_helper {
                        return Ok(current);
                    }
                    let (mut call, _) = call.build(s, r, &table)?;
                    call.params = vec![current];
                    block_helper_missing_hook(r, call)
                }));
            }
            Opcode::RegisterDecorator { param_size, name } => {
                let call = self.setup_params(name, *param_size)?;
                let decorator_name = name.clone();
                let table = Rc::clone(self.table);
                self.decorators.push((
                    name.clone(),
                    Rc::new(move |s, r| {
                        let (call, _) = call.build(s, r, &table)?;
                        Ok(DecoratorCall {
                            name: decorator_name.clone(),
                            context: call.context,
                            params: call.params,
                            hash: call.hash,
                            data: call.data,
                            program: call.program,
                        })
                    }),
                ));
            }
            Opcode::PushId(id) => match id {
                ParamId::Path(path) => {
                    let value = Value::from(path.clone());
                    self.push_value(Rc::new(move |_, _| Ok(value.clone())));
                }
                ParamId::Literal => {
                    self.push_value(Rc::new(|_, _| Ok(Value::Null)));
                }
                ParamId::SubExpression => {
                    self.push_value(Rc::new(|_, _| Ok(Value::Bool(true))));
                }
                ParamId::BlockParam { param, child } => {
                    let param = *param;
                    let child = child.clone();
                    self.push_value(Rc::new(move |s, _| {
                        let base = s.block_params.path(param).render(false);
                        Ok(if child.is_empty() {
                            Value::from(base)
                        } else {
                            Value::from(format!("{base}.{child}"))
                        })
                    }));
                }
            },
            Opcode::PushStringParam { string, param_type } => {
                let depth = self.last_context;
                self.push_value(Rc::new(move |s, _| Ok(s.depths.at(depth))));
                let type_value = Value::from(param_type.clone());
                self.push_value(Rc::new(move |_, _| Ok(type_value.clone())));
                if param_type != "SubExpression" {
                    let string_value = Value::from(string.clone());
                    self.push_value(Rc::new(move |_, _| Ok(string_value.clone())));
                }
            }
        }
        Ok(())
    }

    /// Pop a full invocation in reverse push order, mirroring the
    /// interpreter's protocol but at lowering time.
    fn setup_params(&mut self, name: &str, param_size: usize) -> Result<CgCall, CompileError> {
        let hash = self.pop_hash()?;
        let inverse = self.pop_program()?;
        let program = self.pop_program()?;

        let track_ids = self.flags.track_ids;
        let string_params = self.flags.string_params;

        let noop: ValueThunk = Rc::new(|_, _| Ok(Value::Missing));
        let mut params = vec![Rc::clone(&noop); param_size];
        let mut ids = vec![Rc::clone(&noop); if track_ids { param_size } else { 0 }];
        let mut types = vec![Rc::clone(&noop); if string_params { param_size } else { 0 }];
        let mut contexts = vec![Rc::clone(&noop); if string_params { param_size } else { 0 }];

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

        Ok(CgCall {
            name: name.to_string(),
            params,
            ids: track_ids.then_some(ids),
            types: string_params.then_some(types),
            contexts: string_params.then_some(contexts),
            hash,
            program,
            inverse,
        })
    }

    fn push_value(&mut self, thunk: ValueThunk) {
        self.stack.push(CgItem::Value(thunk));
    }

    fn pop_value(&mut self) -> Result<ValueThunk, CompileError> {
        match self.stack.pop() {
            Some(CgItem::Value(thunk)) => Ok(thunk),
            Some(CgItem::Ambiguous(thunk)) => {
                Ok(Rc::new(move |s, r| thunk(s, r).map(|(v, _)| v)))
            }
            Some(_) => Err(CompileError::StackImbalance(
                "expected value while lowering".into(),
            )),
            None => Err(CompileError::StackImbalance(
                "value stack underflow while lowering".into(),
            )),
        }
    }

    fn pop_ambiguous(&mut self) -> Result<AmbiguousThunk, CompileError> {
        match self.stack.pop() {
            Some(CgItem::Ambiguous(thunk)) => Ok(thunk),
            _ => Err(CompileError::StackImbalance(
                "expected ambiguous value while lowering".into(),
            )),
        }
    }

    fn pop_program(&mut self) -> Result<Option<usize>, CompileError> {
        match self.stack.pop() {
            Some(CgItem::Program(p)) => Ok(p),
            _ => Err(CompileError::StackImbalance(
                "expected program while lowering".into(),
            )),
        }
    }

    fn pop_hash(&mut self) -> Result<CgHash, CompileError> {
        match self.stack.pop() {
            Some(CgItem::Hash(h)) => Ok(h),
            _ => Err(CompileError::StackImbalance(
                "expected hash while lowering".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Node, SubExpr, Template};
    use crate::compiler::{compile, CompileOptions};
    use crate::runtime::helpers::register_builtins;
    use crate::runtime::{Registry, RenderOptions};

    fn render(template: Template, context: Value) -> String {
        let (program, flags) = compile(&template, &CompileOptions::default()).unwrap();
        let flags = Rc::new(flags);
        let generated = CodeGenTemplate::new(&program, Rc::clone(&flags)).unwrap();

        let mut helpers = Registry::new();
        let mut decorators = Registry::new();
        register_builtins(&mut helpers, &mut decorators);
        let options = RenderOptions::default();
        let rcx = RenderContext::new(
            helpers.layered(options.helpers),
            Registry::new().layered(options.partials),
            decorators.layered(options.decorators),
            flags,
        );
        generated.render(&rcx, &context, None).unwrap()
    }

    fn object(pairs: &[(&str, Value)]) -> Value {
        let mut map = ValueMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        Value::object(map)
    }

    #[test]
    fn test_content_coalesces_into_one_statement() {
        let (program, flags) = compile(
            &Template::new(vec![Node::content("a"), Node::content("b")]),
            &CompileOptions::default(),
        )
        .unwrap();
        let generated = CodeGenTemplate::new(&program, Rc::new(flags)).unwrap();
        let programs = generated.table.get().unwrap();
        assert_eq!(programs[0].statements.len(), 1);
        assert!(matches!(
            &programs[0].statements[0],
            CgStatement::Content(text) if text == "ab"
        ));
    }

    #[test]
    fn test_escaped_interpolation() {
        let template = Template::new(vec![Node::mustache(SubExpr::new(Expr::path(&["name"])))]);
        let context = object(&[("name", Value::from("A&B"))]);
        assert_eq!(render(template, context), "A&amp;B");
    }

    #[test]
    fn test_each_block_renders_items() {
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
    fn test_sibling_program_reference_resolves() {
        // The inverse program lowers after the body it is referenced from.
        let template = Template::new(vec![Node::block(
            SubExpr::helper("if", vec![Expr::path(&["ok"])]),
            Some(Template::new(vec![Node::content("yes")])),
            Some(Template::new(vec![Node::content("no")])),
        )]);
        assert_eq!(
            render(template, object(&[("ok", Value::Bool(false))])),
            "no"
        );
    }

    #[test]
    fn test_decorators_chain_around_the_body() {
        use crate::runtime::Decorator;

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

        fn tagging(tag: &'static str) -> Decorator {
            Decorator::from_fn(move |_, decorated, _, _| {
                Ok(Some(Rc::new(Tagged {
                    tag,
                    inner: Rc::clone(decorated),
                }) as Rc<dyn ProgramCall>))
            })
        }

        let template = Template::new(vec![
            Node::decorator_block(SubExpr::helper("first", vec![]), Template::new(vec![])),
            Node::decorator_block(SubExpr::helper("second", vec![]), Template::new(vec![])),
            Node::content("body"),
        ]);
        let (program, flags) = compile(&template, &CompileOptions::default()).unwrap();
        let flags = Rc::new(flags);
        let generated = CodeGenTemplate::new(&program, Rc::clone(&flags)).unwrap();

        let mut helpers = Registry::new();
        let mut decorators = Registry::new();
        register_builtins(&mut helpers, &mut decorators);
        decorators.register("first", tagging("first"));
        decorators.register("second", tagging("second"));
        let rcx = RenderContext::new(helpers, Registry::new(), decorators, flags);

        assert_eq!(
            generated.render(&rcx, &object(&[]), None).unwrap(),
            "second(first(body))"
        );
    }

    #[test]
    fn test_inline_decorator_partial() {
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
}
