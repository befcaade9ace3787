// src/runtime/context.rs
//! Per-activation context state: data frames, depth lists, block params
//!
//! All three are owned by the activation that created them and inherited by
//! nested program calls unless the caller supplies replacements, so a
//! compiled template carries no mutable render state of its own.

use crate::runtime::value::{Value, ValueMap};
use std::rc::Rc;

/// The `@`-prefixed side-channel data visible during iteration.
///
/// A child frame copies its parent's keys (so `@root` stays reachable from
/// any depth) and keeps the parent link for `@../`-style lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    values: ValueMap,
    parent: Option<Rc<DataFrame>>,
}

impl DataFrame {
    /// Root frame for a render call. `seed` is the caller-provided data
    /// object; `root` is added when the seed does not define it.
    pub fn root(seed: Option<&Value>, context: &Value) -> Rc<DataFrame> {
        let mut values = match seed {
            Some(Value::Object(map)) => map.clone(),
            _ => ValueMap::new(),
        };
        values
            .entry("root".to_string())
            .or_insert_with(|| context.clone());
        Rc::new(DataFrame {
            values,
            parent: None,
        })
    }

    /// Child frame inheriting the parent's keys.
    pub fn frame(parent: &Rc<DataFrame>) -> DataFrame {
        DataFrame {
            values: parent.values.clone(),
            parent: Some(Rc::clone(parent)),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Value {
        self.values.get(key).cloned().unwrap_or(Value::Missing)
    }

    /// Walk `depth` parent links out; `None` past the chain's end.
    pub fn at_depth(this: &Rc<DataFrame>, depth: usize) -> Option<Rc<DataFrame>> {
        let mut frame = Rc::clone(this);
        for _ in 0..depth {
            frame = Rc::clone(frame.parent.as_ref()?);
        }
        Some(frame)
    }

    /// The dotted context path maintained in trackIds mode.
    pub fn context_path(&self) -> Option<String> {
        self.values
            .get("contextPath")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// `a.b` appended to an optional base path.
pub fn append_context_path(base: Option<&str>, id: &str) -> String {
    match base {
        Some(base) if !base.is_empty() => format!("{}.{}", base, id),
        _ => id.to_string(),
    }
}

/// Ancestor-context stack, index 0 innermost. Lookups past the available
/// ancestors yield null, never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthList {
    contexts: Vec<Value>,
}

impl DepthList {
    pub fn seeded(context: &Value) -> Self {
        DepthList {
            contexts: vec![context.clone()],
        }
    }

    /// Activation push with dedup: re-entering the same context does not grow
    /// the list.
    pub fn pushed(&self, context: &Value) -> DepthList {
        if self.contexts.first() == Some(context) {
            return self.clone();
        }
        let mut contexts = Vec::with_capacity(self.contexts.len() + 1);
        contexts.push(context.clone());
        contexts.extend(self.contexts.iter().cloned());
        DepthList { contexts }
    }

    pub fn at(&self, depth: usize) -> Value {
        self.contexts.get(depth).cloned().unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Outward scan for the first ancestor defining `key` (compat-mode
    /// depthed lookup).
    pub fn find_containing(&self, key: &str) -> Option<&Value> {
        self.contexts.iter().find(|ctx| ctx.get(key).is_some())
    }
}

/// One `as |a b|` binding frame: parallel value and path slots. Paths are
/// only populated in trackIds mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockParamsFrame {
    pub values: Vec<Value>,
    pub paths: Vec<Value>,
}

impl BlockParamsFrame {
    pub fn new(values: Vec<Value>, paths: Vec<Value>) -> Self {
        Self { values, paths }
    }
}

/// Stack of block-param frames; one frame is pushed per program activation so
/// compile-time `[frame, slot]` indices line up with program nesting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockParams {
    frames: Vec<BlockParamsFrame>,
}

impl BlockParams {
    pub fn push_frame(&mut self, frame: BlockParamsFrame) {
        self.frames.push(frame);
    }

    fn frame(&self, depth: usize) -> Option<&BlockParamsFrame> {
        let idx = self.frames.len().checked_sub(depth + 1)?;
        self.frames.get(idx)
    }

    pub fn value(&self, param: [usize; 2]) -> Value {
        self.frame(param[0])
            .and_then(|f| f.values.get(param[1]).cloned())
            .unwrap_or(Value::Missing)
    }

    pub fn path(&self, param: [usize; 2]) -> Value {
        self.frame(param[0])
            .and_then(|f| f.paths.get(param[1]).cloned())
            .unwrap_or(Value::Null)
    }
}
