// src/compiler/flatten.rs
//! Program-flattening preprocessor.
//!
//! The compiler produces a tree of `Program`s whose `PushProgram` operands are
//! guids from a compile-wide counter. Execution wants flat indices: this pass
//! walks the tree in pre-order, assigns each program a table id (root is 0),
//! rewrites every `PushProgram` guid to the flat id of the referenced child,
//! and splits decorator streams into their own table entries. The output is
//! what both backends consume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compiler::opcode::{Opcode, Program};
use crate::CompileError;

/// Addresses one opcode stream in the flat table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableKey {
    /// Main body of the program with this flat id.
    Program(usize),
    /// Decorator registrations of the program with this flat id.
    Decorators(usize),
}

/// One flattened program: its rewritten opcodes plus the metadata execution
/// needs per activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlatProgram {
    pub opcodes: Vec<Opcode>,
    pub is_simple: bool,
    pub block_param_count: usize,
    pub use_decorators: bool,
}

/// Flat view of a compiled template. Entry 0 is the root program; nested
/// programs follow in pre-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlatTable {
    programs: Vec<FlatProgram>,
    decorators: BTreeMap<usize, Vec<Opcode>>,
}

impl FlatTable {
    pub fn build(root: &Program) -> Result<Self, CompileError> {
        let mut table = FlatTable::default();
        flatten_into(root, &mut table)?;
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn program(&self, id: usize) -> Option<&FlatProgram> {
        self.programs.get(id)
    }

    /// Decorator stream for a program, absent when it declares none.
    pub fn decorators(&self, id: usize) -> Option<&[Opcode]> {
        self.decorators.get(&id).map(Vec::as_slice)
    }

    pub fn get(&self, key: &TableKey) -> Option<&[Opcode]> {
        match key {
            TableKey::Program(id) => self.programs.get(*id).map(|p| p.opcodes.as_slice()),
            TableKey::Decorators(id) => self.decorators(*id),
        }
    }
}

fn flatten_into(program: &Program, table: &mut FlatTable) -> Result<usize, CompileError> {
    let id = table.programs.len();
    table.programs.push(FlatProgram::default());

    let mut child_ids = Vec::with_capacity(program.children.len());
    for child in &program.children {
        child_ids.push(flatten_into(child, table)?);
    }

    let rewrite = |opcodes: &[Opcode]| -> Result<Vec<Opcode>, CompileError> {
        opcodes
            .iter()
            .map(|op| match op {
                Opcode::PushProgram(Some(guid)) => {
                    let index = program
                        .child_index(*guid)
                        .ok_or(CompileError::UnresolvedProgram(*guid))?;
                    Ok(Opcode::PushProgram(Some(child_ids[index])))
                }
                other => Ok(other.clone()),
            })
            .collect()
    };

    table.programs[id] = FlatProgram {
        opcodes: rewrite(&program.opcodes)?,
        is_simple: program.is_simple,
        block_param_count: program.block_param_count,
        use_decorators: !program.decorator_opcodes.is_empty(),
    };
    if !program.decorator_opcodes.is_empty() {
        let stream = rewrite(&program.decorator_opcodes)?;
        table.decorators.insert(id, stream);
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Node, SubExpr, Template};
    use crate::compiler::{compile, CompileOptions};

    fn flat(template: Template) -> FlatTable {
        let (program, _) = compile(&template, &CompileOptions::default()).unwrap();
        FlatTable::build(&program).unwrap()
    }

    #[test]
    fn root_is_entry_zero() {
        let table = flat(Template::new(vec![Node::content("hi")]));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.program(0).unwrap().opcodes,
            vec![Opcode::AppendContent("hi".into())]
        );
    }

    #[test]
    fn children_flatten_in_preorder() {
        let leaf = Template::new(vec![Node::content("leaf")]);
        let mid = Template::new(vec![Node::block(
            SubExpr::helper("if", vec![Expr::path(&["inner"])]),
            Some(leaf),
            None,
        )]);
        let sibling = Template::new(vec![Node::content("sibling")]);
        let table = flat(Template::new(vec![
            Node::block(
                SubExpr::helper("if", vec![Expr::path(&["outer"])]),
                Some(mid),
                Some(sibling),
            ),
        ]));

        // root, mid, leaf, sibling
        assert_eq!(table.len(), 4);
        assert_eq!(
            table.program(2).unwrap().opcodes,
            vec![Opcode::AppendContent("leaf".into())]
        );
        assert_eq!(
            table.program(3).unwrap().opcodes,
            vec![Opcode::AppendContent("sibling".into())]
        );
    }

    #[test]
    fn push_program_guids_become_flat_ids() {
        let leaf = Template::new(vec![Node::content("leaf")]);
        let mid = Template::new(vec![Node::block(
            SubExpr::helper("if", vec![Expr::path(&["inner"])]),
            Some(leaf),
            None,
        )]);
        let table = flat(Template::new(vec![Node::block(
            SubExpr::helper("if", vec![Expr::path(&["outer"])]),
            Some(mid),
            None,
        )]));

        let root_refs: Vec<_> = table
            .program(0)
            .unwrap()
            .opcodes
            .iter()
            .filter_map(|op| match op {
                Opcode::PushProgram(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(root_refs, vec![Some(1), None]);

        let mid_refs: Vec<_> = table
            .program(1)
            .unwrap()
            .opcodes
            .iter()
            .filter_map(|op| match op {
                Opcode::PushProgram(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(mid_refs, vec![Some(2), None]);
    }

    #[test]
    fn decorator_streams_get_their_own_entry() {
        let body = Template::new(vec![Node::content("p")]);
        let table = flat(Template::new(vec![
            Node::decorator_block(
                SubExpr::helper("inline", vec![Expr::String("x".into())]),
                body,
            ),
            Node::content("main"),
        ]));

        assert!(table.program(0).unwrap().use_decorators);
        let stream = table.decorators(0).expect("decorator entry");
        assert!(stream.iter().any(|op| matches!(
            op,
            Opcode::RegisterDecorator { name, .. } if name == "inline"
        )));
        // The decorator's program reference resolves to the flattened child.
        assert!(stream.contains(&Opcode::PushProgram(Some(1))));
        assert_eq!(table.get(&TableKey::Decorators(0)), table.decorators(0));
        assert!(table.decorators(1).is_none());
    }

    #[test]
    fn unknown_guid_is_rejected() {
        let mut program = Program::default();
        program.opcodes.push(Opcode::PushProgram(Some(42)));
        match FlatTable::build(&program) {
            Err(CompileError::UnresolvedProgram(guid)) => assert_eq!(guid, 42),
            other => panic!("expected UnresolvedProgram, got {other:?}"),
        }
    }
}
