// tests/property_tests.rs
//! Property tests over generated template trees: compilation is
//! deterministic, never leaves the abstract opcode stack unbalanced, and the
//! two backends agree on every input.

use proptest::prelude::*;

use stencil_engine::ast::{Expr, Node, SubExpr, Template};
use stencil_engine::compiler::{self, CompileOptions};
use stencil_engine::runtime::{RenderOptions, Value, ValueMap};
use stencil_engine::{Backend, Engine};

// Identifiers end in 'q' so they can never collide with a built-in helper
// name and turn an ambiguous mustache into a zero-argument helper call.
fn ident() -> impl Strategy<Value = String> {
    "[a-z]{1,4}q"
}

fn leaf() -> impl Strategy<Value = Node> {
    prop_oneof![
        "[ -~]{0,12}".prop_map(Node::content),
        ident().prop_map(|name| Node::mustache(SubExpr::new(Expr::path(&[name.as_str()])))),
        ident().prop_map(|name| Node::unescaped(SubExpr::new(Expr::path(&[name.as_str()])))),
    ]
}

fn node() -> impl Strategy<Value = Node> {
    leaf().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            (ident(), prop::collection::vec(inner.clone(), 0..4)).prop_map(|(name, body)| {
                Node::block(
                    SubExpr::helper("if", vec![Expr::path(&[name.as_str()])]),
                    Some(Template::new(body)),
                    None,
                )
            }),
            (ident(), prop::collection::vec(inner, 0..4)).prop_map(|(name, body)| {
                Node::block(
                    SubExpr::helper("each", vec![Expr::path(&[name.as_str()])]),
                    Some(Template::new(body)),
                    None,
                )
            }),
        ]
    })
}

fn template() -> impl Strategy<Value = Template> {
    prop::collection::vec(node(), 0..6).prop_map(Template::new)
}

fn context() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(ident(), "[a-zA-Z0-9]{0,8}", 0..5).prop_map(|map| {
        let mut out = ValueMap::new();
        for (k, v) in map {
            out.insert(k, Value::from(v));
        }
        Value::Object(out)
    })
}

proptest! {
    #[test]
    fn compilation_is_deterministic(template in template()) {
        let options = CompileOptions::default();
        let first = compiler::compile(&template, &options).unwrap();
        let second = compiler::compile(&template, &options).unwrap();
        prop_assert_eq!(first.0, second.0);
        prop_assert_eq!(first.1, second.1);
    }

    #[test]
    fn backends_accept_and_agree(template in template(), context in context()) {
        let outputs: Vec<String> = [Backend::CodeGen, Backend::Vm]
            .into_iter()
            .map(|backend| {
                let engine = Engine::new(backend);
                // construction runs the stack-balance validation
                let compiled = engine
                    .compile(&template, &CompileOptions::default())
                    .unwrap();
                engine
                    .render(&compiled, &context, &RenderOptions::default())
                    .unwrap()
            })
            .collect();
        prop_assert_eq!(&outputs[0], &outputs[1]);
    }

    #[test]
    fn artifact_round_trip_preserves_output(template in template(), context in context()) {
        let engine = Engine::new(Backend::Vm);
        let compiled = engine
            .compile(&template, &CompileOptions::default())
            .unwrap();
        let direct = engine
            .render(&compiled, &context, &RenderOptions::default())
            .unwrap();

        let reloaded = engine
            .template_from_bytes(&compiled.to_bytes().unwrap())
            .unwrap();
        let replayed = engine
            .render(&reloaded, &context, &RenderOptions::default())
            .unwrap();
        prop_assert_eq!(direct, replayed);
    }
}
