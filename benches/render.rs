// benches/render.rs
//! Rendering benchmarks comparing the two backends
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stencil_engine::ast::{Expr, Node, SubExpr, Template};
use stencil_engine::compiler::CompileOptions;
use stencil_engine::runtime::{RenderOptions, Value, ValueMap};
use stencil_engine::{Backend, Engine};

fn page_template() -> Template {
    let row = Template::new(vec![
        Node::content("<li>"),
        Node::mustache(SubExpr::new(Expr::data_path(&["index"]))),
        Node::content(": "),
        Node::mustache(SubExpr::new(Expr::path(&["name"]))),
        Node::content("</li>"),
    ]);
    Template::new(vec![
        Node::content("<h1>"),
        Node::mustache(SubExpr::new(Expr::path(&["title"]))),
        Node::content("</h1><ul>"),
        Node::block(
            SubExpr::helper("each", vec![Expr::path(&["items"])]),
            Some(row),
            None,
        ),
        Node::content("</ul>"),
    ])
}

fn page_context(items: usize) -> Value {
    let rows: Vec<Value> = (0..items)
        .map(|i| {
            let mut row = ValueMap::new();
            row.insert("name".to_string(), Value::from(format!("item {i}")));
            Value::Object(row)
        })
        .collect();
    let mut map = ValueMap::new();
    map.insert("title".to_string(), Value::from("Inventory <&>"));
    map.insert("items".to_string(), Value::Array(rows));
    Value::Object(map)
}

fn benchmark_backends(c: &mut Criterion) {
    let template = page_template();
    let mut group = c.benchmark_group("render_page");

    for (label, backend) in [("codegen", Backend::CodeGen), ("vm", Backend::Vm)] {
        let engine = Engine::new(backend);
        let compiled = engine
            .compile(&template, &CompileOptions::default())
            .unwrap();

        for items in [10usize, 100, 1000] {
            let context = page_context(items);
            group.bench_with_input(
                BenchmarkId::new(label, items),
                &context,
                |b, context| {
                    b.iter(|| {
                        engine
                            .render(&compiled, black_box(context), &RenderOptions::default())
                            .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn benchmark_compile(c: &mut Criterion) {
    let template = page_template();
    let engine = Engine::new(Backend::CodeGen);

    c.bench_function("compile_page", |b| {
        b.iter(|| {
            engine
                .compile(black_box(&template), &CompileOptions::default())
                .unwrap()
        })
    });
}

criterion_group!(benches, benchmark_backends, benchmark_compile);
criterion_main!(benches);
