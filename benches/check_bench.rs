use criterion::{criterion_group, criterion_main, Criterion};

use dataframe_schema_checker::analyze_source;
use dataframe_schema_checker::checker::CheckerOptions;
use dataframe_schema_checker::syntax::parse_source;

const SOURCE: &str = include_str!("../testData/diagnostics/group_by.kt");

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_source", |b| {
        b.iter(|| parse_source(SOURCE).expect("parse failed"));
    });
}

fn bench_analyze(c: &mut Criterion) {
    let options = CheckerOptions::default();
    c.bench_function("analyze_source", |b| {
        b.iter(|| analyze_source(SOURCE, &options).expect("analysis failed"));
    });
}

criterion_group!(benches, bench_parse, bench_analyze);
criterion_main!(benches);
