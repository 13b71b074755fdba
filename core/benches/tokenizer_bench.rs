use criterion::{criterion_group, criterion_main, Criterion};
use search_core::query::ParsedQuery;
use search_core::config::QueryConfig;
use search_core::tokenizer::tokenize;

const DESCRIPTION: &str = "Over-ear wireless Bluetooth headphones with active noise \
cancelling, 30-hour battery life and a foldable design. Café-quality sound for \
commuters, students and travellers; includes a USB-C charging cable, 3.5mm \
audio lead and a hard-shell carrying case. Compatible with iOS, Android and Wi-Fi \
enabled smart speakers.";

fn bench_tokenize(c: &mut Criterion) {
    let text = DESCRIPTION.repeat(20);
    c.bench_function("tokenize_description", |b| b.iter(|| tokenize(&text)));
}

fn bench_parse(c: &mut Criterion) {
    let config = QueryConfig::default();
    c.bench_function("parse_query", |b| {
        b.iter(|| ParsedQuery::parse("\"noise cancelling\" wireless headphon* -wired", &config))
    });
}

criterion_group!(benches, bench_tokenize, bench_parse);
criterion_main!(benches);
