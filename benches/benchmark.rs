use criterion::{black_box, criterion_group, criterion_main, Criterion};
use render_tiers::remote_client::backoff_delay;
use render_tiers::{
    format_bytes, format_duration, overall_score, recommend_tier, scan_assets, BackendCapability, BackendId,
    MarkupBackend, ScoreWeights, TierThresholds,
};
use std::collections::BTreeMap;
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn sample_markup() -> String {
    let mut markup = String::from(
        r#"<html><head><link rel="stylesheet" href="https://cdn.example.com/site.css">
<script src="//cdn.example.com/app.js"></script></head><body>"#,
    );
    for i in 0..200 {
        markup.push_str(&format!(
            r#"<section id="s{i}"><h2 onclick="track({i})">Section {i}</h2>
<p>Paragraph with <a href="https://example.com/{i}">a link</a> and <img src="https://img.example.com/{i}.png"></p>
<script>window.counter = {i};</script></section>"#
        ));
    }
    markup.push_str("</body></html>");
    markup
}

fn scores() -> BTreeMap<BackendId, BackendCapability> {
    [(BackendId::Engine, false, 0.0), (BackendId::Canvas, true, 0.6), (BackendId::Remote, true, 0.4), (BackendId::Markup, true, 1.0)]
        .into_iter()
        .map(|(backend, available, performance)| {
            (
                backend,
                BackendCapability {
                    backend,
                    available,
                    performance,
                    details: Default::default(),
                },
            )
        })
        .collect()
}

fn benchmark_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    configure_fast_group(&mut group);

    let base = Duration::from_millis(100);
    let cap = Duration::from_secs(10);
    group.bench_function("delay_sequence", |b| {
        b.iter(|| {
            for attempt in 0..16u32 {
                black_box(backoff_delay(black_box(attempt), base, cap));
            }
        });
    });

    group.finish();
}

fn benchmark_assessment_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("assessment");
    configure_fast_group(&mut group);

    let scores = scores();
    let weights = ScoreWeights::default();
    let thresholds = TierThresholds::default();

    group.bench_function("overall_score", |b| {
        b.iter(|| black_box(overall_score(black_box(&scores), &weights)));
    });
    group.bench_function("recommend_tier", |b| {
        b.iter(|| black_box(recommend_tier(black_box(&scores), &thresholds)));
    });

    group.finish();
}

fn benchmark_sanitization(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitization");
    configure_fast_group(&mut group);

    let backend = MarkupBackend::default();
    let markup = sample_markup();

    group.bench_function("sanitize_document", |b| {
        b.iter(|| black_box(backend.sanitize(black_box(&markup))));
    });

    group.finish();
}

fn benchmark_asset_scanning(c: &mut Criterion) {
    let mut group = c.benchmark_group("assets");
    configure_fast_group(&mut group);

    let markup = sample_markup();

    group.bench_function("scan_document", |b| {
        b.iter(|| black_box(scan_assets(black_box(&markup))));
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    group.bench_function("format_duration", |b| {
        b.iter(|| black_box(format_duration(black_box(Duration::from_millis(12_345)))));
    });
    group.bench_function("format_bytes", |b| {
        b.iter(|| black_box(format_bytes(black_box(25 * 1024 * 1024))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_backoff,
    benchmark_assessment_scoring,
    benchmark_sanitization,
    benchmark_asset_scanning,
    benchmark_format_utilities
);
criterion_main!(benches);
