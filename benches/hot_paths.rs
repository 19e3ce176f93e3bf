use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flagwatch::ingest::validate::validate_report;
use flagwatch::model::{BucketCounts, MetricsBucket, ToggleCounts, UsageReport, YesNoCount};
use flagwatch::sdk::find_outdated_sdks;
use flagwatch::window::TimeWindow;

fn build_report(features: usize) -> UsageReport {
    let now = Utc::now();
    let toggles = (0..features)
        .map(|i| {
            let counts = if i % 4 == 0 {
                ToggleCounts {
                    yes: None,
                    no: None,
                    variants: Some(HashMap::from([
                        ("blue".to_string(), 40),
                        ("green".to_string(), 12),
                        ("disabled".to_string(), 3),
                    ])),
                }
            } else {
                ToggleCounts {
                    yes: Some(100 + i as u64),
                    no: Some(i as u64),
                    variants: None,
                }
            };
            (format!("feature-{i}"), counts)
        })
        .collect();

    UsageReport {
        app_name: "bench-app".into(),
        instance_id: Some("bench-pod".into()),
        environment: Some("production".into()),
        sdk_version: Some("unleash-node-sdk:6.7.0".into()),
        bucket: MetricsBucket {
            start: now - chrono::Duration::seconds(60),
            stop: now,
            toggles,
        },
    }
}

fn build_window(buckets: usize, features: usize) -> TimeWindow {
    let window = TimeWindow::new("hour", Duration::from_secs(3600), Duration::from_secs(10));
    let now = Utc::now();
    for b in 0..buckets {
        let counts: BucketCounts = (0..features)
            .map(|f| (format!("feature-{f}"), YesNoCount::new(b as u64, 1)))
            .collect();
        window.add(counts, now).expect("add bucket");
    }
    window
}

fn bench_validate(c: &mut Criterion) {
    let report = build_report(64);

    c.bench_function("validate/report_64_features", |b| {
        b.iter(|| validate_report(black_box(&report)).expect("valid report"))
    });
}

fn bench_window(c: &mut Criterion) {
    let window = build_window(256, 512);

    c.bench_function("window/snapshot_512_features", |b| {
        b.iter(|| black_box(window.snapshot().len()))
    });

    let folded = validate_report(&build_report(64))
        .expect("valid report")
        .counts;
    c.bench_function("window/add_and_sweep", |b| {
        let window = TimeWindow::new("minute", Duration::from_secs(60), Duration::from_secs(10));
        let stop = Utc::now() - chrono::Duration::seconds(120);
        b.iter(|| {
            // Stale stop times are evicted by the very next sweep.
            window.add(black_box(folded.clone()), stop).expect("add bucket");
            black_box(window.sweep())
        })
    });
}

fn bench_sdk(c: &mut Criterion) {
    let versions: Vec<String> = (0..64)
        .map(|i| format!("unleash-node-sdk:6.{}.0", i % 10))
        .collect();

    c.bench_function("sdk/find_outdated_64", |b| {
        b.iter(|| black_box(find_outdated_sdks(black_box(&versions)).len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_validate(c);
    bench_window(c);
    bench_sdk(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
