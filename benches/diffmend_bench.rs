use criterion::{black_box, criterion_group, criterion_main, Criterion};
use diffmend::{parse_diffs, reconcile_diffs, similarity, FileContents, ReconcileOptions};
use indoc::indoc;
use std::time::Duration;

const PARSE_BUDGET: Duration = Duration::from_secs(3);

// --- Parsing Benchmarks ---

fn parsing_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsing");

    // Simple, single-hunk diff
    let simple_diff = indoc! {r#"
        A markdown file with some text.
        ```diff
        --- src/main.rs
        +++ src/main.rs
        @@ -1,3 +1,3 @@
         fn main() {
        -    println!("Hello, world!");
        +    println!("Hello, diffmend!");
         }
        ```
    "#};
    group.bench_function("simple_diff", |b| {
        b.iter(|| parse_diffs(black_box(simple_diff), PARSE_BUDGET).unwrap())
    });

    // Diff with many hunks for a single file
    let mut large_diff_content = "```diff\n--- large_file.txt\n+++ large_file.txt\n".to_string();
    for i in 0..100 {
        large_diff_content.push_str(&format!(
            "@@ -{},3 +{},3 @@\n context line {}\n-old line {}\n+new line {}\n",
            i * 5 + 1,
            i * 5 + 1,
            i,
            i,
            i
        ));
    }
    large_diff_content.push_str("```");
    group.bench_function("large_diff_100_hunks", |b| {
        b.iter(|| parse_diffs(black_box(&large_diff_content), PARSE_BUDGET).unwrap())
    });

    // Large markdown file with one diff block at the end to test scanning speed
    let mut large_markdown = "Lorem ipsum dolor sit amet...\n".repeat(1000);
    large_markdown.push_str(simple_diff);
    group.bench_function("large_markdown_scan", |b| {
        b.iter(|| parse_diffs(black_box(&large_markdown), PARSE_BUDGET).unwrap())
    });

    group.finish();
}

// --- Similarity Benchmarks ---

fn similarity_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("Similarity");

    group.bench_function("short_lines", |b| {
        b.iter(|| {
            similarity(
                black_box("    let total = items.len();"),
                black_box("    let total = item.len();"),
            )
        })
    });

    let long_a =
        "let aggregate = records.iter().filter(|r| r.active).map(|r| r.weight).sum::<f64>(); "
            .repeat(4);
    let long_b = long_a.replace("weight", "height");
    group.bench_function("long_lines", |b| {
        b.iter(|| similarity(black_box(&long_a), black_box(&long_b)))
    });

    group.finish();
}

// --- Reconciliation Benchmarks ---

fn reconcile_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reconcile");
    let options = ReconcileOptions::default();

    // --- Benchmark 1: Anchor relocation across a large file ---
    // The hunk claims line 1 but its content lives at line 5001, forcing a
    // full-file anchor scan.
    let mut lines: Vec<String> = (0..10_000).map(|i| format!("// filler comment {i}")).collect();
    lines[5000] = "fn unique_anchor_point() {".to_string();
    lines[5001] = "    original_body();".to_string();
    let mut big_files = FileContents::new();
    big_files.insert("big.rs".into(), lines.join("\n"));
    let drifted = parse_diffs(
        indoc! {r#"
            ```diff
            --- big.rs
            +++ big.rs
            @@ -1,2 +1,2 @@
             fn unique_anchor_point() {
            -    original_body();
            +    replacement_body();
            ```
        "#},
        PARSE_BUDGET,
    )
    .unwrap();

    group.bench_function("reanchor_large_file", |b| {
        b.iter(|| reconcile_diffs(black_box(drifted.clone()), &big_files, &options))
    });

    // --- Benchmark 2: Splicing skipped context back in ---
    // The hunk jumps over five real lines between its anchor and its edit;
    // validation has to restore each one.
    let mut steps: Vec<String> = (0..1000).map(|i| format!("// routine filler {i}")).collect();
    steps[100] = "let session = open_session(config);".to_string();
    steps[106] = "session.commit_all();".to_string();
    let mut step_files = FileContents::new();
    step_files.insert("session.rs".into(), steps.join("\n"));
    let gappy = parse_diffs(
        indoc! {r#"
            ```diff
            --- session.rs
            +++ session.rs
            @@ -101,2 +101,2 @@
             let session = open_session(config);
            -session.commit_all();
            +session.commit_batch();
            ```
        "#},
        PARSE_BUDGET,
    )
    .unwrap();

    group.bench_function("splice_skipped_lines", |b| {
        b.iter(|| reconcile_diffs(black_box(gappy.clone()), &step_files, &options))
    });

    // --- Benchmark 3: New file creation ---
    let empty = FileContents::new();
    let creation = parse_diffs(
        indoc! {r#"
            ```diff
            --- /dev/null
            +++ notes.txt
            @@ -0,0 +1,2 @@
            +Hello
            +New World
            ```
        "#},
        PARSE_BUDGET,
    )
    .unwrap();

    group.bench_function("new_file_creation", |b| {
        b.iter(|| reconcile_diffs(black_box(creation.clone()), &empty, &options))
    });

    group.finish();
}

criterion_group!(benches, parsing_benches, similarity_benches, reconcile_benches);
criterion_main!(benches);
