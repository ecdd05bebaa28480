//! Reconstruction cost for large run buffers
//!
//! A long `with_replies` session accumulates a few thousand posts before the
//! run stops; finalization must stay well below one tick period.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use timeline_harvester::crawling::{reconstruct_status_page, ThreadReconstructor};
use timeline_harvester::domain::ObservedPost;

const COMMENTERS: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];

/// Root every 50 posts, owner reply after every third comment
fn timeline_buffer(len: usize) -> Vec<ObservedPost> {
    (0..len)
        .map(|i| {
            let ts = format!("2024-01-01T{:02}:{:02}:{:02}Z", (i / 3600) % 24, (i / 60) % 60, i % 60);
            if i % 50 == 0 {
                ObservedPost::new(format!("https://x.com/owner/status/{i}"), "@owner", ts)
            } else if i % 3 == 0 {
                ObservedPost::new(format!("https://x.com/owner/status/{i}"), "@owner", ts).reply()
            } else {
                let handle = COMMENTERS[i % COMMENTERS.len()];
                ObservedPost::new(format!("https://x.com/{handle}/status/{i}"), format!("@{handle}"), ts)
            }
        })
        .collect()
}

fn reconstruction(c: &mut Criterion) {
    let reconstructor = ThreadReconstructor::new(Some("@owner"));
    let mut group = c.benchmark_group("reconstruct_timeline");
    for len in [100usize, 1_000, 5_000] {
        let buffer = timeline_buffer(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &buffer, |b, buffer| {
            b.iter(|| black_box(reconstructor.reconstruct_timeline(black_box(buffer))));
        });
    }
    group.finish();

    let status_buffer = timeline_buffer(1_000);
    c.bench_function("reconstruct_status_page/1000", |b| {
        b.iter(|| black_box(reconstruct_status_page(black_box(&status_buffer), Some("0"))));
    });
}

criterion_group!(benches, reconstruction);
criterion_main!(benches);
