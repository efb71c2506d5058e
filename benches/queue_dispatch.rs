use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use coursegen::job::UnitKind;
use coursegen::queue::{QueueEntry, Release, WorkQueue};
use coursegen::types::{JobId, Priority, UnitId};
use std::time::Duration;

const PRIORITIES: [Priority; 4] = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

fn filled_queue(jobs: usize, chapters_per_job: usize) -> WorkQueue {
    let queue = WorkQueue::new(4, Duration::from_secs(300));
    for job in 0..jobs {
        let job_id = JobId::new();
        let priority = PRIORITIES[job % PRIORITIES.len()];
        for chapter in 0..chapters_per_job {
            queue.enqueue(QueueEntry::new(UnitId::new(), job_id, UnitKind::Chapter(chapter), priority));
        }
        queue.enqueue(QueueEntry::new(UnitId::new(), job_id, UnitKind::Validation, priority));
    }
    queue
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("chapter_entry", |b| {
        let queue = WorkQueue::new(4, Duration::from_secs(300));
        let job_id = JobId::new();
        b.iter(|| {
            black_box(queue.enqueue(QueueEntry::new(
                UnitId::new(),
                job_id,
                UnitKind::Chapter(0),
                Priority::Normal,
            )))
        });
    });
    group.finish();
}

fn bench_claim_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_release");
    for jobs in [1usize, 10, 50] {
        let chapters = 10;
        let total = (jobs * (chapters + 1)) as u64;
        group.throughput(Throughput::Elements(total));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            b.iter_batched(
                || filled_queue(jobs, chapters),
                |queue| {
                    while let Some(entry) = queue.try_claim() {
                        queue.release(&entry, Release::Completed);
                    }
                    black_box(queue.stats())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_release);
criterion_main!(benches);
