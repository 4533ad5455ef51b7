use criterion::{criterion_group, criterion_main, Criterion};
use chronicle_core::{
    apply_patch, plan_reactivation, Memory, MemoryDraft, MemoryPatch, MemoryStats, MemoryStatus,
    MemoryType, Severity, TriggerType,
};
use time::{Duration, OffsetDateTime};

fn mk_memory(index: usize) -> Memory {
    let memory_type = match index % 4 {
        0 => MemoryType::Future,
        1 => MemoryType::Decision,
        2 => MemoryType::Failure,
        _ => MemoryType::Context,
    };
    let trigger_type = if index % 3 == 0 {
        TriggerType::Date
    } else {
        TriggerType::None
    };
    let trigger_date = (trigger_type == TriggerType::Date)
        .then(|| OffsetDateTime::UNIX_EPOCH + Duration::days(30 + (index as i64 % 90)));
    let draft = MemoryDraft {
        title: format!("Benchmark memory {index}"),
        description: "Fixture describing a production incident and its follow-up".to_string(),
        memory_type,
        trigger_type,
        trigger_date,
        team_id: "bench".to_string(),
        tags: vec!["bench".to_string()],
        severity: Some(Severity::Medium),
    };
    match Memory::new(draft, OffsetDateTime::UNIX_EPOCH) {
        Ok(memory) => memory,
        Err(err) => panic!("benchmark fixture should validate: {err}"),
    }
}

fn bench_patch(c: &mut Criterion) {
    let memories = (0..1_000).map(mk_memory).collect::<Vec<_>>();
    let patch = MemoryPatch {
        title: Some("Benchmark memory, revisited".to_string()),
        status: Some(MemoryStatus::Archived),
        ..MemoryPatch::default()
    };
    let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1);

    c.bench_function("apply_patch_1000_memories", |b| {
        b.iter(|| {
            for memory in &memories {
                if let Err(err) = apply_patch(memory, &patch, now) {
                    panic!("benchmark patch failed: {err}");
                }
            }
        });
    });
}

fn bench_planning(c: &mut Criterion) {
    let memories = (0..1_000).map(mk_memory).collect::<Vec<_>>();
    let now = OffsetDateTime::UNIX_EPOCH + Duration::days(60);

    c.bench_function("plan_and_tally_1000_memories", |b| {
        b.iter(|| {
            for memory in &memories {
                let _ = plan_reactivation(memory, now);
            }
            MemoryStats::tally(&memories)
        });
    });
}

criterion_group!(lifecycle_benches, bench_patch, bench_planning);
criterion_main!(lifecycle_benches);
