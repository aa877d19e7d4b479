use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bimsync_collab::notifier::Watermark;
use bimsync_collab::protocol::{ChangeEvent, WireMessage};
use bimsync_collab::storage::{EditLog, MemoryEditLog};
use bimsync_core::{
    AuthorId, EditOp, ModelId, OperationEncoder, OperationRecord, PersistedRecord, Timestamp,
};

fn records(n: usize) -> Vec<OperationRecord> {
    OperationEncoder::new(ModelId::from("bench"), AuthorId::new("bench"))
        .normalize_all(
            (0..n)
                .map(|i| EditOp::translate(format!("wall-{i}"), [1.0, 0.5, 0.0]))
                .collect(),
        )
}

fn persisted(n: usize) -> Vec<PersistedRecord> {
    records(n)
        .into_iter()
        .enumerate()
        .map(|(i, record)| PersistedRecord {
            record,
            sequence_order: 0,
            created_at: Timestamp(i as u64 + 1),
        })
        .collect()
}

fn bench_event_encode(c: &mut Criterion) {
    let model = ModelId::from("bench");
    let event = ChangeEvent::insert(persisted(1).remove(0));

    c.bench_function("change_event_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::event(model.clone(), black_box(&event)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = ChangeEvent::insert(persisted(1).remove(0));
    let bytes = WireMessage::event(ModelId::from("bench"), &event).unwrap().encode().unwrap();

    c.bench_function("change_event_decode", |b| {
        b.iter(|| {
            let msg = WireMessage::decode(black_box(&bytes)).unwrap();
            black_box(msg.json::<ChangeEvent>().unwrap());
        })
    });
}

fn bench_memory_append_query(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let model = ModelId::from("bench");

    c.bench_function("memory_append_100_query", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = MemoryEditLog::new();
                log.append(&model, records(100)).await.unwrap();
                black_box(log.query(&model, None).await.unwrap());
            })
        })
    });
}

fn bench_watermark_admit(c: &mut Criterion) {
    let batch = persisted(1000);

    c.bench_function("watermark_admit_1000_twice", |b| {
        b.iter(|| {
            let mut watermark = Watermark::new();
            black_box(watermark.admit(batch.clone()));
            // Second pass is all duplicates.
            black_box(watermark.admit(batch.clone()));
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_memory_append_query,
    bench_watermark_admit,
);
criterion_main!(benches);
