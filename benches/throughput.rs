use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use replicad::config::OmgrConfig;
use replicad::state::{ChannelSubscriber, DObjectManager, Notification};
use replicad_proto::{DEvent, FieldKind, ObjectClass};
use std::time::{Duration, Instant};

// Measures the object manager loop end to end: events are posted from a
// task, applied on the loop and fanned out to a channel subscriber.

const EVENTS: u64 = 1_000;

fn loop_throughput_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let (omgr, oid, mut rx) = rt.block_on(async {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let class = ObjectClass::builder("Counter")
            .field("value", FieldKind::Int)
            .build();
        let oid = omgr.register_object(class).await.unwrap();
        let (subscriber, mut rx) = ChannelSubscriber::new();
        omgr.subscribe_to_object(oid, subscriber);
        assert!(matches!(rx.recv().await, Some(Notification::Available(_))));
        (omgr, oid, rx)
    });

    let mut group = c.benchmark_group("omgr");
    group.throughput(Throughput::Elements(EVENTS));
    group.bench_function("apply_and_notify", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    for i in 0..EVENTS {
                        omgr.post_event(DEvent::attribute_changed(oid, "value", i as i64));
                    }
                    for _ in 0..EVENTS {
                        rx.recv().await.unwrap();
                    }
                    elapsed += start.elapsed();
                }
                elapsed
            })
        })
    });
    group.finish();

    omgr.shutdown();
}

criterion_group!(benches, loop_throughput_benchmark);
criterion_main!(benches);
