use bytes::Bytes;
use criterion::{criterion_group, BatchSize, Criterion};
use prometheus_client::registry::Registry;
use sluice_writer::{mocks, queue::Kind, AsyncQueueWriter, Config, ReadyState};

fn benchmark_drain(c: &mut Criterion) {
    let payload = Bytes::from_static(&[7; 512]);
    for kind in [Kind::Concurrent, Kind::Locked] {
        for messages in [16, 256] {
            let writer: AsyncQueueWriter<Bytes> = AsyncQueueWriter::new(
                Config {
                    queue: kind,
                    ..Config::default()
                },
                &mut Registry::default(),
            );
            c.bench_function(
                &format!("{}/queue={:?} messages={}", module_path!(), kind, messages),
                |b| {
                    b.iter_batched(
                        || {
                            // Block the socket so every message is queued
                            let socket = mocks::Socket::with_capacity(0);
                            let connection = writer.connect(socket.clone());
                            for _ in 0..messages {
                                writer.write(&connection, None, payload.clone(), None, None);
                            }
                            socket.set_capacity(None);
                            connection
                        },
                        |connection| {
                            assert_eq!(writer.on_ready(&connection), ReadyState::Complete);
                        },
                        BatchSize::SmallInput,
                    );
                },
            );
        }
    }
}

criterion_group!(benches, benchmark_drain);
