use criterion::{black_box, criterion_group, Criterion};
use prometheus_client::registry::Registry;
use sluice_buffer::{Buffer, Config, HeapMemoryManager, MemoryManager};

fn benchmark_allocate(c: &mut Criterion) {
    let manager = HeapMemoryManager::new(Config::default(), &mut Registry::default());
    for size in [64, 1024, 16 * 1024, 256 * 1024] {
        c.bench_function(&format!("{}/pooled/size={}", module_path!(), size), |b| {
            b.iter(|| black_box(manager.allocate(size).unwrap()));
        });
        c.bench_function(&format!("{}/unpooled/size={}", module_path!(), size), |b| {
            b.iter(|| black_box(Buffer::with_capacity(size)));
        });
    }
}

fn benchmark_trim(c: &mut Criterion) {
    let manager = HeapMemoryManager::new(Config::default(), &mut Registry::default());
    c.bench_function(&format!("{}/write_trim", module_path!()), |b| {
        b.iter(|| {
            let mut buffer = manager.allocate(4096).unwrap();
            buffer.put_slice(&[1u8; 100]).unwrap();
            buffer.trim();
            black_box(buffer)
        });
    });
}

criterion_group!(benches, benchmark_allocate, benchmark_trim);
