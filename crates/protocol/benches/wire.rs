//! Benchmarks for Bulk-Only wire frames
//!
//! Measures the per-command framing overhead:
//! - CommandWrapper construction and encoding
//! - StatusWrapper decoding with tag validation

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use protocol::{Command, CommandWrapper, CswStatus, StatusWrapper, scsi};

fn benchmark_command_wrapper(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_wrapper");

    let read = Command::read(&scsi::read_10(0x1000, 8), 4096).unwrap();
    group.bench_function("encode_read_10", |b| {
        b.iter(|| {
            CommandWrapper::new(black_box(7), black_box(&read), read.cdb())
                .unwrap()
                .encode()
        })
    });

    let frame = CommandWrapper::new(7, &read, read.cdb()).unwrap().encode();
    group.bench_function("decode_read_10", |b| {
        b.iter(|| CommandWrapper::decode(black_box(&frame)))
    });

    group.finish();
}

fn benchmark_status_wrapper(c: &mut Criterion) {
    let mut group = c.benchmark_group("status_wrapper");

    let frame = StatusWrapper {
        tag: 7,
        residue: 0,
        status: CswStatus::Passed,
    }
    .encode();

    group.bench_function("decode_for_tag", |b| {
        b.iter(|| StatusWrapper::decode_for(black_box(&frame), black_box(7)))
    });

    group.finish();
}

criterion_group!(benches, benchmark_command_wrapper, benchmark_status_wrapper);
criterion_main!(benches);
