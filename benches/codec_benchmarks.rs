use ccrpc::bag::Params;
use ccrpc::escape::{escape, unescape};
use ccrpc::frame::{FrameReader, FrameWriter, FramingMode, WireEvent};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Cursor;

fn bench_escape(c: &mut Criterion) {
    let mut group = c.benchmark_group("escape");
    let plain = b"the quick brown fox jumps over the lazy dog".repeat(4);
    let escapeable = b"line1\nline2\ttab\x07bell\\slash".repeat(4);
    group.bench_function(BenchmarkId::new("escape", "plain"), |b| b.iter(|| escape(&plain)));
    group.bench_function(BenchmarkId::new("escape", "needs_escaping"), |b| b.iter(|| escape(&escapeable)));
    let escaped = escape(&escapeable);
    group.bench_function(BenchmarkId::new("unescape", "needs_escaping"), |b| b.iter(|| unescape(&escaped)));
    group.finish();
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_round_trip");
    for mode in [FramingMode::Text, FramingMode::Binary] {
        let label = match mode {
            FramingMode::Text => "text",
            FramingMode::Binary => "binary",
        };
        group.bench_function(BenchmarkId::new("write_then_read", label), |b| {
            b.iter(|| {
                let mut buf = Vec::new();
                {
                    let mut w = FrameWriter::new(&mut buf, mode);
                    for i in 0..32 {
                        w.write_param(format!("key{i}").as_bytes(), b"some reasonably sized value").unwrap();
                    }
                    w.write_call(b"do_work", 42, None).unwrap();
                }
                let mut r = FrameReader::new(Cursor::new(buf), mode);
                let mut count = 0;
                while let Some(ev) = r.read_event().unwrap() {
                    if matches!(ev, WireEvent::Call { .. }) {
                        break;
                    }
                    count += 1;
                }
                count
            })
        });
    }
    group.finish();
}

fn bench_params_insert(c: &mut Criterion) {
    c.bench_function("params_insert_100", |b| {
        b.iter(|| {
            let mut bag = Params::new();
            for i in 0..100 {
                bag.insert(format!("k{i}"), format!("v{i}"));
            }
            bag
        })
    });
}

criterion_group!(benches, bench_escape, bench_frame_round_trip, bench_params_insert);
criterion_main!(benches);
