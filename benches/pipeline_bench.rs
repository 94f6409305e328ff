use criterion::{criterion_group, criterion_main, Criterion};
use parz::pipeline::{compress_stream, PipelineOpts};
use parz::CodecId;
use std::io::Cursor;

fn bench_lz4_pipeline(c: &mut Criterion) {
    let data: Vec<u8> = b"a quick brown fox jumps over the lazy dog\n"
        .iter()
        .copied()
        .cycle()
        .take(4 << 20)
        .collect();
    c.bench_function("lz4 4MiB pipeline", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            let opts = PipelineOpts { chunksize: 1 << 20, ..PipelineOpts::new(CodecId::Lz4) };
            compress_stream(opts, &mut Cursor::new(&data), &mut out, Some(data.len() as u64))
                .unwrap();
            out
        })
    });
}

criterion_group!(benches, bench_lz4_pipeline);
criterion_main!(benches);
