use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kvlink_core::protocol::{Frame, FrameCodec, Message, Span, TransferRequest};
use kvlink_core::types::TransferOp;
use rand::Rng;
use tokio_util::codec::{Decoder, Encoder};

fn write_frame(spans: usize, span_len: u64) -> Frame {
    let mut rng = rand::rng();
    let spans: Vec<Span> = (0..spans)
        .map(|i| Span {
            addr: 0x7f00_0000_0000 + i as u64 * span_len,
            len: span_len,
        })
        .collect();
    let total: u64 = spans.iter().map(|s| s.len).sum();
    let payload: Vec<u8> = (0..total).map(|_| rng.random()).collect();
    Frame::with_payload(
        Message::Transfer(TransferRequest {
            op: TransferOp::Write,
            spans,
        }),
        Bytes::from(payload),
    )
}

fn bench_transfer_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_frame");
    // (spans per batch, bytes per span)
    for (spans, span_len) in [(1usize, 40u64), (256, 40), (256, 16 * 1024), (16, 2 * 1024 * 1024)] {
        let frame = write_frame(spans, span_len);
        let bytes = spans as u64 * span_len;
        group.throughput(Throughput::Bytes(bytes));
        let id = format!("{spans}x{span_len}");

        group.bench_with_input(BenchmarkId::new("encode", &id), &frame, |b, frame| {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::with_capacity(bytes as usize + 4096);
            b.iter(|| {
                buf.clear();
                codec.encode(frame.clone(), &mut buf).unwrap();
                black_box(buf.len());
            })
        });

        let mut encoded = BytesMut::new();
        FrameCodec::new().encode(frame.clone(), &mut encoded).unwrap();
        let encoded = encoded.freeze();
        group.bench_with_input(BenchmarkId::new("decode", &id), &encoded, |b, encoded| {
            let mut codec = FrameCodec::new();
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let frame = codec.decode(&mut buf).unwrap().unwrap();
                black_box(frame.payload.len());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transfer_frames);
criterion_main!(benches);
