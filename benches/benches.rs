use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use ublox_stream::synchronizer::read_frames;
use ublox_stream::ubx::checksum;

/// A realistic capture: interleaved GGA sentences and ESF-MEAS frames with
/// a little line noise between them.
fn capture(repeats: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut ubx_frame = vec![
        0xb5, 0x62, 0x10, 0x02, 0x0c, 0x00, 0, 0, 0, 0, 0, 0x08, 0, 0, 0x00, 0x04, 0x00, 16,
    ];
    let (ck_a, ck_b) = checksum(&ubx_frame[2..]);
    ubx_frame.extend_from_slice(&[ck_a, ck_b]);

    let mut stream = Vec::new();
    for _ in 0..repeats {
        stream.extend_from_slice(
            b"$GPGGA,092725.00,4717.11399,N,00833.91590,E,1,08,1.01,499.6,M,48.0,M,,*5B\r\n",
        );
        stream.extend_from_slice(&ubx_frame);
        // a couple of noise bytes a flaky link would add
        stream.push(rng.gen());
        stream.push(rng.gen());
    }
    stream
}

fn bench_synchronizer(c: &mut Criterion) {
    let stream = capture(512);

    let mut group = c.benchmark_group("synchronizer");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("scan_mixed_stream", |b| {
        b.iter(|| {
            let n = read_frames(std::io::Cursor::new(&stream[..]))
                .filter_map(Result::ok)
                .count();
            black_box(n);
        });
    });
    group.finish();
}

fn bench_ubx_checksum(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let buf: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

    let mut group = c.benchmark_group("ubx");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("checksum", |b| {
        b.iter(|| black_box(checksum(&buf)));
    });
    group.finish();
}

criterion_group!(benches, bench_synchronizer, bench_ubx_checksum);
criterion_main!(benches);
