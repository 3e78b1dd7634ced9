use bytes::BytesMut;
use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use parkline_core::{Frame, FrameCodec, PackageType};
use std::{
    net::TcpStream,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    runtime::Builder,
};

const SERVER_ADDR: &str = "127.0.0.1:6600";
const MAX_PACKAGE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct PackageBenchParams {
    packages_per_connection: u64,
    payload_bytes: usize,
    connections: usize,
}

fn package_bench(c: &mut Criterion) {
    // Start the server. This may require a full compilation so set the timeout
    // high. Adjust CLI args to the server as necessary.
    let mut server = Command::new("cargo")
        .args([
            "run",
            "--bin",
            "parkline-server",
            "--release",
            "--",
            "--server-addr",
            SERVER_ADDR,
            "--num-workers",
            "8",
            "--worker-capacity",
            "16",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("Failed to start parkline-server");
    wait_for_port(SERVER_ADDR, 300);

    let packages_cases = [100, 1_000];
    let payload_cases = [16, 1024];
    let connection_cases = [1, 4, 16];

    // Generate cartesian product of all param combinations
    let mut cases = Vec::new();
    for &packages_per_connection in &packages_cases {
        for &payload_bytes in &payload_cases {
            for &connections in &connection_cases {
                cases.push(PackageBenchParams {
                    packages_per_connection,
                    payload_bytes,
                    connections,
                });
            }
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("tcp/package_ack");
        group.throughput(Throughput::Elements(
            params.packages_per_connection * params.connections as u64,
        ));

        group.bench_function(
            format!(
                "packages/{}/payload/{}/conns/{}",
                params.packages_per_connection, params.payload_bytes, params.connections,
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let start = Instant::now();

                    for _ in 0..iters {
                        run_package_bench(params).await;
                    }

                    start.elapsed()
                });
            },
        );

        group.finish();
    }

    if server.kill().is_err() {
        eprintln!("failed to kill server");
    }
}

async fn run_package_bench(params: &PackageBenchParams) {
    let codec = FrameCodec::new(MAX_PACKAGE_BYTES);
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.connections {
        let params = *params;

        tasks.push(tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(SERVER_ADDR)
                .await
                .expect("Failed to connect to server");

            let payload = vec![0xA5_u8; params.payload_bytes];
            let mut out = BytesMut::new();
            for _ in 0..params.packages_per_connection {
                let frame = Frame::new(PackageType::new(1), payload.clone().into());
                codec.encode(&frame, &mut out).expect("encode");
            }
            stream.write_all(&out).await.expect("write failed");

            let mut buf = BytesMut::with_capacity(4096);
            let mut acked = 0;
            while acked < params.packages_per_connection {
                while let Some(frame) = codec.decode(&mut buf).expect("corrupt response") {
                    black_box(frame);
                    acked += 1;
                }
                if acked == params.packages_per_connection {
                    break;
                }
                let read = stream.read_buf(&mut buf).await.expect("read failed");
                assert_ne!(read, 0, "server closed connection early");
            }
        }));
    }

    // Wait for all tasks to complete
    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

pub fn wait_for_port(addr: &str, timeout_secs: u64) {
    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Server did not start listening on {}", addr);
}

criterion_group!(package_benches, package_bench);
criterion_main!(package_benches);
