// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Performance benchmarks for sessions through a running bridge.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sigbridge_test::Instance;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Benchmark pairing a server and client and exchanging a single byte.
fn session_setup(criterion: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let instance = runtime.block_on(Instance::new()).unwrap();

    criterion.bench_function("session_setup", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let (mut server, mut client) =
                    tokio::try_join!(instance.connect_server(), instance.connect_client()).unwrap();
                client.write_all(b"?").await.unwrap();
                let mut buf = [0; 1];
                server.read_exact(&mut buf).await.unwrap();
                client.shutdown().await.unwrap();
                let mut rest = vec![];
                server.read_to_end(&mut rest).await.unwrap();
            });
        });
    });

    _ = runtime.block_on(instance.halt());
}

/// Benchmark relaying payloads of various sizes from client to server and back.
fn relay_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let instance = runtime.block_on(Instance::new()).unwrap();
    let (mut server, mut client) = runtime
        .block_on(async {
            tokio::try_join!(instance.connect_server(), instance.connect_client())
        })
        .unwrap();

    let mut group = c.benchmark_group("relay_throughput");
    for size in [1024, 64 * 1024, 1024 * 1024_usize].iter() {
        group.throughput(criterion::Throughput::Bytes(*size as u64 * 2));
        let payload = vec![0x42; *size];
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut echo = vec![0; size];
                    let server_echo = async {
                        server.read_exact(&mut echo).await?;
                        server.write_all(&echo).await
                    };
                    let client_send = async {
                        client.write_all(&payload).await?;
                        let mut response = vec![0; size];
                        client.read_exact(&mut response).await?;
                        Ok::<_, std::io::Error>(response)
                    };
                    tokio::try_join!(server_echo, client_send).unwrap();
                });
            });
        });
    }
    group.finish();

    drop(server);
    drop(client);
    _ = runtime.block_on(instance.halt());
}

criterion_group!(benches, session_setup, relay_throughput);
criterion_main!(benches);
