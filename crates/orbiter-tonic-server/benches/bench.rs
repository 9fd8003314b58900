use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, stream::FuturesUnordered};
use orbiter_tonic_core::proto::{
    PropagationConfig, ReferenceFrame, TleListRequest, TleLines, propagation_client::PropagationClient,
    tle_outcome,
};
use std::{
    hint::black_box,
    net::TcpStream,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;
use tonic::{codec::CompressionEncoding, transport::Channel};

const ADDR: &str = "127.0.0.1:50061";
const ISS_LINE1: &str = "1 25544U 98067A   08264.51782528 -.00002182  00000-0 -11606-4 0  2927";
const ISS_LINE2: &str = "2 25544  51.6416 247.4627 0006703 130.5360 325.0288 15.72125391563537";

/// A release build of `orbiter-server`, killed when dropped.
struct ServerProcess(Child);

impl ServerProcess {
    fn start() -> Self {
        let child = Command::new("cargo")
            .args(["run", "--release", "--bin", "orbiter-server", "--"])
            .args(["--server-addr", ADDR, "--max-threads", "16"])
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start orbiter-server");
        let server = Self(child);

        // Allow for a cold release build.
        let deadline = Instant::now() + Duration::from_secs(300);
        while TcpStream::connect(ADDR).is_err() {
            assert!(Instant::now() < deadline, "orbiter-server never listened on {ADDR}");
            thread::sleep(Duration::from_millis(100));
        }
        server
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[derive(Clone, Copy, Debug)]
struct Case {
    tles: usize,
    clients: usize,
    encoding: Option<CompressionEncoding>,
}

impl Case {
    fn name(&self) -> String {
        let encoding = match self.encoding {
            None => "none",
            Some(CompressionEncoding::Gzip) => "gzip",
            Some(CompressionEncoding::Zstd) => "zstd",
            Some(_) => "other",
        };
        format!("tles/{}/clients/{}/comp/{encoding}", self.tles, self.clients)
    }

    fn request(&self) -> TleListRequest {
        let tle = TleLines {
            line1: ISS_LINE1.to_owned(),
            line2: ISS_LINE2.to_owned(),
        };
        TleListRequest {
            config: Some(PropagationConfig {
                start_date: "2024-01-01T00:00:00Z".into(),
                end_date: "2024-01-01T01:30:00Z".into(),
                position_count: 60,
                output_frame: ReferenceFrame::Itrf.into(),
            }),
            tles: vec![tle; self.tles],
        }
    }
}

/// One round: every client sends the same list and drains its stream.
async fn round(channel: &Channel, case: Case) {
    let mut clients: FuturesUnordered<_> = (0..case.clients)
        .map(|_| {
            let mut client = PropagationClient::new(channel.clone());
            if let Some(encoding) = case.encoding {
                client = client.send_compressed(encoding).accept_compressed(encoding);
            }
            tokio::spawn(async move {
                let mut batches = client
                    .propagate_tle_list(case.request())
                    .await
                    .expect("PropagateTleList failed")
                    .into_inner();

                let mut tracks = 0;
                while let Some(batch) = batches.next().await {
                    for outcome in batch.expect("stream failed").outcomes {
                        if let Some(tle_outcome::Outcome::Track(track)) = outcome.outcome {
                            black_box(track);
                            tracks += 1;
                        }
                    }
                }
                assert_eq!(tracks, case.tles);
            })
        })
        .collect();

    while let Some(joined) = clients.next().await {
        joined.expect("client task panicked");
    }
}

fn propagate_tle_list(c: &mut Criterion) {
    let _server = ServerProcess::start();
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let encodings = [
        None,
        Some(CompressionEncoding::Zstd),
        Some(CompressionEncoding::Gzip),
    ];
    let mut group = c.benchmark_group("grpc/propagate_tle_list");
    for tles in [100, 1_000, 5_000] {
        for clients in [1, 4, 16] {
            for encoding in encodings {
                let case = Case {
                    tles,
                    clients,
                    encoding,
                };
                group.throughput(Throughput::Elements((tles * clients) as u64));
                group.bench_function(case.name(), |b| {
                    b.to_async(&rt).iter_custom(|iters| async move {
                        let channel = Channel::from_shared(format!("http://{ADDR}"))
                            .unwrap()
                            .connect()
                            .await
                            .expect("cannot connect to orbiter-server");
                        let start = Instant::now();
                        for _ in 0..iters {
                            round(&channel, case).await;
                        }
                        start.elapsed()
                    });
                });
            }
        }
    }
    group.finish();
}

criterion_group!(benches, propagate_tle_list);
criterion_main!(benches);
