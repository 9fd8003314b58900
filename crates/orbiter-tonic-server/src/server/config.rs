use anyhow::{Context, bail};
use clap::Parser;
use core::{num::NonZeroUsize, time::Duration};
use orbiter::{
    DispatchOptions, DynamicBatchSize, IngestionOptions, PoolConfig, PoolKind, ReconfigPolicy,
};

/// Runtime configuration for the `orbiter-server` binary.
///
/// These settings control the worker pool, the per-call fan-out window, the
/// ingestion buffer of bidirectional streams and the size of the batches
/// streamed back to clients. All values are parsed from CLI arguments or
/// environment variables (a `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "orbiter-server",
    version,
    about = "A gRPC service for bulk TLE propagation and ground-station visibility"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/orbiter.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Worker pool strategy: `fixed`, `elastic` or `cached`.
    ///
    /// Environment variable: `EXECUTOR_TYPE`
    #[arg(long, env = "EXECUTOR_TYPE", default_value_t = String::from("fixed"))]
    pub executor_type: String,

    /// Worker threads (`fixed`) or concurrent job cap (`elastic`).
    ///
    /// Environment variable: `MAX_THREADS`
    #[arg(long, env = "MAX_THREADS", default_value_t = 16)]
    pub max_threads: usize,

    /// Jobs the `fixed` pool queues before submissions wait.
    ///
    /// Environment variable: `POOL_QUEUE_CAPACITY`
    #[arg(long, env = "POOL_QUEUE_CAPACITY", default_value_t = 1024)]
    pub pool_queue_capacity: usize,

    /// How long a submission may wait for room in the pool before the call
    /// fails with `RESOURCE_EXHAUSTED`. 0 waits forever.
    ///
    /// Environment variable: `POOL_ADMISSION_TIMEOUT_MS`
    #[arg(long, env = "POOL_ADMISSION_TIMEOUT_MS", default_value_t = 10_000)]
    pub pool_admission_timeout_ms: u64,

    /// Items computed at once by a single bulk call.
    ///
    /// Environment variable: `BULK_CONCURRENCY`
    #[arg(long, env = "BULK_CONCURRENCY", default_value_t = 64)]
    pub bulk_concurrency: usize,

    /// Items computed at once by a single bidirectional stream.
    ///
    /// Environment variable: `STREAM_CONCURRENCY`
    #[arg(long, env = "STREAM_CONCURRENCY", default_value_t = 32)]
    pub stream_concurrency: usize,

    /// Soft per-item timeout. An item that exceeds it is reported as a
    /// timeout failure. 0 disables it.
    ///
    /// Environment variable: `ITEM_TIMEOUT_MS`
    #[arg(long, env = "ITEM_TIMEOUT_MS", default_value_t = 0)]
    pub item_timeout_ms: u64,

    /// Maximum number of TLEs accepted by one bulk request.
    ///
    /// Environment variable: `MAX_ITEMS_PER_REQUEST`
    #[arg(long, env = "MAX_ITEMS_PER_REQUEST", default_value_t = 50_000)]
    pub max_items_per_request: usize,

    /// Items a bidirectional stream buffers between the network and the
    /// dispatcher. A full buffer stops reading from the client.
    ///
    /// Environment variable: `INGEST_BUFFER_SIZE`
    #[arg(long, env = "INGEST_BUFFER_SIZE", default_value_t = 32_768)]
    pub ingest_buffer_size: usize,

    /// How long a stream may stay blocked on a full ingestion buffer before
    /// it fails with `RESOURCE_EXHAUSTED`. 0 blocks indefinitely.
    ///
    /// Environment variable: `INGEST_STALL_TIMEOUT_MS`
    #[arg(long, env = "INGEST_STALL_TIMEOUT_MS", default_value_t = 0)]
    pub ingest_stall_timeout_ms: u64,

    /// Capacity of the response buffer between the dispatcher and the gRPC
    /// stream, in batches.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Approximate encoded size the batch sizing policy aims for.
    ///
    /// Environment variable: `TARGET_BATCH_BYTES`
    #[arg(long, env = "TARGET_BATCH_BYTES", default_value_t = 1024 * 1024)]
    pub target_batch_bytes: usize,

    /// Environment variable: `MIN_BATCH_SIZE`
    #[arg(long, env = "MIN_BATCH_SIZE", default_value_t = 1)]
    pub min_batch_size: usize,

    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 500)]
    pub max_batch_size: usize,

    /// State vectors converted by one pool job in `BatchTransform`. Each
    /// chunk is delivered as one batch.
    ///
    /// Environment variable: `TRANSFORM_CHUNK_SIZE`
    #[arg(long, env = "TRANSFORM_CHUNK_SIZE", default_value_t = 500)]
    pub transform_chunk_size: usize,

    /// What a bidirectional stream does with a second config message:
    /// `reject` fails the stream, `apply` uses it for every later item.
    ///
    /// Environment variable: `RECONFIG_POLICY`
    #[arg(long, env = "RECONFIG_POLICY", default_value_t = String::from("reject"))]
    pub reconfig_policy: String,

    /// Seconds to wait for in-flight streams and jobs during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub pool: PoolConfig,
    pub bulk_dispatch: DispatchOptions,
    pub stream_dispatch: DispatchOptions,
    pub max_items_per_request: usize,
    pub ingestion: IngestionOptions,
    pub stream_buffer_size: usize,
    pub batch_sizing: DynamicBatchSize,
    pub transform_chunk_size: NonZeroUsize,
    pub shutdown_timeout: Duration,
}

fn non_zero(value: usize, name: &str) -> anyhow::Result<NonZeroUsize> {
    NonZeroUsize::new(value).with_context(|| format!("{name} must be greater than 0"))
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let kind = args
            .executor_type
            .parse::<PoolKind>()
            .map_err(|e| anyhow::anyhow!("EXECUTOR_TYPE: {e}"))?;
        let reconfig = args
            .reconfig_policy
            .parse::<ReconfigPolicy>()
            .map_err(|e| anyhow::anyhow!("RECONFIG_POLICY: {e}"))?;

        let max_threads = non_zero(args.max_threads, "MAX_THREADS")?;
        let queue_capacity = non_zero(args.pool_queue_capacity, "POOL_QUEUE_CAPACITY")?;
        let bulk_concurrency = non_zero(args.bulk_concurrency, "BULK_CONCURRENCY")?;
        let stream_concurrency = non_zero(args.stream_concurrency, "STREAM_CONCURRENCY")?;
        let ingest_buffer_size = non_zero(args.ingest_buffer_size, "INGEST_BUFFER_SIZE")?;
        let min_batch_size = non_zero(args.min_batch_size, "MIN_BATCH_SIZE")?;
        let max_batch_size = non_zero(args.max_batch_size, "MAX_BATCH_SIZE")?;
        let transform_chunk_size = non_zero(args.transform_chunk_size, "TRANSFORM_CHUNK_SIZE")?;

        if args.max_items_per_request == 0 {
            bail!("MAX_ITEMS_PER_REQUEST must be greater than 0");
        }
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }
        if args.target_batch_bytes == 0 {
            bail!("TARGET_BATCH_BYTES must be greater than 0");
        }
        if max_batch_size < min_batch_size {
            bail!(
                "MAX_BATCH_SIZE ({}) must not be smaller than MIN_BATCH_SIZE ({})",
                max_batch_size,
                min_batch_size
            );
        }

        let shutdown_timeout = Duration::from_secs(args.shutdown_timeout);
        let item_timeout = millis(args.item_timeout_ms);

        Ok(Self {
            pool: PoolConfig {
                kind,
                max_threads,
                queue_capacity,
                admission_timeout: millis(args.pool_admission_timeout_ms),
                shutdown_timeout,
            },
            bulk_dispatch: DispatchOptions::default()
                .with_max_concurrency(bulk_concurrency)
                .with_item_timeout(item_timeout),
            stream_dispatch: DispatchOptions::default()
                .with_max_concurrency(stream_concurrency)
                .with_item_timeout(item_timeout),
            max_items_per_request: args.max_items_per_request,
            ingestion: IngestionOptions {
                buffer_size: ingest_buffer_size,
                stall_timeout: millis(args.ingest_stall_timeout_ms),
                reconfig,
            },
            stream_buffer_size: args.stream_buffer_size,
            batch_sizing: DynamicBatchSize::new(
                args.target_batch_bytes,
                min_batch_size,
                max_batch_size,
            ),
            transform_chunk_size,
            shutdown_timeout,
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("orbiter-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.pool.kind, PoolKind::Fixed);
        assert_eq!(config.pool.max_threads.get(), 16);
        assert_eq!(config.pool.admission_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.bulk_dispatch.max_concurrency.get(), 64);
        assert_eq!(config.stream_dispatch.max_concurrency.get(), 32);
        assert_eq!(config.bulk_dispatch.item_timeout, None);
        assert_eq!(config.ingestion.reconfig, ReconfigPolicy::Reject);
        assert_eq!(config.batch_sizing.max().get(), 500);
        assert_eq!(config.transform_chunk_size.get(), 500);
    }

    #[test]
    fn zero_millis_disable_timeouts() {
        let config = parse(&[
            "--pool-admission-timeout-ms",
            "0",
            "--item-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.pool.admission_timeout, None);
        assert_eq!(
            config.stream_dispatch.item_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse(&["--max-threads", "0"]).is_err());
        assert!(parse(&["--executor-type", "greedy"]).is_err());
        assert!(parse(&["--reconfig-policy", "merge"]).is_err());
        assert!(parse(&["--min-batch-size", "10", "--max-batch-size", "5"]).is_err());
        assert!(parse(&["--max-items-per-request", "0"]).is_err());
        assert!(parse(&["--transform-chunk-size", "0"]).is_err());
    }

    #[test]
    fn accepts_alternate_executors() {
        assert_eq!(
            parse(&["--executor-type", "elastic"]).unwrap().pool.kind,
            PoolKind::Elastic
        );
        assert_eq!(
            parse(&["--executor-type", "cached"]).unwrap().pool.kind,
            PoolKind::Cached
        );
        assert_eq!(
            parse(&["--reconfig-policy", "apply"])
                .unwrap()
                .ingestion
                .reconfig,
            ReconfigPolicy::ApplyToSubsequent
        );
    }
}
