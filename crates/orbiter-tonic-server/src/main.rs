#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use futures::Stream;
use orbiter_tonic_core::proto::{
    FILE_DESCRIPTOR_SET, propagation_server::PropagationServer,
    transformation_server::TransformationServer, visibility_server::VisibilityServer,
};
use server::config::{CliArgs, ServerConfig};
use server::service::{
    handler::ServiceCore, propagation::PropagationService,
    transformation::TransformationService, visibility::VisibilityService,
};
use server::telemetry::{TelemetryProviders, init_telemetry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// Worker threads allocate a track per item; mimalloc holds up better than
// the system allocator under that contention, especially on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Registers every compression scheme in both directions.
macro_rules! with_compression {
    ($server:expr) => {
        $server
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Deflate)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate)
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;
    let providers = init_telemetry()?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        addr = %config.server_addr,
        uds = config.uds,
        pool = ?config.pool.kind,
        threads = config.pool.max_threads.get(),
        max_items = config.max_items_per_request,
        "Starting orbiter"
    );
    #[cfg(feature = "tracing")]
    tracing::debug!("Effective config: {config:#?}");

    let addr = config.server_addr.clone();
    let core = ServiceCore::new(config)?;

    if core.config().uds {
        serve_unix(&addr, core, providers).await
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        serve(incoming, core, providers, shutdown_signal()).await
    }
}

#[cfg(unix)]
async fn serve_unix(
    path: &str,
    core: ServiceCore,
    providers: TelemetryProviders,
) -> anyhow::Result<()> {
    let listener = tokio::net::UnixListener::bind(path)?;
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
    let served = serve(incoming, core, providers, shutdown_signal()).await;
    // The socket file outlives the listener.
    if let Err(_e) = std::fs::remove_file(path) {
        #[cfg(feature = "tracing")]
        tracing::warn!("Could not remove socket {path}: {_e}");
    }
    served
}

#[cfg(not(unix))]
async fn serve_unix(
    _path: &str,
    _core: ServiceCore,
    _providers: TelemetryProviders,
) -> anyhow::Result<()> {
    anyhow::bail!("Unix domain sockets are not supported on this platform")
}

/// Serves every service on `incoming` until `signal` resolves, then drains
/// and stops.
async fn serve<I, IO, IE, F>(
    incoming: I,
    core: ServiceCore,
    providers: TelemetryProviders,
    signal: F,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    F: Future<Output = ()>,
{
    let (health, health_service) = tonic_health::server::health_reporter();
    set_health(&health, true).await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    // Browsers reach the services through gRPC-Web, from any origin.
    let web = ServiceBuilder::new()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(tonic_web::GrpcWebLayer::new());

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(web)
        .add_service(health_service)
        .add_service(reflection)
        .add_service(with_compression!(PropagationServer::new(
            PropagationService::new(core.clone())
        )))
        .add_service(with_compression!(VisibilityServer::new(
            VisibilityService::new(core.clone())
        )))
        .add_service(with_compression!(TransformationServer::new(
            TransformationService::new(core.clone())
        )))
        .serve_with_incoming_shutdown(incoming, async move {
            signal.await;
            drain(core, health, providers).await;
        })
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Server stopped");
    Ok(())
}

async fn set_health(reporter: &HealthReporter, serving: bool) {
    if serving {
        reporter
            .set_serving::<PropagationServer<PropagationService>>()
            .await;
        reporter
            .set_serving::<VisibilityServer<VisibilityService>>()
            .await;
        reporter
            .set_serving::<TransformationServer<TransformationService>>()
            .await;
    } else {
        reporter
            .set_not_serving::<PropagationServer<PropagationService>>()
            .await;
        reporter
            .set_not_serving::<VisibilityServer<VisibilityService>>()
            .await;
        reporter
            .set_not_serving::<TransformationServer<TransformationService>>()
            .await;
    }
}

/// Runs once the shutdown signal fired: health goes to `NOT_SERVING`, open
/// streams and pool jobs drain, then telemetry is flushed.
async fn drain(core: ServiceCore, health: HealthReporter, providers: TelemetryProviders) {
    #[cfg(feature = "tracing")]
    tracing::info!(
        "Draining {} open streams and {} pool jobs",
        core.streams_inflight(),
        core.pool().in_flight()
    );

    set_health(&health, false).await;

    if let Err(_e) = core.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Shutdown did not complete cleanly: {_e}");
    }

    providers.shutdown();
}

/// Resolves on Ctrl+C or, on unix, SIGTERM. A handler that cannot be
/// installed never resolves, leaving the other one in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Cannot listen for Ctrl+C: {_e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Cannot listen for SIGTERM: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Ctrl+C received");
        }
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("SIGTERM received");
        }
    }
}
