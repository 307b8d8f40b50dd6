pub mod datadist_node;
pub mod http_server;
mod metric;
pub mod store_node;
mod utils;

use clap::{Args, Parser, Subcommand};
use kvlink_core::rendezvous::RendezvousServer;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

use datadist_node::DataDistArgs;
use http_server::{SharedStatus, new_status, start_http_server};
use store_node::StoreArgs;

#[derive(Parser, Debug)]
#[command(
    name = "kvlink",
    about = "KV cache block transfer nodes: rendezvous master, prompt/decoder pair, object store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Serve /health and /status on this address
    #[arg(long, global = true)]
    pub http_addr: Option<SocketAddr>,

    /// Enable OTLP metrics export over gRPC (e.g. http://127.0.0.1:4317). Leave empty to disable.
    #[arg(long, global = true)]
    pub metrics_otel_endpoint: Option<String>,

    /// Period (seconds) for exporting OTLP metrics (only used when endpoint is set).
    #[arg(long, global = true, default_value_t = 5)]
    pub metrics_period_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a rendezvous store until Ctrl+C
    Master(MasterArgs),
    /// Run one side of a prompt/decoder block exchange
    Datadist(DataDistArgs),
    /// Run one rank of the two-rank object store exchange
    Store(StoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MasterArgs {
    /// Address to bind, e.g. 0.0.0.0:50051
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub addr: SocketAddr,
}

impl Command {
    fn node_name(&self) -> String {
        match self {
            Command::Master(_) => "master".to_string(),
            Command::Datadist(args) => args.role.to_string(),
            Command::Store(args) => format!("store-{}", args.device_id),
        }
    }
}

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_span_events(FmtSpan::CLOSE);
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

fn init_metrics(
    endpoint: Option<String>,
    period_secs: u64,
) -> Result<Option<SdkMeterProvider>, Box<dyn Error>> {
    let Some(endpoint) = endpoint.filter(|s| !s.is_empty()) else {
        info!("OTLP metrics disabled (no endpoint configured or endpoint is empty)");
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(period_secs))
        .build();

    let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();

    global::set_meter_provider(meter_provider.clone());
    info!("OTLP metrics exporter enabled (period={}s)", period_secs);

    Ok(Some(meter_provider))
}

async fn run_master(args: MasterArgs, status: SharedStatus) -> Result<(), Box<dyn Error>> {
    let server = RendezvousServer::bind(args.addr).await?;
    status.write().phase = "serving".to_string();
    info!("Rendezvous master on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    info!(
        "Master state at shutdown: keys={} pending_barriers={}",
        server.key_count(),
        server.pending_barriers()
    );
    server.shutdown().await;
    Ok(())
}

/// Main entry point for the kvlink node binary
pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        // OTLP export needs the Tokio runtime for gRPC
        let meter_provider = init_metrics(cli.metrics_otel_endpoint, cli.metrics_period_secs)?;

        let status = new_status(cli.command.node_name());
        let shutdown = Arc::new(Notify::new());
        let http = match cli.http_addr {
            Some(addr) => {
                Some(start_http_server(addr, Arc::clone(&status), Arc::clone(&shutdown)).await?)
            }
            None => None,
        };

        let result = match cli.command {
            Command::Master(args) => run_master(args, Arc::clone(&status)).await,
            Command::Datadist(args) => datadist_node::run(args, Arc::clone(&status)).await,
            Command::Store(args) => store_node::run(args, Arc::clone(&status)).await,
        };
        match &result {
            Ok(()) => info!("Node finished"),
            Err(err) => {
                error!("Node failed: {err}");
                status.write().error = Some(err.to_string());
            }
        }

        shutdown.notify_one();
        if let Some(handle) = http
            && let Err(err) = handle.await
        {
            error!("HTTP server task failed: {err}");
        }

        // Flush metrics before exit
        if let Some(provider) = meter_provider
            && let Err(err) = provider.shutdown()
        {
            error!("Failed to shutdown metrics provider: {err}");
        }

        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlink_core::store::Schema;

    #[test]
    fn parses_master_command() {
        let cli = Cli::parse_from(["kvlink", "master", "--addr", "0.0.0.0:50051"]);
        match cli.command {
            Command::Master(args) => assert_eq!(args.addr.port(), 50051),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(cli.metrics_otel_endpoint.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_store_command_with_global_flags() {
        let cli = Cli::parse_from([
            "kvlink",
            "store",
            "--device-id",
            "1",
            "--schema",
            "d2h",
            "--tensor-size",
            "8mb",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.command.node_name(), "store-1");
        match cli.command {
            Command::Store(args) => {
                assert_eq!(args.schema, Schema::D2H);
                assert_eq!(args.tensor_size, 8 * 1024 * 1024);
                assert_eq!(args.global_segment_size, 1024 * 1024 * 1024);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_schema() {
        assert!(Cli::try_parse_from(["kvlink", "store", "--schema", "x2y"]).is_err());
    }
}
