//! ssvirt-reconciler: all controllers run as concurrent tokio tasks within
//! a single binary, sharing a common Context.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

use ssvirt_reconciler::cluster::KubeClusterClient;
use ssvirt_reconciler::controller::{self, Context};
use ssvirt_reconciler::helpers::ControllerSettings;
use ssvirt_reconciler::metrics::{Metrics, NoopMetrics, OtelMetrics};
use ssvirt_reconciler::postgres::PgStore;
use ssvirt_reconciler::store::Repositories;

#[derive(Parser, Debug)]
#[command(
    name = "ssvirt-reconciler",
    about = "Keeps the SSVirt database and the KubeVirt cluster convergent"
)]
struct Args {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Create tables and indexes before starting.
    #[arg(long, env = "APPLY_SCHEMA")]
    apply_schema: bool,

    /// Maximum concurrent reconciles per controller.
    #[arg(long, default_value_t = 8, env = "CONCURRENCY")]
    concurrency: usize,

    /// Seconds between full VDC scans.
    #[arg(long, default_value_t = 120, env = "VDC_POLL_INTERVAL")]
    vdc_poll_interval: u64,

    /// Seconds between full Organization scans.
    #[arg(long, default_value_t = 120, env = "ORGANIZATION_POLL_INTERVAL")]
    organization_poll_interval: u64,

    /// Seconds before a reconciled VM is looked at again.
    #[arg(long, default_value_t = 300, env = "VM_RESYNC_INTERVAL")]
    vm_resync_interval: u64,

    /// Seconds before a reconciled vApp is looked at again.
    #[arg(long, default_value_t = 300, env = "VAPP_RESYNC_INTERVAL")]
    vapp_resync_interval: u64,

    /// Seconds an unchanged VM status is trusted before it is rewritten.
    #[arg(long, default_value_t = 600, env = "STATUS_STALENESS_WINDOW")]
    status_staleness_window: u64,

    /// Seconds to wait before retrying a failed reconcile.
    #[arg(long, default_value_t = 60, env = "ERROR_REQUEUE_DELAY")]
    error_requeue_delay: u64,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Drop all measurements instead of recording them on the global meter.
    #[arg(long, env = "NO_METRICS")]
    no_metrics: bool,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

impl Args {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            vdc_poll_interval: Duration::from_secs(self.vdc_poll_interval),
            organization_poll_interval: Duration::from_secs(self.organization_poll_interval),
            vm_resync_interval: Duration::from_secs(self.vm_resync_interval),
            vapp_resync_interval: Duration::from_secs(self.vapp_resync_interval),
            status_staleness_window: Duration::from_secs(self.status_staleness_window),
            error_requeue_delay: Duration::from_secs(self.error_requeue_delay),
            concurrency: self.concurrency.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let settings = args.settings();
    info!(?settings, "starting ssvirt-reconciler");

    let store = PgStore::connect(&args.database_url)
        .await
        .context("connecting to the database")?;
    if args.apply_schema {
        store.apply_schema().await.context("applying the schema")?;
    }

    let client = Client::try_default().await?;
    let reporter = Reporter {
        controller: "ssvirt-reconciler".into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let metrics: Arc<dyn Metrics> = if args.no_metrics {
        Arc::new(NoopMetrics)
    } else {
        Arc::new(OtelMetrics::new(&opentelemetry::global::meter(
            "ssvirt-reconciler",
        )))
    };

    let ctx = Arc::new(Context {
        cluster: Arc::new(KubeClusterClient::new(client.clone(), reporter)),
        repos: Repositories::from_store(Arc::new(store)),
        metrics,
        settings,
    });

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or(args.health_probe_bind_address)
        .parse()
        .context("invalid --health-probe-bind-address")?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    let cancel = CancellationToken::new();
    let (_, health) = warp::serve(health_routes)
        .try_bind_with_graceful_shutdown(health_addr, cancel.clone().cancelled_owned())
        .context("binding the health probe server")?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        signal_cancel.cancel();
    });

    // The kube-runtime controllers stop on the same signals by themselves;
    // the database-driven loops stop on the token.
    tokio::join!(
        controller::vm_status::run(client.clone(), ctx.clone()),
        controller::vm_status::run_sweeper(ctx.clone(), cancel.clone()),
        controller::vapp_status::run(client.clone(), ctx.clone()),
        controller::vdc::run(client.clone(), ctx.clone(), cancel.clone()),
        controller::organization::run(client, ctx, cancel),
        health,
    );

    info!("ssvirt-reconciler stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
