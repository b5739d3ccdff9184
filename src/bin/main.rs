use clap::Parser;
use netgauge::api::{router, AppState};
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "netgauge")]
#[command(about = "Network performance measurement service (iperf3 client + TWAMP analysis)", long_about = None)]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Bind to a specific address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netgauge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let state = Arc::new(AppState::new());

    let app = router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = (cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("netgauge listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
