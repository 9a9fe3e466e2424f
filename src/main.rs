use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use tilehost::config::Config;
use tilehost::mbtiles::FileSources;
use tilehost::render::RenderPools;
use tilehost::server::{self, AppState};
use tilehost::style;

/// Map tile server over MBTiles archives with headless MapLibre rendering.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "ConfigurationFile", default_value = "config.json")]
    config: PathBuf,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Bind port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Semicolon-separated CORS origins; unset allows any origin
    #[arg(long, env = "AllowedOrigins")]
    allowed_origins: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let threads = config.options.threads.unwrap_or_else(num_cpus::get);

    info!("starting server with {} threads", threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, config))
}

async fn async_main(args: Args, config: Config) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("tilehost/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let sources = FileSources::new().await?;
    let data = style::load_data(&config, &sources).await;
    info!("loaded {} data sources", data.len());
    let styles = style::load_styles(&config, &data, &http).await;
    info!("loaded {} styles", styles.len());
    let renderers = RenderPools::build(&styles, &data, &config.options).await?;

    let state = Arc::new(AppState {
        options: config.options,
        styles,
        data,
        sources,
        renderers,
        http,
        templates: server::templates()?,
    });

    let app = server::router(Arc::clone(&state))
        .layer(cors_layer(args.allowed_origins.as_deref()));

    let address = format!("{}:{}", args.address, args.port);
    info!("listening on {}", address);
    let listener = TcpListener::bind(&address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down worker pools");
    state.renderers.dispose();
    state.sources.dispose();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    match allowed_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(';')
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(origins))
        }
        None => layer.allow_origin(Any),
    }
}
