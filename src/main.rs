use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod config;
mod gate;
mod media;
mod notify;
mod server;
mod utils;

use config::Config;
use gate::RequestGate;
use media::MediaDownloader;
use notify::{Notice, Notifier};
use server::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<String>,
}

fn get_config_path(args: &Args) -> Option<String> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }

    if let Ok(path) = std::env::var("CONFIG_FILE") {
        return Some(path);
    }

    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        let config_path = format!("{}/clipdrop/config.toml", xdg_config_home);
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let config_path = format!("{}/.config/clipdrop/config.toml", home.display());
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = get_config_path(&args);

    let mut config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::default(),
    };
    config.apply_env();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.get_logging_format() == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("Starting clipdrop...");
    match &config_path {
        Some(path) => info!("Loaded config from: {}", path),
        None => info!("No config file found, using defaults and environment"),
    }

    config.validate().context("Invalid configuration")?;
    let bind_addr = config.bind_addr()?;

    let downloader = MediaDownloader::new(config.download_settings())
        .context("Failed to initialize media downloader")?;
    downloader.prepare().await?;

    // A missing downloader is reported on every request, so startup continues
    if !downloader.test_setup().await {
        warn!("Downloader is not available, downloads will fail until it is installed");
    }

    media::janitor::spawn(
        downloader.settings().scratch_dir.clone(),
        Duration::from_secs(config.janitor.interval_secs),
        Duration::from_secs(config.janitor.max_age_secs),
    );

    let notifier = Notifier::from_config(&config).context("Failed to configure notices")?;
    let state = Arc::new(AppState::new(
        RequestGate::new(config.rate_window(), config.rate_limit.capacity),
        downloader,
        notifier.clone(),
        config.server.trust_proxy_headers,
    ));
    let app = server::router(state, &config.server.allowed_origins)?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on http://{}", bind_addr);

    notifier.notify(Notice::Startup {
        version: env!("CARGO_PKG_VERSION").to_string(),
        bind: bind_addr.to_string(),
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server error")?;

    Ok(())
}
