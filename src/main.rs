use std::future::{Future, IntoFuture};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sfu_signal::config::{AppConfig, ConfigStore};
use sfu_signal::engine;
use sfu_signal::events::{EventBus, SessionEvent};
use sfu_signal::session::{MediaGateway, SessionContext};
use sfu_signal::state::AppState;
use sfu_signal::web;

type ServerFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// SFU Signal command line arguments
#[derive(Parser, Debug)]
#[command(name = "sfu-signal")]
#[command(version, about = "Signaling and session orchestration for a WebRTC SFU", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML); created with defaults if missing
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// HTTPS port (overrides config file)
    #[arg(long, value_name = "PORT")]
    https_port: Option<u16>,

    /// Enable HTTPS (overrides config file)
    #[arg(long)]
    enable_https: bool,

    /// Path to SSL certificate file (generates self-signed if not provided)
    #[arg(long, value_name = "FILE", requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file
    #[arg(long, value_name = "FILE", requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,

    /// IP the media transports listen on (overrides config file)
    #[arg(long, value_name = "IP")]
    listen_ip: Option<String>,

    /// Address announced in ICE candidates (overrides config file)
    #[arg(long, value_name = "ADDRESS")]
    announced_address: Option<String>,

    /// Data directory for generated certificates (default: /var/lib/sfu-signal)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    // Install default crypto provider (required by rustls 0.23+)
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing::info!("Starting SFU Signal v{}", env!("CARGO_PKG_VERSION"));

    let file_store = ConfigStore::load(args.config.as_deref()).await?;
    if let Some(path) = file_store.path() {
        tracing::info!("Configuration file: {}", path.display());
    }
    let mut config = (*file_store.get()).clone();
    apply_cli_overrides(&args, &mut config);
    config.validate()?;
    // CLI overrides apply to this run only
    let config_store = ConfigStore::in_memory(config.clone());

    let events = Arc::new(EventBus::new());

    // Engine start failure is fatal; there is no retry
    let media_engine = match engine::start(&config.media).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to start media engine: {}", e);
            anyhow::bail!("media engine failed to start: {}", e);
        }
    };
    tracing::info!(
        "Media engine '{}' started (RTC ports {}-{})",
        media_engine.name(),
        config.media.rtc_min_port,
        config.media.rtc_max_port
    );

    let gateway = MediaGateway::initialize(media_engine, &config.media);
    let session = Arc::new(SessionContext::new(
        gateway,
        events.clone(),
        &config.signaling,
    ));
    session.spawn_engine_observer();
    spawn_engine_death_watcher(&events, config.media.worker_died_grace_ms);

    let (shutdown_tx, _) = broadcast::channel(1);
    let state = AppState::new(config_store, session.clone(), shutdown_tx.clone());

    let app = web::create_router(state.clone());

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let bind_port = if config.web.https_enabled {
        config.web.https_port
    } else {
        config.web.http_port
    };
    let listener = bind_tcp_listener(SocketAddr::new(bind_ip, bind_port))?;
    let local_addr = listener.local_addr()?;

    // Setup graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    let server: ServerFuture = if config.web.https_enabled {
        let tls_config = load_tls_config(&config, args.data_dir.clone()).await?;
        tracing::info!("Starting HTTPS server on {}", local_addr);
        Box::pin(
            axum_server::from_tcp_rustls(listener, tls_config).serve(app.into_make_service()),
        )
    } else {
        tracing::info!("Starting HTTP server on {}", local_addr);
        let listener = tokio::net::TcpListener::from_std(listener)?;
        Box::pin(axum::serve(listener, app).into_future())
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
    }

    session.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "sfu_signal=error,tower_http=error",
        LogLevel::Warn => "sfu_signal=warn,tower_http=warn",
        LogLevel::Info => "sfu_signal=info,tower_http=info",
        LogLevel::Verbose => "sfu_signal=debug,tower_http=info",
        LogLevel::Debug => "sfu_signal=debug,tower_http=debug",
        LogLevel::Trace => "sfu_signal=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn apply_cli_overrides(args: &CliArgs, config: &mut AppConfig) {
    if let Some(address) = &args.address {
        config.web.bind_address = address.clone();
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(port) = args.https_port {
        config.web.https_port = port;
    }
    if args.enable_https {
        config.web.https_enabled = true;
    }
    if let (Some(cert), Some(key)) = (&args.ssl_cert, &args.ssl_key) {
        config.web.ssl_cert_path = Some(cert.to_string_lossy().to_string());
        config.web.ssl_key_path = Some(key.to_string_lossy().to_string());
    }
    if let Some(ip) = &args.listen_ip {
        config.media.listen_ip = ip.clone();
    }
    if let Some(address) = &args.announced_address {
        config.media.announced_address = Some(address.clone());
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SFU_SIGNAL_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/var/lib/sfu-signal")
}

fn bind_tcp_listener(addr: SocketAddr) -> anyhow::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Custom certificate from config, otherwise a self-signed one under the data dir
async fn load_tls_config(
    config: &AppConfig,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<RustlsConfig> {
    if let (Some(cert_path), Some(key_path)) =
        (&config.web.ssl_cert_path, &config.web.ssl_key_path)
    {
        return Ok(RustlsConfig::from_pem_file(cert_path, key_path).await?);
    }

    let cert_dir = data_dir.unwrap_or_else(get_data_dir).join("certs");
    let cert_path = cert_dir.join("server.crt");
    let key_path = cert_dir.join("server.key");

    // Only generate when missing
    if !cert_path.exists() || !key_path.exists() {
        tracing::info!("Generating new self-signed TLS certificate");
        let cert = generate_self_signed_cert()?;
        tokio::fs::create_dir_all(&cert_dir).await?;
        tokio::fs::write(&cert_path, cert.cert.pem()).await?;
        tokio::fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    } else {
        tracing::info!("Using existing TLS certificate from {}", cert_dir.display());
    }

    Ok(RustlsConfig::from_pem_file(&cert_path, &key_path).await?)
}

/// Generate a self-signed TLS certificate
fn generate_self_signed_cert() -> anyhow::Result<rcgen::CertifiedKey> {
    use rcgen::generate_simple_self_signed;

    let subject_alt_names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];

    let certified_key = generate_simple_self_signed(subject_alt_names)?;
    Ok(certified_key)
}

/// Exit the process once the engine worker is gone.
///
/// Nothing can recover a dead worker; the grace delay lets in-flight
/// responses and logs flush.
fn spawn_engine_death_watcher(events: &Arc<EventBus>, grace_ms: u64) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::EngineDied { reason }) => {
                    tracing::error!(
                        "Media engine died ({}), exiting in {} ms",
                        reason,
                        grace_ms
                    );
                    tokio::time::sleep(Duration::from_millis(grace_ms)).await;
                    std::process::exit(1);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
