//! Sentinel Certificate Monitor - Main entry point
//!
//! Runs the renewal engine as an agent sidecar. It watches the certificate
//! directory maintained by the caching agent and falls back to HTTP issuance
//! when that falls behind. Published certificates are written back into the
//! same directory, where the processes that read the files pick them up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use sentinel_certmon::{
    CertMonitor, CertMonitorConfig, CertificateValue, DirectoryCache, FileTokenStore, HttpIssuer,
    IdentityRequest, RenewalMetrics, StaticTokenStore, TokenStore,
};
use sentinel_certmon_config::{check_files, AgentConfig};

/// Sentinel certificate monitor - keeps an agent's mTLS identity fresh
#[derive(Parser, Debug)]
#[command(name = "sentinel-certmon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTMON_CONFIG",
        default_value = "/etc/sentinel-certmon/certmon.toml"
    )]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    if cli.test {
        return test_config(&cli.config);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run(&cli.config))
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Test configuration file and exit
fn test_config(config_path: &Path) -> Result<()> {
    info!("Testing configuration file: {}", config_path.display());
    let config = AgentConfig::from_file(config_path).context("Failed to load configuration file")?;

    let report = check_files(&config);
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    for problem in &report.errors {
        error!("{}", problem);
    }
    if !report.is_ok() {
        bail!("Configuration test failed with {} error(s)", report.errors.len());
    }

    info!("Configuration test successful:");
    info!("  - node {} in {}", config.identity.node_name, config.identity.datacenter);
    info!("  - cache directory {}", config.cache.directory.display());
    info!("  - issuer {}", config.issuer.url);

    println!(
        "sentinel-certmon: configuration file {} test is successful",
        config_path.display()
    );
    Ok(())
}

/// Run the monitor until SIGTERM or SIGINT
async fn run(config_path: &Path) -> Result<()> {
    info!("Loading configuration from: {}", config_path.display());
    let config = AgentConfig::from_file(config_path).context("Failed to load configuration file")?;

    let monitor_config = CertMonitorConfig {
        fallback_leeway: config.renewal.fallback_leeway(),
        fallback_retry: config.renewal.fallback_retry(),
        identity: IdentityRequest {
            dns_sans: config.identity.dns_sans.clone(),
            ip_sans: config.identity.ip_sans.clone(),
            datacenter: config.identity.datacenter.clone(),
            node_name: config.identity.node_name.clone(),
        },
        initial: load_initial(&config)?,
    };

    std::fs::create_dir_all(&config.cache.directory).with_context(|| {
        format!(
            "Failed to create cache directory {}",
            config.cache.directory.display()
        )
    })?;
    let cache = DirectoryCache::new(&config.cache.directory).with_file_names(
        config.cache.cert_file.clone(),
        config.cache.key_file.clone(),
        config.cache.ca_file.clone(),
    );

    let issuer_url = Url::parse(&config.issuer.url).context("Invalid issuer URL")?;
    let issuer =
        HttpIssuer::new(issuer_url, config.issuer.timeout()).context("Failed to create issuer")?;

    let tokens: Arc<dyn TokenStore> = match &config.issuer.token_file {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(StaticTokenStore::new(config.issuer.token.clone())),
    };

    let registry = Registry::new();
    let metrics = RenewalMetrics::new().context("Failed to create metrics")?;
    metrics
        .register(&registry)
        .context("Failed to register metrics")?;

    let cache = Arc::new(cache);
    let handle = CertMonitor::new(
        monitor_config,
        cache.clone(),
        Arc::new(issuer),
        tokens,
        cache,
    )
    .with_metrics(metrics)
    .with_resubscribe_delay(config.renewal.resubscribe_delay())
    .start()
    .await
    .context("Failed to start certificate monitor")?;

    let shutdown = CancellationToken::new();
    let metrics_task = config.metrics_file.clone().map(|path| {
        tokio::spawn(write_metrics_periodically(
            registry.clone(),
            path,
            Duration::from_secs(config.metrics_interval_secs),
            shutdown.clone(),
        ))
    });

    wait_for_shutdown_signal().await?;

    shutdown.cancel();
    handle
        .shutdown_and_wait()
        .await
        .context("Certificate monitor did not stop cleanly")?;
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Metrics writer terminated abnormally");
        }
    }

    info!("sentinel-certmon stopped");
    Ok(())
}

fn load_initial(config: &AgentConfig) -> Result<Option<CertificateValue>> {
    let Some(initial) = &config.initial else {
        return Ok(None);
    };

    let read = |path: &Path| {
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
    };
    let cert = read(&initial.cert_file)?;
    let key = read(&initial.key_file)?;
    let ca = initial.ca_file.as_deref().map(read).transpose()?;

    let value = CertificateValue::from_pem(&cert, &key, ca.as_deref())
        .context("Failed to parse initial certificate")?;

    info!(
        path = %initial.cert_file.display(),
        not_after = %value.not_after(),
        "Loaded initial certificate"
    );
    Ok(Some(value))
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "Shutdown signal received"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                info!(signal = "SIGINT", "Shutdown signal received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutdown signal received");
    }

    Ok(())
}

/// Write the registry in the Prometheus text format to `path` every
/// `interval`, and once more on shutdown.
async fn write_metrics_periodically(
    registry: Registry,
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = write_metrics(&registry, &path).await {
                    warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = write_metrics(&registry, &path).await {
                    warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                }
            }
        }
    }
}

async fn write_metrics(registry: &Registry, path: &Path) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;

    let tmp_path = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp_path, &buffer).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), bytes = buffer.len(), "Wrote metrics file");
    Ok(())
}
