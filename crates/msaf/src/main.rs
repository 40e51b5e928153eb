//! 5G Media Streaming Application Function daemon.

mod config;
mod wiring;

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use config::{AfConfig, Cli};
use wiring::RunError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match AfConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    startup_diagnostics(&config);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutting down");
        shutdown.cancel();
    });

    match wiring::run(config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ RunError::Bind { .. }) => {
            tracing::error!(error = %e, "bind failure");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "runtime failure");
            ExitCode::from(1)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn startup_diagnostics(config: &AfConfig) {
    tracing::info!("msaf v{} starting", env!("CARGO_PKG_VERSION"));
    match hostname::get() {
        Ok(h) => tracing::info!("hostname: {}", h.to_string_lossy()),
        Err(e) => tracing::warn!(error = %e, "could not determine hostname"),
    }
    tracing::info!(
        server_name = %config.server_name,
        api_release = %config.api_release,
        "identity"
    );
    for endpoint in &config.listen {
        tracing::info!(
            role = ?endpoint.name,
            address = %endpoint.address,
            port = endpoint.port,
            http = ?endpoint.http,
            tls = endpoint.tls,
            "configured endpoint"
        );
    }
    for application_server in &config.application_servers {
        tracing::info!(
            host = %application_server.canonical_hostname,
            m3_port = application_server.m3_port,
            "configured application server"
        );
    }
    if config.bsf.is_none() && config.pcf.is_none() {
        tracing::info!("no BSF or PCF configured; policy features are recommendation-only");
    }
    if let Some(nrf) = &config.nrf {
        tracing::info!(endpoint = %nrf.endpoint, "NRF configured; using direct BSF/PCF endpoints for discovery");
    }
}
