use clap::Parser;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use paramedic::config::{CliArgs, RunConfig};
use paramedic::paramedic::{Paramedic, EXIT_NON_TEST_FAILURE};
use paramedic::process::port::TcpProbe;
use paramedic::toolchain::CordovaToolchain;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();

    let config = match RunConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("paramedic: {}", e);
            return Ok(ExitCode::from(EXIT_NON_TEST_FAILURE));
        }
    };

    let _log_guard = init_tracing(&config)?;

    info!("Starting paramedic v{}", env!("CARGO_PKG_VERSION"));
    for target in &config.targets {
        info!(
            "Target: {} ({}{})",
            target.platform_spec,
            target.action.as_str(),
            target
                .args
                .as_deref()
                .map(|a| format!(" {}", a))
                .unwrap_or_default()
        );
    }
    info!("Plugins: {}", config.plugins.join(", "));
    info!("Ports: {}-{}", config.ports.start, config.ports.end);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(cancel_tx));

    let toolchain = CordovaToolchain::new(&config);
    let paramedic = Paramedic::new(&config, &toolchain, &TcpProbe).with_cancel(cancel_rx);
    let code = paramedic.run().await.exit_code();

    // Returning instead of exiting lets the log guard flush the file layer
    Ok(ExitCode::from(code))
}

/// Console output always; a `paramedic.log` next to the device logs when an
/// output directory is configured. `RUST_LOG` overrides the default filter.
fn init_tracing(config: &RunConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if config.verbose {
        "paramedic=debug,tower_http=debug"
    } else {
        "paramedic=info,tower_http=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, guard) = match &config.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "paramedic.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// First Ctrl+C cancels the run and lets teardown finish; a second one
/// exits immediately.
async fn shutdown_signal(cancel: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    error!("Received shutdown signal, cleaning up. Press Ctrl+C again to exit now");
    cancel.send_replace(true);

    if tokio::signal::ctrl_c().await.is_ok() {
        error!("Received second shutdown signal, exiting");
        std::process::exit(i32::from(EXIT_NON_TEST_FAILURE));
    }
}
