/* Tie everything together: parse CLI, initialize logging, open the requested ports and
    keep them open until SIGINT/SIGTERM. */

use log::{error, info};
use std::process::ExitCode;
use wsproxy::{config::parse, logging::init, ProxyManager};

fn main() -> ExitCode {
    init();

    let cli = parse();
    let mut manager = ProxyManager::new(cli.proxy_config());
    for &port in &cli.ports {
        if !manager.open(port) {
            error!(
                "Failed to open port {}: {}",
                port,
                manager.error_message(port).unwrap_or("unknown error")
            );
        }
    }

    let active = manager.active_ports();
    if active.is_empty() {
        error!("No port could be opened");
        return ExitCode::FAILURE;
    }
    info!(
        "Proxy active on ports {}",
        active
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    if let Err(e) = wait_for_shutdown() {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Closing all active ports");
    manager.close_all();
    ExitCode::SUCCESS
}

// Each port runs its own loop; this one only waits for a signal.
fn wait_for_shutdown() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received");
        Ok::<(), std::io::Error>(())
    })
}
