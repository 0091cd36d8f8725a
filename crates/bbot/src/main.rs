use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use bbot_core::{bot::BotCore, config::Config};
use bbot_stdio::StdioSource;

fn main() -> Result<(), bbot_core::Error> {
    bbot_core::logging::init("bbot")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let res = rt.block_on(run());
    // A pending stdin read cannot be cancelled; do not wait for it.
    rt.shutdown_background();
    res
}

async fn run() -> Result<(), bbot_core::Error> {
    let cfg = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            return Err(e);
        }
    };
    tracing::info!(data_dir = %cfg.data_dir.display(), workers = cfg.workers, "bbot starting");

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let core = BotCore::builder(cfg, Arc::new(StdioSource::stdio()))
        .builtin_handlers()
        .build();

    let report = core.run(shutdown).await?;
    if report.aborted_lanes > 0 || !report.flushed {
        tracing::warn!(?report, "stopped without a clean drain");
    }
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM (what the supervisor sends).
async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
