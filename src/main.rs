#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use push_relay::config::Config;
use push_relay::{EngineBuilder, telemetry};
use tokio::sync::watch;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Phase 1: Configuration and process setup
    let config = Config::load();
    let telemetry_guard = telemetry::init_telemetry(&config.telemetry)?;

    push_relay::setup_panic_hook();

    if let Some(path) = &config.pid_file {
        push_relay::write_pid_file(path)?;
        tracing::info!(path = %path.display(), "Wrote pid file");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    push_relay::spawn_signal_handler(shutdown_tx);

    // Phase 2: Store, reclaim, app registry. Nothing is claimed until this succeeds.
    let engine = match EngineBuilder::new(config.clone()).build().instrument(tracing::info_span!("boot_engine")).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Push engine failed to start");
            telemetry_guard.shutdown();
            return Err(e.into());
        }
    };
    tracing::info!(apps = engine.registry.len(), "Push engine started");

    // Phase 3: Run until a shutdown signal arrives
    engine.run(shutdown_rx).await;

    if let Some(path) = &config.pid_file
        && let Err(e) = std::fs::remove_file(path)
    {
        tracing::warn!(error = %e, "Failed to remove pid file");
    }

    telemetry_guard.shutdown();
    Ok(())
}
