//! Deployment indexer entrypoint.
//!
//! Starts one monitor loop per configured chain and runs until SIGINT or
//! SIGTERM. Exit codes: 0 on a normal shutdown, 1 on a fatal
//! initialization error (missing API key, no chain monitor could start).
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `ARKHAM_API_KEY` (required), `ARKHAM_API_URL`
//! - `DB_PATH`, `LOG_FILE`, `LOG_LEVEL`
//! - `BLOCK_CHECK_INTERVAL`, `BATCH_SIZE`
//! - `OTEL_*` variables enable OTLP span export

use clap::Parser;
use dotenvy::dotenv;
use std::process::ExitCode;

use deployscan::config::{CliArgs, Config};
use deployscan::sig_down::SigDown;
use deployscan::supervisor::Supervisor;
use deployscan::telemetry::Telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env variables
    dotenv().ok();

    let args = CliArgs::parse();
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(1);
        }
    };

    let _telemetry = match Telemetry::init(config.log_level(), config.log_file()) {
        Ok(telemetry) => telemetry,
        Err(error) => {
            eprintln!("failed to set up logging: {error}");
            return ExitCode::from(1);
        }
    };

    let sig_down = match SigDown::try_new() {
        Ok(sig_down) => sig_down,
        Err(error) => {
            tracing::error!("failed to register signal handlers: {error}");
            return ExitCode::from(1);
        }
    };

    let supervisor = match Supervisor::start(&config, &args, sig_down.cancellation_token()).await {
        Ok(supervisor) => supervisor,
        Err(error) => {
            tracing::error!("fatal: {error}");
            return ExitCode::from(1);
        }
    };

    supervisor.run().await;
    ExitCode::SUCCESS
}
