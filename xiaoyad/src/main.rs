use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use xiaoyad::config::{Args, DaemonConfig, INVALID_CONFIG_STATUS};
use xiaoyad::daemon::Daemon;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match DaemonConfig::try_from(Args::parse()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return exit_code(INVALID_CONFIG_STATUS);
        }
    };

    let daemon = Daemon::new(config);
    tokio::select! {
        result = daemon.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(stage = %err.stage, error = %err, "run aborted");
                exit_code(err.exit_status())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            ExitCode::SUCCESS
        }
    }
}
