use anyhow::{Context, Result};
use device_link::{
    DeviceLink, config::AppConfig, hooks::MergeStateHooks, network_stack::NmcliNetworkStack,
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let network = NmcliNetworkStack::new(&config.interface, config.timing.join_timeout);

    let device = DeviceLink::new(config.device.clone(), network, MergeStateHooks::default())
        .with_timing(config.timing)
        .with_ports(config.ports)
        .with_storage_root(&config.storage_path);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
            info!("shutting down");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
            info!("shutting down");
        },
        result = device.run() => {
            let reason = result?;
            info!("restarting device: {reason}");
            // the supervisor brings the service up again
            std::process::exit(0);
        }
    }

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}
