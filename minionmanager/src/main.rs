// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minion Manager daemon entry point.

use anyhow::Result;
use clap::Parser;
use minionmanager::manager::MinionPoolManager;
use minionmanager::route;
use minionmanager::rpc::HttpClientFactory;
use minionmanager::store::EtcdStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Minion Manager command line arguments
#[derive(Parser, Debug)]
#[command(name = "minionmanager")]
#[command(about = "Mariner Minion Manager - minion pool lifecycle management service")]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("minionmanager={},warn", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let settings = common::setting::get_config();
    info!("Starting Mariner Minion Manager");
    info!("etcd endpoint: {}", settings.etcd.endpoint);

    let manager = MinionPoolManager::new(
        Arc::new(EtcdStore::new()),
        Arc::new(HttpClientFactory::new()),
        settings.minion_manager.taskflow_max_workers,
    );
    manager
        .initialize()
        .await
        .map_err(|err| anyhow::anyhow!("initialization failed: {}", err))?;
    let cron_handle = manager.start_cron();

    let app = route::router(manager.clone());
    let bind_address = format!("{}:{}", settings.bind.address, settings.bind.port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Minion Manager listening on {}", bind_address);

    let server = async move { axum::serve(listener, app).await };
    tokio::select! {
        served = server => {
            served?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down Minion Manager");
        }
    }

    cron_handle.abort();
    manager.shutdown().await;
    Ok(())
}
