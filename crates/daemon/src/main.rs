//! farod: personal Electrum server over a trusted Bitcoin node.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::Duration;

use faro_log::{log_error, log_info};
use faro_node::PersistentNode;
use faro_store::Index;
use faro_sync::{Engine, EngineConfig};

use crate::config::Config;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("farod: {err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    faro_log::init(config.log);

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let index = Index::open(&config.db_path)?;
    log_info!(
        "database at {}; network {}; {} wallets",
        config.db_path.display(),
        config.network.as_str(),
        config.wallets.len()
    );

    let node = PersistentNode::new(config.node_addr.clone(), config.network);
    let engine = Arc::new(Engine::new(
        EngineConfig::new(config.network, config.wallets),
        index,
        node,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut engine_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        let shutdown = shutdown_rx.clone();
        async move { engine.run(shutdown).await }
    });
    let mut server_task = tokio::spawn({
        let listen_addr = config.listen_addr.clone();
        let engine = Arc::clone(&engine);
        async move { faro_electrum::serve(&listen_addr, engine, shutdown_rx).await }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log_info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            log_info!("terminate received, shutting down");
        }
        result = &mut engine_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    log_error!("sync engine failed: {err}");
                    Err(Box::new(err) as Box<dyn std::error::Error>)
                }
                Err(join_err) => Err(Box::new(join_err) as Box<dyn std::error::Error>),
            };
        }
        result = &mut server_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    log_error!("electrum server failed: {err}");
                    Err(Box::new(err) as Box<dyn std::error::Error>)
                }
                Err(join_err) => Err(Box::new(join_err) as Box<dyn std::error::Error>),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, engine_task).await;
    server_task.abort();
    log_info!("farod stopped");
    Ok(())
}
