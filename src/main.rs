//! Daemon entry point.

use std::{process::ExitCode, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};

use bluealsad::{config::Config, engine::Engine, hci};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::from_args() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("bluealsad: {err}");
            return ExitCode::from(1);
        }
    };
    log::debug!("configuration: {config:?}");

    let (engine, events) = Engine::new(config.clone());

    match hci::enumerate() {
        Ok(adapters) => {
            for info in adapters {
                if !config.serves_adapter(&info.name) {
                    continue;
                }
                log::info!("serving adapter {} ({})", info.name, info.address);
                let adapter = engine.add_adapter(info);
                adapter.start_sco_dispatcher();
            }
        }
        Err(err) => log::warn!("cannot enumerate Bluetooth adapters: {err}"),
    }

    let rpc = match bluealsad::rpc::serve(engine.clone(), events).await {
        Ok(rpc) => rpc,
        Err(err) => {
            log::error!("cannot register on the message bus: {err}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = bluealsad::bluez::register(&rpc).await {
        log::warn!("cannot register with the Bluetooth daemon: {err}");
    }

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            log::error!("cannot install signal handler: {err}");
            return ExitCode::from(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("interrupted, shutting down"),
        _ = sigterm.recv() => log::info!("terminated, shutting down"),
    }

    engine.shutdown();
    ExitCode::SUCCESS
}
