//! Roam base daemon
//!
//! Brings one base online and keeps it there until interrupted. The
//! interactive console and the directory server are separate programs;
//! this binary is the host shell they talk to.

use anyhow::Result;
use roam::{Base, DirectoryClient};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };

    // policy is process-wide and fixed from here on
    let sandbox = settings.sandbox().install();

    let base = Base::new(settings.base_config(), sandbox)?;

    // a base that cannot establish its identity cannot run at all
    let address = match base.online().await {
        Ok(address) => address,
        Err(e) => {
            error!("could not go online: {}", e);
            std::process::exit(1);
        }
    };
    info!(address = %address, "base is serving");

    let directory_task = match settings.directory {
        Some(_) => Some(
            DirectoryClient::new()
                .install(&base, settings.directory_poll())
                .await,
        ),
        None => None,
    };

    let mut notices = base.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, going offline");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => info!(?notice, "registry"),
                Err(RecvError::Lagged(skipped)) => {
                    info!(skipped, "registry notices lagged");
                }
                Err(RecvError::Closed) => {
                    tokio::signal::ctrl_c().await.ok();
                    break;
                }
            },
        }
    }

    if let Some(task) = directory_task {
        task.abort();
    }
    base.offline().await;
    info!("base stopped");
    Ok(())
}
