use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::signal::unix::{signal, SignalKind};

use xrelay::config::ConfigManager;
use xrelay::manager::PathManager;
use xrelay::stats::Stats;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_manager = ConfigManager::new()?;
    let settings = config_manager.settings().clone();

    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, settings.log_level.clone());
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .init();

    let stats = Arc::new(Stats::new());
    // upstream session drivers are supplied by embedders; the standalone
    // binary serves push publishers
    let manager = PathManager::new(&settings, stats, None);
    let handle = manager.handle();
    let manager_task = tokio::spawn(manager.run());

    log::info!(
        "path manager started ({} configured paths)",
        settings.paths.len()
    );

    let mut reload_signal = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown requested");
                handle.close();
                break;
            }
            _ = reload_signal.recv() => {
                match config_manager.reload() {
                    Ok(()) => handle.reload(config_manager.settings().paths.clone()),
                    Err(err) => log::error!("configuration reload failed: {}", err),
                }
            }
        }
    }

    manager_task.await?;
    Ok(())
}
