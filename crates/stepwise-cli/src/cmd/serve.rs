use anyhow::Context;
use stepwise_core::config::{Config, WarnLevel};
use std::path::Path;

pub fn run(config_path: Option<&Path>, port: u16) -> anyhow::Result<()> {
    let config = Config::discover(config_path).context("failed to load config")?;

    let mut fatal = false;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => {
                tracing::error!("{}", w.message);
                fatal = true;
            }
        }
    }
    if fatal {
        anyhow::bail!("refusing to start with an invalid config (see `stepwise config check`)");
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(stepwise_server::serve(config, port))
}
