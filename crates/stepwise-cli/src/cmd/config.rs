use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use stepwise_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Check,

    /// Print the effective config, defaults filled in
    Show,
}

pub fn run(path: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::discover(path).context("failed to load config")?;
    match subcmd {
        ConfigSubcommand::Check => check(&config, json),
        ConfigSubcommand::Show => show(&config, json),
    }
}

fn check(config: &Config, json: bool) -> anyhow::Result<()> {
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

/// Seeded subscription secrets are masked.
fn show(config: &Config, json: bool) -> anyhow::Result<()> {
    let mut config = config.clone();
    for seed in &mut config.webhooks.subscriptions {
        if seed.subscription.secret.is_some() {
            seed.subscription.secret = Some("********".to_string());
        }
    }

    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}
