use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tw_data::BaselineTable;
use tw_engine::{SearchConfig, SearchDriver, SyntheticTrainer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = SearchConfig::from_env().context("loading search config")?;
    let baselines = BaselineTable::load(&config.builtin_rewards, &config.random_rewards)
        .with_context(|| {
            format!(
                "loading baselines from {} and {}",
                config.builtin_rewards.display(),
                config.random_rewards.display()
            )
        })?;
    baselines
        .require_all(&config.envs)
        .context("every searched environment needs both baselines")?;

    tracing::info!(
        envs = %config.env_label(),
        trainer = %config.trainer,
        frames = config.frames,
        save_interval = config.save_interval(),
        gpus = config.num_gpus,
        max_trials = config.max_trials,
        "starting Tunewell search"
    );

    let factory = Arc::new(SyntheticTrainer::new(config.trainer, baselines.clone()));
    let driver = SearchDriver::from_config(&config, baselines, factory).context("setting up search")?;
    let report = driver.run().await.context("running search")?;

    match &report.summary.best_trial {
        Some(best) => tracing::info!(
            study = %report.summary.name,
            trial = best.number,
            value = ?best.value,
            params = %best.params,
            artifact = ?report.artifact,
            "best trial"
        ),
        None => tracing::warn!(study = %report.summary.name, "search produced no completed trial"),
    }
    Ok(())
}
