use cascade_config::load_config;
use cascade_config::shared::WorkerConfig;

/// Loads the worker configuration and rejects incomplete settings before anything connects.
pub fn load_worker_config() -> anyhow::Result<WorkerConfig> {
    let config = load_config::<WorkerConfig>()?;
    config.validate()?;

    Ok(config)
}
